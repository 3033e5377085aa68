use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::ConfigError;
use crate::field::{Field, FieldType};
use crate::interval::Interval;
use crate::scope::Scope;
use crate::value::Value;

/// How an ingester's output is persisted and addressed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ResourceKind {
    /// In-place document; latest value only.
    Value,
    /// Increment-indexed values.
    Series,
    /// Time-indexed rows, append-only.
    Timeseries,
    /// Primary-keyed records, replaced by uid.
    Update,
}

/// Dispatch tag selecting the body that fetches raw data for a tick.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IngesterKind {
    HttpApi,
    WsApi,
    EvmCaller,
    EvmLogger,
    SolanaCaller,
    SuiCaller,
    Processor,
}

/// The live value map of an ingester's non-transient fields, as cached in
/// the registry and published on pub/sub.
pub type Snapshot = BTreeMap<String, Value>;

/// A configured data source emitting one row (timeseries) or one keyed
/// record (update) per interval tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ingester {
    pub name: String,
    #[serde(rename = "resource_type", default = "default_resource_kind")]
    pub resource_kind: ResourceKind,
    #[serde(rename = "ingester_type", default = "default_ingester_kind")]
    pub ingester_kind: IngesterKind,
    #[serde(default)]
    pub interval: Interval,
    #[serde(default)]
    pub fields: Vec<Field>,
    /// Defaults inherited by fields that omit their own.
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub transformers: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Protected resources require an admin principal on every surface.
    #[serde(default)]
    pub protected: bool,
    #[serde(skip)]
    pub last_ingested: Option<DateTime<Utc>>,
}

fn default_resource_kind() -> ResourceKind {
    ResourceKind::Timeseries
}

fn default_ingester_kind() -> IngesterKind {
    IngesterKind::HttpApi
}

impl Ingester {
    /// Apply config-load finalization: inject the dispatch kind, push
    /// ingester-level defaults down into fields, add the synthetic `ts` /
    /// `uid` fields, and verify invariants.
    pub fn finalize(mut self, kind: IngesterKind) -> Result<Ingester, ConfigError> {
        self.ingester_kind = kind;

        for field in &mut self.fields {
            if field.tags.is_empty() && !self.tags.is_empty() {
                field.tags = self.tags.clone();
            }
            // Relative targets concatenate onto the ingester base URL.
            if !field.target.is_empty() && !field.target.starts_with("http") && !self.target.is_empty()
            {
                field.target = format!("{}{}", self.target, field.target);
            } else if field.target.is_empty() {
                field.target = self.target.clone();
            }
            if field.selector.is_empty() {
                field.selector = self.selector.clone();
            }
            if field.params.is_null() {
                field.params = self.params.clone();
            }
            if field.transformers.is_empty() && !self.transformers.is_empty() {
                field.transformers = self.transformers.clone();
            }
        }

        match self.resource_kind {
            ResourceKind::Timeseries => {
                if !self.fields.iter().any(|f| f.name == "ts") {
                    self.fields
                        .insert(0, Field::new("ts", FieldType::Timestamp));
                }
            }
            ResourceKind::Update => {
                if !self.fields.iter().any(|f| f.name == "uid") {
                    self.fields.insert(0, Field::new("uid", FieldType::String));
                }
            }
            _ => {}
        }

        let mut seen = hashbrown::HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(ConfigError::DuplicateField {
                    ingester: self.name.clone(),
                    field: field.name.clone(),
                });
            }
        }
        drop(seen);

        Ok(self)
    }

    pub fn signature(&self) -> String {
        let mut sig = format!(
            "{}-{}-{}-{}",
            self.name, self.resource_kind, self.interval, self.ingester_kind
        );
        for field in &self.fields {
            sig.push('-');
            sig.push_str(&field.id());
        }
        sig
    }

    /// Stable identity used in claim keys and registry entries.
    pub fn id(&self) -> String {
        let digest = Md5::digest(self.signature().as_bytes());
        format!("{digest:x}")
    }

    pub fn persistent_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| !f.transient)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    pub fn set_value(&mut self, name: &str, value: Value) {
        if let Some(field) = self.field_mut(name) {
            field.value = value;
        }
    }

    /// Current non-transient values plus the ingestion date, the unit that
    /// lands in the registry and on pub/sub after a successful tick.
    pub fn snapshot(&self) -> Snapshot {
        let mut map: Snapshot = self
            .persistent_fields()
            .map(|f| (f.name.clone(), f.value.clone()))
            .collect();
        map.insert(
            "date".to_string(),
            self.last_ingested.map(Value::Timestamp).unwrap_or(Value::Null),
        );
        map
    }

    /// Restore field values from a cached snapshot (processor bodies start
    /// from the previous tick's committed state).
    pub fn load_snapshot(&mut self, snapshot: &Snapshot) {
        for field in &mut self.fields {
            if let Some(v) = snapshot.get(&field.name) {
                field.value = v.clone();
            }
        }
    }

    /// Names of other ingesters referenced from transformer placeholders
    /// (`{Other.field}`). Scheduling does not order on these; dependents
    /// read whatever snapshot the registry holds.
    pub fn dependencies(&self) -> Vec<String> {
        let own: hashbrown::HashSet<&str> =
            self.fields.iter().map(|f| f.name.as_str()).collect();
        let mut deps = hashbrown::HashSet::new();
        for t in self.fields.iter().flat_map(|f| f.transformers.iter()) {
            let mut rest = t.as_str();
            while let Some(open) = rest.find('{') {
                rest = &rest[open + 1..];
                let Some(close) = rest.find('}') else { break };
                let inner = &rest[..close];
                rest = &rest[close + 1..];
                if inner.contains("::") || inner == "self" {
                    continue;
                }
                if let Some((head, _)) = inner.split_once('.') {
                    if head != self.name && !own.contains(head) && !head.is_empty() {
                        deps.insert(head.to_string());
                    }
                }
            }
        }
        let mut out: Vec<String> = deps.into_iter().collect();
        out.sort();
        out
    }

    /// Scope-masked metadata for `/schema`.
    pub fn describe(&self, scope: Scope) -> serde_json::Value {
        let fields: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .filter(|f| scope.contains(Scope::TRANSIENT) || !f.transient)
            .map(|f| (f.name.clone(), f.describe(scope)))
            .collect();
        serde_json::json!({
            "name": self.name,
            "type": self.resource_kind.to_string(),
            "ingester_type": self.ingester_kind.to_string(),
            "interval": self.interval.to_string(),
            "protected": self.protected,
            "last_ingested": self.last_ingested,
            "fields": fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingester_with_fields(fields: Vec<Field>) -> Ingester {
        Ingester {
            name: "BTCUSD".into(),
            resource_kind: ResourceKind::Timeseries,
            ingester_kind: IngesterKind::HttpApi,
            interval: "m5".parse().unwrap(),
            fields,
            target: String::new(),
            selector: String::new(),
            params: serde_json::Value::Null,
            transformers: Vec::new(),
            tags: Vec::new(),
            protected: false,
            last_ingested: None,
        }
    }

    #[test]
    fn finalize_injects_synthetic_ts_field() {
        let ing = ingester_with_fields(vec![Field::new("price", FieldType::Float64)])
            .finalize(IngesterKind::HttpApi)
            .unwrap();
        assert_eq!(ing.fields[0].name, "ts");
        assert_eq!(ing.fields[0].kind, FieldType::Timestamp);
        assert_eq!(ing.fields[1].name, "price");
    }

    #[test]
    fn finalize_injects_uid_for_update_resources() {
        let mut ing = ingester_with_fields(vec![Field::new("alias", FieldType::String)]);
        ing.resource_kind = ResourceKind::Update;
        let ing = ing.finalize(IngesterKind::Processor).unwrap();
        assert_eq!(ing.fields[0].name, "uid");
        assert_eq!(ing.fields[0].kind, FieldType::String);
    }

    #[test]
    fn finalize_rejects_duplicate_field_names() {
        let ing = ingester_with_fields(vec![
            Field::new("price", FieldType::Float64),
            Field::new("price", FieldType::Float32),
        ]);
        assert!(matches!(
            ing.finalize(IngesterKind::HttpApi),
            Err(ConfigError::DuplicateField { .. })
        ));
    }

    #[test]
    fn fields_inherit_ingester_defaults() {
        let mut ing = ingester_with_fields(vec![
            {
                let mut f = Field::new("price", FieldType::Float64);
                f.target = "/ticker".into();
                f
            },
            Field::new("volume", FieldType::Float64),
        ]);
        ing.target = "https://api.example.com".into();
        ing.selector = "data.last".into();
        let ing = ing.finalize(IngesterKind::HttpApi).unwrap();
        let price = ing.field("price").unwrap();
        assert_eq!(price.target, "https://api.example.com/ticker");
        assert_eq!(price.selector, "data.last");
        let volume = ing.field("volume").unwrap();
        assert_eq!(volume.target, "https://api.example.com");
    }

    #[test]
    fn snapshot_excludes_transient_fields() {
        let mut ing = ingester_with_fields(vec![
            Field::new("price", FieldType::Float64),
            {
                let mut f = Field::new("scratch", FieldType::Float64);
                f.transient = true;
                f
            },
        ])
        .finalize(IngesterKind::HttpApi)
        .unwrap();
        ing.set_value("price", Value::Float(40000.0));
        ing.set_value("scratch", Value::Float(1.0));
        let snap = ing.snapshot();
        assert_eq!(snap.get("price"), Some(&Value::Float(40000.0)));
        assert!(!snap.contains_key("scratch"));
        assert!(snap.contains_key("date"));
    }

    #[test]
    fn dependencies_extracts_cross_ingester_references() {
        let mut price = Field::new("price_in_usdt", FieldType::Float64);
        price.transformers = vec!["{self} / {USDT.1}".into()];
        let mut mean = Field::new("smooth", FieldType::Float64);
        mean.transformers = vec!["{self}::mean(h1)".into(), "{price_in_usdt} * 2".into()];
        let ing = ingester_with_fields(vec![price, mean])
            .finalize(IngesterKind::HttpApi)
            .unwrap();
        assert_eq!(ing.dependencies(), vec!["USDT".to_string()]);
    }

    #[test]
    fn id_is_stable_and_sensitive_to_fields() {
        let a = ingester_with_fields(vec![Field::new("price", FieldType::Float64)])
            .finalize(IngesterKind::HttpApi)
            .unwrap();
        let mut b = a.clone();
        assert_eq!(a.id(), b.id());
        b.fields.push(Field::new("volume", FieldType::Float64));
        assert_ne!(a.id(), b.id());
    }
}
