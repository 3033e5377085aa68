use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::value::Value;

/// Scalar column types an ingester field can declare.
///
/// Unsigned variants exist for config fidelity; adapters that lack native
/// unsigned storage widen them to the next signed type and reject values
/// that would overflow.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FieldType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    Bool,
    Timestamp,
    String,
    Binary,
    Varbinary,
}

impl FieldType {
    pub fn is_numeric(self) -> bool {
        !matches!(
            self,
            FieldType::Bool
                | FieldType::Timestamp
                | FieldType::String
                | FieldType::Binary
                | FieldType::Varbinary
        )
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            FieldType::UInt8 | FieldType::UInt16 | FieldType::UInt32 | FieldType::UInt64
        )
    }

    pub fn is_string_like(self) -> bool {
        matches!(
            self,
            FieldType::String | FieldType::Binary | FieldType::Varbinary
        )
    }
}

impl Default for FieldType {
    fn default() -> Self {
        FieldType::Float64
    }
}

/// One typed, named column of an ingester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: FieldType,
    /// Source URL / RPC endpoint / object id this field is read from.
    #[serde(default)]
    pub target: String,
    /// Source-specific extractor (JSON path for http_api, call selector
    /// for chain readers).
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Ordered transformer expressions applied after the body runs.
    #[serde(default)]
    pub transformers: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Transient fields participate in transformation but are never
    /// persisted.
    #[serde(default)]
    pub transient: bool,
    #[serde(skip)]
    pub value: Value,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldType) -> Self {
        Field {
            name: name.into(),
            kind,
            target: String::new(),
            selector: String::new(),
            params: serde_json::Value::Null,
            transformers: Vec::new(),
            tags: Vec::new(),
            transient: false,
            value: Value::Null,
        }
    }

    /// Stable identity input: everything that changes the meaning of the
    /// column, nothing that changes per tick.
    pub fn signature(&self) -> String {
        let transformers = if self.transformers.is_empty() {
            "raw".to_string()
        } else {
            self.transformers.join(",")
        };
        format!(
            "{}-{}-{}-{}-[{}]-[{}]",
            self.name, self.kind, self.target, self.selector, self.params, transformers
        )
    }

    pub fn id(&self) -> String {
        let digest = Md5::digest(self.signature().as_bytes());
        format!("{digest:x}")
    }

    /// Scope-masked metadata view used by `/schema` responses.
    pub fn describe(&self, scope: crate::Scope) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        out.insert("type".into(), serde_json::json!(self.kind.to_string()));
        if scope.contains(crate::Scope::TARGET) {
            out.insert("target".into(), serde_json::json!(self.target));
        }
        if scope.contains(crate::Scope::SELECTOR) {
            out.insert("selector".into(), serde_json::json!(self.selector));
        }
        if scope.contains(crate::Scope::TRANSFORMERS) {
            out.insert("transformers".into(), serde_json::json!(self.transformers));
        }
        out.insert("tags".into(), serde_json::json!(self.tags));
        out.insert("transient".into(), serde_json::json!(self.transient));
        serde_json::Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_type_spellings_round_trip() {
        for (token, kind) in [
            ("uint64", FieldType::UInt64),
            ("float64", FieldType::Float64),
            ("varbinary", FieldType::Varbinary),
            ("timestamp", FieldType::Timestamp),
        ] {
            assert_eq!(token.parse::<FieldType>().unwrap(), kind);
            assert_eq!(kind.to_string(), token);
        }
    }

    #[test]
    fn id_is_stable_over_value_mutation() {
        let mut field = Field::new("price", FieldType::Float64);
        field.target = "https://example.com/ticker".into();
        field.transformers = vec!["{self} * 1.0".into()];
        let before = field.id();
        field.value = Value::Float(40000.0);
        assert_eq!(field.id(), before);
        assert_eq!(before.len(), 32);
    }

    #[test]
    fn id_changes_with_selector() {
        let mut a = Field::new("price", FieldType::Float64);
        a.selector = "data.last".into();
        let mut b = a.clone();
        b.selector = "data.first".into();
        assert_ne!(a.id(), b.id());
    }
}
