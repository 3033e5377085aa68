use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::field::{Field, FieldType};
use crate::ingester::{Ingester, IngesterKind, ResourceKind};
use crate::value::Value;

/// Internal table name for the user registry; persisted through the
/// `update` ingester contract like any other keyed resource.
pub const USERS_TABLE: &str = "sys.users";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UserStatus {
    Anonymous,
    #[default]
    Public,
    Admin,
    Banned,
}

/// Nine per-user caps: requests / bytes / points × minute / hour / day.
/// A cap of zero disables that metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub rpm: u64,
    pub rph: u64,
    pub rpd: u64,
    pub spm: u64,
    pub sph: u64,
    pub spd: u64,
    pub ppm: u64,
    pub pph: u64,
    pub ppd: u64,
}

impl Default for RateLimits {
    fn default() -> Self {
        RateLimits {
            rpm: 60,
            rph: 1_200,
            rpd: 9_600,
            spm: 5_000_000,
            sph: 50_000_000,
            spd: 200_000_000,
            ppm: 600,
            pph: 7_200,
            ppd: 28_800,
        }
    }
}

impl RateLimits {
    /// Active metrics as `(name, window_secs, cap)`, skipping disabled
    /// (zero) caps. Ordering is stable so pipelined registry reads line up.
    pub fn active(&self) -> Vec<(&'static str, u64, u64)> {
        [
            ("rpm", 60, self.rpm),
            ("rph", 3_600, self.rph),
            ("rpd", 86_400, self.rpd),
            ("spm", 60, self.spm),
            ("sph", 3_600, self.sph),
            ("spd", 86_400, self.spd),
            ("ppm", 60, self.ppm),
            ("pph", 3_600, self.pph),
            ("ppd", 86_400, self.ppd),
        ]
        .into_iter()
        .filter(|(_, _, cap)| *cap > 0)
        .collect()
    }
}

/// Route classes tracked in per-user usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Schema,
    Last,
    History,
    Analysis,
    Other,
}

impl RouteClass {
    pub fn from_path(path: &str) -> RouteClass {
        let head = path
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default();
        match head {
            "schema" => RouteClass::Schema,
            "last" | "convert" | "pegcheck" => RouteClass::Last,
            "history" => RouteClass::History,
            "analysis" => RouteClass::Analysis,
            _ => RouteClass::Other,
        }
    }
}

/// A principal: wallet-derived or IP-derived, with caps, usage counters
/// and session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub uid: String,
    #[serde(default)]
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub status: UserStatus,
    #[serde(default)]
    pub total_count: i64,
    #[serde(default)]
    pub schema_count: i64,
    #[serde(default)]
    pub last_count: i64,
    #[serde(default)]
    pub history_count: i64,
    #[serde(default)]
    pub analysis_count: i64,
    #[serde(default)]
    pub total_bytes: i64,
    #[serde(default)]
    pub schema_bytes: i64,
    #[serde(default)]
    pub last_bytes: i64,
    #[serde(default)]
    pub history_bytes: i64,
    #[serde(default)]
    pub analysis_bytes: i64,
    // Session state never persists; it lives in the registry.
    #[serde(skip)]
    pub rate_limits: RateLimits,
    #[serde(skip)]
    pub session_token: Option<String>,
    #[serde(skip)]
    pub session_expires_at: Option<DateTime<Utc>>,
}

fn short_uid(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    format!("{digest:x}")[..16].to_string()
}

impl User {
    pub fn anonymous_from_ip(ip: &str, limits: RateLimits) -> User {
        let mut user = User::with_uid(short_uid(ip), limits);
        user.status = UserStatus::Anonymous;
        if ip.contains(':') {
            user.ipv6 = ip.to_string();
        } else {
            user.ipv4 = ip.to_string();
        }
        user
    }

    pub fn from_wallet(address: &str, limits: RateLimits) -> User {
        let mut user = User::with_uid(short_uid(&address.to_ascii_lowercase()), limits);
        user.status = UserStatus::Public;
        user.alias = address.to_string();
        user
    }

    fn with_uid(uid: String, limits: RateLimits) -> User {
        User {
            uid,
            ipv4: String::new(),
            ipv6: String::new(),
            alias: String::new(),
            status: UserStatus::default(),
            total_count: 0,
            schema_count: 0,
            last_count: 0,
            history_count: 0,
            analysis_count: 0,
            total_bytes: 0,
            schema_bytes: 0,
            last_bytes: 0,
            history_bytes: 0,
            analysis_bytes: 0,
            rate_limits: limits,
            session_token: None,
            session_expires_at: None,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.status == UserStatus::Admin
    }

    /// Bump the cumulative counters for one served request.
    pub fn update_usage(&mut self, path: &str, response_bytes: i64) {
        self.total_count += 1;
        self.total_bytes += response_bytes;
        match RouteClass::from_path(path) {
            RouteClass::Schema => {
                self.schema_count += 1;
                self.schema_bytes += response_bytes;
            }
            RouteClass::Last => {
                self.last_count += 1;
                self.last_bytes += response_bytes;
            }
            RouteClass::History => {
                self.history_count += 1;
                self.history_bytes += response_bytes;
            }
            RouteClass::Analysis => {
                self.analysis_count += 1;
                self.analysis_bytes += response_bytes;
            }
            RouteClass::Other => {}
        }
    }

    /// Column order matches `users_ingester()` field declaration order.
    pub fn to_record(&self) -> Vec<(String, Value)> {
        vec![
            ("uid".into(), Value::String(self.uid.clone())),
            ("ipv4".into(), Value::String(self.ipv4.clone())),
            ("ipv6".into(), Value::String(self.ipv6.clone())),
            ("alias".into(), Value::String(self.alias.clone())),
            ("status".into(), Value::String(self.status.to_string())),
            ("total_count".into(), Value::Int(self.total_count)),
            ("schema_count".into(), Value::Int(self.schema_count)),
            ("last_count".into(), Value::Int(self.last_count)),
            ("history_count".into(), Value::Int(self.history_count)),
            ("analysis_count".into(), Value::Int(self.analysis_count)),
            ("total_bytes".into(), Value::Int(self.total_bytes)),
            ("schema_bytes".into(), Value::Int(self.schema_bytes)),
            ("last_bytes".into(), Value::Int(self.last_bytes)),
            ("history_bytes".into(), Value::Int(self.history_bytes)),
            ("analysis_bytes".into(), Value::Int(self.analysis_bytes)),
        ]
    }

    pub fn from_record(record: &crate::ingester::Snapshot, limits: RateLimits) -> Option<User> {
        let uid = record.get("uid")?.as_str()?.to_string();
        let mut user = User::with_uid(uid, limits);
        if let Some(Value::String(s)) = record.get("ipv4") {
            user.ipv4 = s.clone();
        }
        if let Some(Value::String(s)) = record.get("ipv6") {
            user.ipv6 = s.clone();
        }
        if let Some(Value::String(s)) = record.get("alias") {
            user.alias = s.clone();
        }
        if let Some(Value::String(s)) = record.get("status") {
            user.status = s.parse().unwrap_or_default();
        }
        let int_of = |key: &str| record.get(key).and_then(Value::as_i64).unwrap_or(0);
        user.total_count = int_of("total_count");
        user.schema_count = int_of("schema_count");
        user.last_count = int_of("last_count");
        user.history_count = int_of("history_count");
        user.analysis_count = int_of("analysis_count");
        user.total_bytes = int_of("total_bytes");
        user.schema_bytes = int_of("schema_bytes");
        user.last_bytes = int_of("last_bytes");
        user.history_bytes = int_of("history_bytes");
        user.analysis_bytes = int_of("analysis_bytes");
        Some(user)
    }

    /// Descriptor for the internal `sys.users` update table.
    pub fn users_ingester() -> Ingester {
        let mut fields = vec![Field::new("uid", FieldType::String)];
        for name in ["ipv4", "ipv6", "alias", "status"] {
            fields.push(Field::new(name, FieldType::String));
        }
        for name in [
            "total_count",
            "schema_count",
            "last_count",
            "history_count",
            "analysis_count",
            "total_bytes",
            "schema_bytes",
            "last_bytes",
            "history_bytes",
            "analysis_bytes",
        ] {
            fields.push(Field::new(name, FieldType::Int64));
        }
        Ingester {
            name: USERS_TABLE.to_string(),
            resource_kind: ResourceKind::Update,
            ingester_kind: IngesterKind::Processor,
            interval: "h1".parse().expect("static interval token"),
            fields,
            target: String::new(),
            selector: String::new(),
            params: serde_json::Value::Null,
            transformers: Vec::new(),
            tags: Vec::new(),
            protected: true,
            last_ingested: None,
        }
        .finalize(IngesterKind::Processor)
        .expect("static descriptor is valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_is_sixteen_hex_chars() {
        let user = User::anonymous_from_ip("203.0.113.9", RateLimits::default());
        assert_eq!(user.uid.len(), 16);
        assert!(user.uid.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(user.status, UserStatus::Anonymous);
        assert_eq!(user.ipv4, "203.0.113.9");
    }

    #[test]
    fn wallet_uid_is_case_insensitive() {
        let a = User::from_wallet("0xAbCd00000000000000000000000000000000Ef12", RateLimits::default());
        let b = User::from_wallet("0xabcd00000000000000000000000000000000ef12", RateLimits::default());
        assert_eq!(a.uid, b.uid);
    }

    #[test]
    fn active_limits_skip_zero_caps() {
        let mut limits = RateLimits::default();
        limits.spm = 0;
        limits.sph = 0;
        limits.spd = 0;
        let active = limits.active();
        assert_eq!(active.len(), 6);
        assert!(active.iter().all(|(name, _, _)| !name.starts_with("sp")));
    }

    #[test]
    fn usage_counters_track_route_classes() {
        let mut user = User::anonymous_from_ip("203.0.113.9", RateLimits::default());
        user.update_usage("/history/BTCUSD", 1024);
        user.update_usage("/last/BTCUSD", 64);
        user.update_usage("/ping", 2);
        assert_eq!(user.total_count, 3);
        assert_eq!(user.history_count, 1);
        assert_eq!(user.history_bytes, 1024);
        assert_eq!(user.last_count, 1);
        assert_eq!(user.total_bytes, 1090);
    }

    #[test]
    fn record_round_trip() {
        let mut user = User::from_wallet("0x00ff", RateLimits::default());
        user.update_usage("/schema", 10);
        let record: crate::Snapshot = user
            .to_record()
            .into_iter()
            .collect();
        let back = User::from_record(&record, RateLimits::default()).unwrap();
        assert_eq!(back.uid, user.uid);
        assert_eq!(back.schema_count, 1);
        assert_eq!(back.status, UserStatus::Public);
    }

    #[test]
    fn users_ingester_is_a_protected_update_table() {
        let ing = User::users_ingester();
        assert_eq!(ing.resource_kind, ResourceKind::Update);
        assert!(ing.protected);
        assert_eq!(ing.fields[0].name, "uid");
    }
}
