use std::collections::HashMap;
use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ingester::{Ingester, IngesterKind};
use crate::user::RateLimits;

/// Declarative ingester definitions, one TOML array per dispatch kind:
///
/// ```toml
/// [[http_api]]
/// name = "BTCUSD"
/// interval = "m5"
/// target = "https://api.example.com/ticker"
/// fields = [{ name = "price", selector = "data.last" }]
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct IngesterConfigs {
    #[serde(default)]
    pub http_api: Vec<Ingester>,
    #[serde(default)]
    pub ws_api: Vec<Ingester>,
    #[serde(default)]
    pub evm_caller: Vec<Ingester>,
    #[serde(default)]
    pub evm_logger: Vec<Ingester>,
    #[serde(default)]
    pub solana_caller: Vec<Ingester>,
    #[serde(default)]
    pub sui_caller: Vec<Ingester>,
    #[serde(default)]
    pub processor: Vec<Ingester>,
}

impl IngesterConfigs {
    pub fn from_toml_str(raw: &str, origin: &str) -> Result<IngesterConfigs, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    /// Load and merge the comma-separated file list from
    /// `INGESTER_CONFIGS`.
    pub fn load_from_env() -> Result<IngesterConfigs, ConfigError> {
        let selector =
            std::env::var("INGESTER_CONFIGS").map_err(|_| ConfigError::MissingConfigSelection)?;
        let mut merged = IngesterConfigs::default();
        for path in selector.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let raw = std::fs::read_to_string(Path::new(path)).map_err(|source| ConfigError::Io {
                path: path.to_string(),
                source,
            })?;
            let partial = IngesterConfigs::from_toml_str(&raw, path)?;
            merged.merge(partial);
        }
        Ok(merged)
    }

    fn merge(&mut self, other: IngesterConfigs) {
        self.http_api.extend(other.http_api);
        self.ws_api.extend(other.ws_api);
        self.evm_caller.extend(other.evm_caller);
        self.evm_logger.extend(other.evm_logger);
        self.solana_caller.extend(other.solana_caller);
        self.sui_caller.extend(other.sui_caller);
        self.processor.extend(other.processor);
    }

    /// All ingesters with their dispatch kind injected, defaults pushed
    /// down and invariants checked.
    pub fn ingesters(self) -> Result<Vec<Ingester>, ConfigError> {
        let groups = [
            (IngesterKind::HttpApi, self.http_api),
            (IngesterKind::WsApi, self.ws_api),
            (IngesterKind::EvmCaller, self.evm_caller),
            (IngesterKind::EvmLogger, self.evm_logger),
            (IngesterKind::SolanaCaller, self.solana_caller),
            (IngesterKind::SuiCaller, self.sui_caller),
            (IngesterKind::Processor, self.processor),
        ];
        let mut out = Vec::new();
        for (kind, items) in groups {
            for ingester in items {
                out.push(ingester.finalize(kind)?);
            }
        }
        Ok(out)
    }
}

/// Process config for the scheduler binary.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Registry key / pub-sub channel namespace.
    pub ns: String,
    pub redis_url: String,
    /// Storage backend selector: `sqlite` or `timescale`.
    pub backend: String,
    /// Hard ceiling on one tick body, seconds.
    pub max_tick_duration: u64,
    /// Margin subtracted from the interval when deriving tick deadlines,
    /// milliseconds.
    pub tick_deadline_margin_ms: u64,
    /// Instance heartbeat TTL, seconds.
    pub heartbeat_ttl: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            ns: crate::DEFAULT_NS.to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            backend: "sqlite".to_string(),
            max_tick_duration: 120,
            tick_deadline_margin_ms: 250,
            heartbeat_ttl: 90,
        }
    }
}

impl EngineConfig {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("Sluice.toml"))
            .merge(Env::prefixed("SLUICE_"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::figment()
            .extract()
            .map_err(|e| ConfigError::Figment(Box::new(e)))
    }
}

/// WebSocket fan-out tuning.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WsConfig {
    pub max_clients: usize,
    pub client_max_lifetime_s: u64,
    /// Glob restricting subscribable topics.
    pub allowed_topics: String,
    pub subscription_base_cost: u64,
    pub subscription_per_topic_cost: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        WsConfig {
            max_clients: 1_000,
            client_max_lifetime_s: 6 * 3_600,
            allowed_topics: "*".to_string(),
            subscription_base_cost: 10,
            subscription_per_topic_cost: 2,
        }
    }
}

/// Process config for the API server binary.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    pub ns: String,
    pub redis_url: String,
    pub backend: String,
    pub jwt_secret: String,
    /// Static bearer token accepted by /auth/login; empty disables it.
    pub static_auth_token: String,
    pub session_ttl_s: u64,
    pub default_rate_limits: RateLimits,
    /// Route glob → point cost; unmatched routes cost 10.
    pub route_points: HashMap<String, u64>,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub ws: WsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut route_points = HashMap::new();
        route_points.insert("/ping".to_string(), 1);
        route_points.insert("/info".to_string(), 1);
        route_points.insert("/schema*".to_string(), 1);
        route_points.insert("/last*".to_string(), 1);
        route_points.insert("/convert/*".to_string(), 1);
        route_points.insert("/pegcheck/*".to_string(), 1);
        route_points.insert("/history*".to_string(), 5);
        route_points.insert("/analysis*".to_string(), 15);
        route_points.insert("/limits".to_string(), 1);
        route_points.insert("/admin/*".to_string(), 1);
        ServerConfig {
            ns: crate::DEFAULT_NS.to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            backend: "sqlite".to_string(),
            jwt_secret: String::new(),
            static_auth_token: String::new(),
            session_ttl_s: 24 * 3_600,
            default_rate_limits: RateLimits::default(),
            route_points,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            ws: WsConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("Sluice.toml"))
            .merge(Env::prefixed("SLUICE_"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::figment()
            .extract()
            .map_err(|e| ConfigError::Figment(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldType, ResourceKind};

    const SAMPLE: &str = r#"
[[http_api]]
name = "BTCUSD"
interval = "m5"
target = "https://api.example.com"
selector = "data.last"

[[http_api.fields]]
name = "price"
type = "float64"
target = "/ticker"
transformers = ["{self} * 1.0"]

[[processor]]
name = "Index"
interval = "h1"
resource_type = "update"

[[processor.fields]]
name = "alias"
type = "string"
"#;

    #[test]
    fn parses_kind_grouped_arrays() {
        let configs = IngesterConfigs::from_toml_str(SAMPLE, "inline").unwrap();
        let ingesters = configs.ingesters().unwrap();
        assert_eq!(ingesters.len(), 2);

        let btc = &ingesters[0];
        assert_eq!(btc.name, "BTCUSD");
        assert_eq!(btc.ingester_kind, crate::IngesterKind::HttpApi);
        assert_eq!(btc.interval.to_string(), "m5");
        // Synthetic ts + declared price.
        assert_eq!(btc.fields.len(), 2);
        let price = btc.field("price").unwrap();
        assert_eq!(price.kind, FieldType::Float64);
        assert_eq!(price.target, "https://api.example.com/ticker");
        assert_eq!(price.selector, "data.last");

        let index = &ingesters[1];
        assert_eq!(index.resource_kind, ResourceKind::Update);
        assert_eq!(index.fields[0].name, "uid");
    }

    #[test]
    fn engine_config_defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.ns, "sluice");
        assert!(config.max_tick_duration > 0);
    }

    #[test]
    fn default_route_points_follow_cost_tiers() {
        let config = ServerConfig::default();
        assert_eq!(config.route_points["/history*"], 5);
        assert_eq!(config.route_points["/analysis*"], 15);
        assert_eq!(config.route_points["/last*"], 1);
    }
}
