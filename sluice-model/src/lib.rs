mod config;
mod error;
mod field;
mod ingester;
mod instance;
mod interval;
mod scope;
mod user;
mod value;

pub use config::{EngineConfig, IngesterConfigs, ServerConfig, WsConfig};
pub use error::ConfigError;
pub use field::{Field, FieldType};
pub use ingester::{Ingester, IngesterKind, ResourceKind, Snapshot};
pub use instance::{Instance, default_workdir};
pub use interval::{Interval, TimeUnit, secs_to_ceil};
pub use scope::Scope;
pub use user::{RateLimits, RouteClass, USERS_TABLE, User, UserStatus};
pub use value::Value;

/// Key prefix shared by every registry entry this engine writes.
pub const DEFAULT_NS: &str = "sluice";

/// Reserved snapshot keys that are never forwarded to public subscribers.
pub const RESERVED_KEYS: [&str; 3] = ["admin", "internal", "system"];
