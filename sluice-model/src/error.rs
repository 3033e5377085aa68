use miette::Diagnostic;
use thiserror::Error;

/// Fatal-at-startup configuration problems.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("no ingester config selected; set INGESTER_CONFIGS")]
    MissingConfigSelection,

    #[error("failed to read config file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid process config")]
    Figment(#[from] Box<figment::Error>),

    #[error("ingester {ingester} declares field {field} more than once")]
    DuplicateField { ingester: String, field: String },

    #[error("unknown interval token: {0}")]
    BadInterval(String),

    #[error("ingester {ingester}: kind {kind} has no body in this build")]
    UnsupportedKind { ingester: String, kind: String },
}
