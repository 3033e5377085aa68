use miette::Diagnostic;
use thiserror::Error;

/// Shared-registry failures. Everything here is transient by contract:
/// the registry client reconnects and callers retry or degrade.
#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("registry command failed")]
    Redis(#[from] redis::RedisError),

    #[error("failed to encode snapshot payload")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode snapshot payload")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Storage-adapter failures.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("backend connection failed: {0}")]
    Connect(String),

    #[error("sqlite error")]
    Sqlite(#[from] rusqlite::Error),

    #[error("postgres error")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("table {0} does not exist")]
    MissingTable(String),

    #[error("value {value} overflows column {column} ({kind})")]
    Overflow {
        column: String,
        kind: String,
        value: String,
    },

    #[error("unsupported storage backend: {0}")]
    UnsupportedBackend(String),

    #[error("identifier {0:?} cannot be quoted safely")]
    BadIdentifier(String),

    #[error("blocking storage task failed")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// Transient errors are retried with capped exponential back-off;
    /// the rest surface to the caller.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Connect(_) => true,
            StoreError::Postgres(e) => e.is_closed(),
            _ => false,
        }
    }
}
