mod backoff;
mod error;
mod registry;
mod sql;
mod sqlite;
mod timescale;
mod tsdb;

pub use backoff::retry_with_backoff;
pub use error::{RegistryError, StoreError};
pub use registry::{DeltaStream, Registry};
pub use sqlite::SqliteTsdb;
pub use timescale::TimescaleTsdb;
pub use tsdb::{ColumnInfo, Table, Tsdb, connect_backend};
