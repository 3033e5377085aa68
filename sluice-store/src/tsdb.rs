use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sluice_model::{FieldType, Ingester, Interval, Snapshot, Value};

use crate::error::StoreError;
use crate::sqlite::SqliteTsdb;
use crate::timescale::TimescaleTsdb;

/// Column-labelled result set shared by every adapter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Numeric view of one column, nulls skipped. Series transformers
    /// aggregate over this.
    pub fn numeric_column(&self, name: &str) -> Vec<f64> {
        let Some(idx) = self.column_index(name) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter_map(|row| row.get(idx).and_then(Value::as_f64))
            .collect()
    }

    pub fn into_records(self) -> Vec<Snapshot> {
        let columns = self.columns;
        self.rows
            .into_iter()
            .map(|row| columns.iter().cloned().zip(row).collect())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub sql_type: String,
    pub primary_key: bool,
}

/// Uniform time-series + update table contract over heterogeneous
/// back-ends. Adapters connect lazily, guard every externally-initiated
/// operation with an ensure-connected check, and honor the semantics in
/// the module docs: idempotent table creation, create-then-retry-once on
/// missing-table inserts, bucketed fetches returning the last non-null
/// value per bucket.
#[async_trait]
pub trait Tsdb: Send + Sync {
    /// Human tag used in logs and /info.
    fn backend(&self) -> &'static str;

    async fn ping(&self) -> bool;

    async fn close(&self);

    async fn create_db(&self, name: &str, force: bool) -> Result<(), StoreError>;

    async fn use_db(&self, name: &str) -> Result<(), StoreError>;

    async fn create_table(&self, ing: &Ingester, name: Option<&str>) -> Result<(), StoreError>;

    /// Insert one row from the ingester's current field values.
    async fn insert(&self, ing: &Ingester, table: Option<&str>) -> Result<(), StoreError>;

    /// Bulk insert pre-built rows (column order = persistent field order).
    async fn insert_many(
        &self,
        ing: &Ingester,
        rows: &[Vec<Value>],
        table: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Primary-keyed replace for `update` resources.
    async fn upsert(&self, ing: &Ingester, table: Option<&str>) -> Result<(), StoreError>;

    async fn fetch_by_id(&self, table: &str, uid: &str) -> Result<Option<Snapshot>, StoreError>;

    async fn fetch_batch_by_ids(
        &self,
        table: &str,
        uids: &[String],
    ) -> Result<Vec<Snapshot>, StoreError>;

    /// Bucketed window fetch. Returned `ts` values are bucket starts; each
    /// non-timestamp column carries the last (or first, on `use_first`)
    /// value observed inside its bucket.
    async fn fetch(
        &self,
        table: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: Interval,
        columns: &[String],
        use_first: bool,
    ) -> Result<Table, StoreError>;

    /// Fan out one fetch per table and concatenate rows under a unified
    /// column set.
    async fn fetch_batch(
        &self,
        tables: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: Interval,
        columns: &[String],
    ) -> Result<Table, StoreError> {
        let partials = futures::future::try_join_all(
            tables
                .iter()
                .map(|table| self.fetch(table, from, to, interval, columns, false)),
        )
        .await?;
        let mut combined = Table::default();
        for partial in partials {
            if combined.columns.is_empty() {
                combined.columns = partial.columns;
            }
            combined.rows.extend(partial.rows);
        }
        Ok(combined)
    }

    async fn list_tables(&self) -> Result<Vec<String>, StoreError>;

    async fn get_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError>;

    async fn alter_table(
        &self,
        table: &str,
        add: &[(String, FieldType)],
        drop: &[String],
    ) -> Result<(), StoreError>;

    async fn commit(&self) -> Result<(), StoreError>;
}

/// Resolve the configured backend from its env block
/// (`SQLITE_DB`, `TIMESCALE_HOST`/`TIMESCALE_PORT`/`TIMESCALE_DB`,
/// `DB_RW_USER`/`DB_RW_PASS`).
pub async fn connect_backend(backend: &str) -> Result<Arc<dyn Tsdb>, StoreError> {
    match backend {
        "sqlite" => {
            let path = std::env::var("SQLITE_DB").unwrap_or_else(|_| "./data.db".to_string());
            Ok(Arc::new(SqliteTsdb::connect(&path).await?))
        }
        "timescale" => {
            let host = std::env::var("TIMESCALE_HOST").unwrap_or_else(|_| "localhost".to_string());
            let port = std::env::var("TIMESCALE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432);
            let db = std::env::var("TIMESCALE_DB").unwrap_or_else(|_| "sluice".to_string());
            let user = std::env::var("DB_RW_USER").unwrap_or_else(|_| "postgres".to_string());
            let password = std::env::var("DB_RW_PASS").unwrap_or_default();
            Ok(Arc::new(
                TimescaleTsdb::connect(&host, port, &db, &user, &password).await?,
            ))
        }
        other => Err(StoreError::UnsupportedBackend(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_column_skips_nulls_and_strings() {
        let table = Table {
            columns: vec!["ts".into(), "p".into()],
            rows: vec![
                vec![Value::Int(0), Value::Float(1.0)],
                vec![Value::Int(300), Value::Null],
                vec![Value::Int(600), Value::Float(3.0)],
                vec![Value::Int(900), Value::String("n/a".into())],
            ],
        };
        assert_eq!(table.numeric_column("p"), vec![1.0, 3.0]);
        assert!(table.numeric_column("missing").is_empty());
    }

    #[test]
    fn into_records_pairs_columns_with_rows() {
        let table = Table {
            columns: vec!["uid".into(), "alias".into()],
            rows: vec![vec![Value::String("u1".into()), Value::String("a".into())]],
        };
        let records = table.into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["uid"], Value::String("u1".into()));
    }
}
