use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::{info, warn};
use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;

use sluice_model::{FieldType, Ingester, Interval, ResourceKind, Snapshot, Value};

use crate::error::StoreError;
use crate::sql::{check_unsigned_fit, column_list, persistent_columns, quote_ident};
use crate::tsdb::{ColumnInfo, Table, Tsdb};

/// Embedded adapter over a single SQLite file.
///
/// rusqlite is blocking, so every operation hops onto the blocking pool
/// with the connection behind a mutex. Timestamps are stored as INTEGER
/// epoch milliseconds (UTC); sub-millisecond precision is lost, which is
/// within the documented contract. Unsigned 64-bit values above i64::MAX
/// are rejected rather than wrapped.
pub struct SqliteTsdb {
    conn: Arc<Mutex<Connection>>,
    path: String,
}

fn sql_type(kind: FieldType) -> &'static str {
    match kind {
        FieldType::Int8
        | FieldType::UInt8
        | FieldType::Int16
        | FieldType::UInt16
        | FieldType::Int32
        | FieldType::UInt32
        | FieldType::Int64
        | FieldType::UInt64
        | FieldType::Bool
        | FieldType::Timestamp => "INTEGER",
        FieldType::Float32 | FieldType::Float64 => "REAL",
        FieldType::String => "TEXT",
        FieldType::Binary | FieldType::Varbinary => "BLOB",
    }
}

fn to_sql_value(
    field: &sluice_model::Field,
    value: &Value,
) -> Result<SqlValue, StoreError> {
    check_unsigned_fit(field, value)?;
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::UInt(u) => SqlValue::Integer(*u as i64),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Timestamp(ts) => SqlValue::Integer(ts.timestamp_millis()),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
        Value::List(_) | Value::Map(_) => {
            SqlValue::Text(serde_json::to_string(value).unwrap_or_default())
        }
    })
}

fn from_sql_value(value: rusqlite::types::ValueRef<'_>) -> Value {
    match value {
        rusqlite::types::ValueRef::Null => Value::Null,
        rusqlite::types::ValueRef::Integer(i) => Value::Int(i),
        rusqlite::types::ValueRef::Real(f) => Value::Float(f),
        rusqlite::types::ValueRef::Text(t) => {
            Value::String(String::from_utf8_lossy(t).into_owned())
        }
        rusqlite::types::ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

fn millis_to_timestamp(ms: i64) -> Value {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(Value::Timestamp)
        .unwrap_or(Value::Int(ms))
}

fn is_missing_table(e: &rusqlite::Error) -> bool {
    e.to_string().contains("no such table")
}

impl SqliteTsdb {
    pub async fn connect(path: &str) -> Result<SqliteTsdb, StoreError> {
        let owned = path.to_string();
        let conn = tokio::task::spawn_blocking(move || Connection::open(owned))
            .await?
            .map_err(|e| StoreError::Connect(e.to_string()))?;
        info!("connected to sqlite database {path}");
        Ok(SqliteTsdb {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_string(),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().expect("sqlite connection lock poisoned");
            op(&mut guard)
        })
        .await?
    }

    fn create_table_sql(ing: &Ingester, table: &str) -> Result<String, StoreError> {
        let mut defs = Vec::new();
        for field in persistent_columns(ing) {
            let mut def = format!("{} {}", quote_ident(&field.name)?, sql_type(field.kind));
            if ing.resource_kind == ResourceKind::Update && field.name == "uid" {
                def.push_str(" PRIMARY KEY");
            }
            defs.push(def);
        }
        if ing.resource_kind == ResourceKind::Update {
            defs.push("\"updated_at\" INTEGER".to_string());
        }
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(table)?,
            defs.join(", ")
        ))
    }

    fn insert_sql_and_params(
        ing: &Ingester,
        table: &str,
    ) -> Result<(String, Vec<SqlValue>), StoreError> {
        let fields = persistent_columns(ing);
        let placeholders = vec!["?"; fields.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table)?,
            column_list(&fields)?,
            placeholders
        );
        let params: Result<Vec<SqlValue>, StoreError> = fields
            .iter()
            .map(|f| to_sql_value(f, &f.value))
            .collect();
        Ok((sql, params?))
    }
}

#[async_trait]
impl Tsdb for SqliteTsdb {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn ping(&self) -> bool {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(StoreError::from)
        })
        .await
        .is_ok()
    }

    async fn close(&self) {
        // File handle closes with the process; nothing pooled to drain.
    }

    async fn create_db(&self, name: &str, _force: bool) -> Result<(), StoreError> {
        // The database is the file itself.
        info!("sqlite database {name} ready (file-based: {})", self.path);
        Ok(())
    }

    async fn use_db(&self, name: &str) -> Result<(), StoreError> {
        if name != self.path {
            warn!("sqlite cannot switch databases in place; reconnect with SQLITE_DB={name}");
        }
        Ok(())
    }

    async fn create_table(&self, ing: &Ingester, name: Option<&str>) -> Result<(), StoreError> {
        let table = name.unwrap_or(&ing.name).to_string();
        let sql = Self::create_table_sql(ing, &table)?;
        self.with_conn(move |conn| {
            conn.execute(&sql, [])?;
            Ok(())
        })
        .await?;
        info!("ensured sqlite table {table}");
        Ok(())
    }

    async fn insert(&self, ing: &Ingester, table: Option<&str>) -> Result<(), StoreError> {
        let table = table.unwrap_or(&ing.name).to_string();
        let (sql, params) = Self::insert_sql_and_params(ing, &table)?;
        let retry = {
            let sql = sql.clone();
            let params = params.clone();
            self.with_conn(move |conn| {
                conn.execute(&sql, rusqlite::params_from_iter(params))
                    .map_err(StoreError::from)
            })
            .await
        };
        match retry {
            Ok(_) => Ok(()),
            Err(StoreError::Sqlite(e)) if is_missing_table(&e) => {
                warn!("table {table} missing, creating then retrying insert");
                self.create_table(ing, Some(&table)).await?;
                self.with_conn(move |conn| {
                    conn.execute(&sql, rusqlite::params_from_iter(params))
                        .map_err(StoreError::from)
                })
                .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn insert_many(
        &self,
        ing: &Ingester,
        rows: &[Vec<Value>],
        table: Option<&str>,
    ) -> Result<(), StoreError> {
        let table = table.unwrap_or(&ing.name).to_string();
        let fields = persistent_columns(ing);
        let placeholders = vec!["?"; fields.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&table)?,
            column_list(&fields)?,
            placeholders
        );
        let mut bound: Vec<Vec<SqlValue>> = Vec::with_capacity(rows.len());
        for row in rows {
            let mut params = Vec::with_capacity(fields.len());
            for (field, value) in fields.iter().zip(row) {
                params.push(to_sql_value(field, value)?);
            }
            bound.push(params);
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&sql)?;
                for params in bound {
                    stmt.execute(rusqlite::params_from_iter(params))?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn upsert(&self, ing: &Ingester, table: Option<&str>) -> Result<(), StoreError> {
        let table = table.unwrap_or(&ing.name).to_string();
        let fields = persistent_columns(ing);
        let placeholders = vec!["?"; fields.len() + 1].join(", ");
        let updates: Result<Vec<String>, StoreError> = fields
            .iter()
            .filter(|f| f.name != "uid")
            .map(|f| {
                let q = quote_ident(&f.name)?;
                Ok(format!("{q} = excluded.{q}"))
            })
            .collect();
        let mut updates = updates?;
        updates.push("\"updated_at\" = excluded.\"updated_at\"".to_string());
        let sql = format!(
            "INSERT INTO {} ({}, \"updated_at\") VALUES ({}) \
             ON CONFLICT(\"uid\") DO UPDATE SET {}",
            quote_ident(&table)?,
            column_list(&fields)?,
            placeholders,
            updates.join(", ")
        );
        let mut params: Vec<SqlValue> = Vec::with_capacity(fields.len() + 1);
        for field in &fields {
            params.push(to_sql_value(field, &field.value)?);
        }
        params.push(SqlValue::Integer(Utc::now().timestamp_millis()));

        let retry = {
            let sql = sql.clone();
            let params = params.clone();
            self.with_conn(move |conn| {
                conn.execute(&sql, rusqlite::params_from_iter(params))
                    .map_err(StoreError::from)
            })
            .await
        };
        match retry {
            Ok(_) => Ok(()),
            Err(StoreError::Sqlite(e)) if is_missing_table(&e) => {
                self.create_table(ing, Some(&table)).await?;
                self.with_conn(move |conn| {
                    conn.execute(&sql, rusqlite::params_from_iter(params))
                        .map_err(StoreError::from)
                })
                .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_by_id(&self, table: &str, uid: &str) -> Result<Option<Snapshot>, StoreError> {
        let sql = format!("SELECT * FROM {} WHERE \"uid\" = ?", quote_ident(table)?);
        let uid = uid.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query([uid])?;
            match rows.next()? {
                Some(row) => {
                    let mut snapshot = Snapshot::new();
                    for (idx, name) in columns.iter().enumerate() {
                        snapshot.insert(name.clone(), from_sql_value(row.get_ref(idx)?));
                    }
                    Ok(Some(snapshot))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn fetch_batch_by_ids(
        &self,
        table: &str,
        uids: &[String],
    ) -> Result<Vec<Snapshot>, StoreError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; uids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM {} WHERE \"uid\" IN ({placeholders}) ORDER BY \"updated_at\" DESC",
            quote_ident(table)?
        );
        let uids = uids.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query(rusqlite::params_from_iter(uids))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut snapshot = Snapshot::new();
                for (idx, name) in columns.iter().enumerate() {
                    snapshot.insert(name.clone(), from_sql_value(row.get_ref(idx)?));
                }
                out.push(snapshot);
            }
            Ok(out)
        })
        .await
    }

    async fn fetch(
        &self,
        table: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: Interval,
        columns: &[String],
        use_first: bool,
    ) -> Result<Table, StoreError> {
        let columns = if columns.is_empty() {
            self.get_columns(table)
                .await?
                .into_iter()
                .map(|c| c.name)
                .filter(|name| name != "ts")
                .collect()
        } else {
            columns.to_vec()
        };

        let width_ms = interval.seconds() as i64 * 1_000;
        let quoted: Result<Vec<String>, StoreError> =
            columns.iter().map(|c| quote_ident(c)).collect();
        let quoted = quoted?;
        // SQLite resolves bare columns in a MAX()/MIN() aggregate from the
        // row where the extremum occurs, which yields last-per-bucket
        // (or first-per-bucket) semantics without window functions.
        let edge = if use_first { "MIN" } else { "MAX" };
        let sql = format!(
            "SELECT (\"ts\" / {width_ms}) * {width_ms} AS bucket, {}, {edge}(\"ts\") \
             FROM {} WHERE \"ts\" >= ? AND \"ts\" <= ? GROUP BY \"ts\" / {width_ms} ORDER BY 1 ASC",
            quoted.join(", "),
            quote_ident(table)?
        );
        let from_ms = from.timestamp_millis();
        let to_ms = to.timestamp_millis();
        let n_cols = columns.len();

        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params![from_ms, to_ms])?;
                let mut out: Vec<Vec<Value>> = Vec::new();
                while let Some(row) = rows.next()? {
                    let mut assembled = Vec::with_capacity(n_cols + 1);
                    let bucket_ms: i64 = row.get(0)?;
                    assembled.push(millis_to_timestamp(bucket_ms));
                    for idx in 0..n_cols {
                        assembled.push(from_sql_value(row.get_ref(idx + 1)?));
                    }
                    out.push(assembled);
                }
                Ok(out)
            })
            .await?;

        let mut result_columns = vec!["ts".to_string()];
        result_columns.extend(columns);
        Ok(Table {
            columns: result_columns,
            rows,
        })
    }

    async fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn get_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError> {
        let sql = format!("PRAGMA table_info({})", quote_ident(table)?);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let infos = stmt
                .query_map([], |row| {
                    Ok(ColumnInfo {
                        name: row.get(1)?,
                        sql_type: row.get(2)?,
                        primary_key: row.get::<_, i64>(5)? > 0,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(infos)
        })
        .await
    }

    async fn alter_table(
        &self,
        table: &str,
        add: &[(String, FieldType)],
        drop: &[String],
    ) -> Result<(), StoreError> {
        let mut statements = Vec::new();
        for (name, kind) in add {
            statements.push(format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote_ident(table)?,
                quote_ident(name)?,
                sql_type(*kind)
            ));
        }
        for name in drop {
            statements.push(format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(table)?,
                quote_ident(name)?
            ));
        }
        self.with_conn(move |conn| {
            for sql in statements {
                conn.execute(&sql, [])?;
            }
            Ok(())
        })
        .await
    }

    async fn commit(&self) -> Result<(), StoreError> {
        // Autocommit.
        Ok(())
    }
}
