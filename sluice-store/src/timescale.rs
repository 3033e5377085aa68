use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use tokio::sync::Mutex;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, NoTls, Row};

use sluice_model::{FieldType, Ingester, Interval, ResourceKind, Snapshot, Value};

use crate::backoff::retry_with_backoff;
use crate::error::StoreError;
use crate::sql::{check_unsigned_fit, column_list, escape_literal, persistent_columns, quote_ident};
use crate::tsdb::{ColumnInfo, Table, Tsdb};

/// TimescaleDB (Postgres) adapter.
///
/// Timeseries tables become hypertables when the extension is available;
/// plain Postgres still works, at the cost of chunked storage. Bucketed
/// fetches use `time_bucket` with `last()`/`first()` aggregates. Unsigned
/// columns widen: u8 -> SMALLINT, u16 -> INTEGER, u32 -> BIGINT,
/// u64 -> BIGINT with values above i64::MAX rejected.
pub struct TimescaleTsdb {
    client: Mutex<Option<Client>>,
    host: String,
    port: u16,
    db: std::sync::RwLock<String>,
    user: String,
    password: String,
}

fn sql_type(kind: FieldType) -> &'static str {
    match kind {
        FieldType::Int8 | FieldType::UInt8 | FieldType::Int16 => "SMALLINT",
        FieldType::UInt16 | FieldType::Int32 => "INTEGER",
        FieldType::UInt32 | FieldType::Int64 | FieldType::UInt64 => "BIGINT",
        FieldType::Float32 => "REAL",
        FieldType::Float64 => "DOUBLE PRECISION",
        FieldType::Bool => "BOOLEAN",
        FieldType::Timestamp => "TIMESTAMPTZ",
        FieldType::String => "TEXT",
        FieldType::Binary | FieldType::Varbinary => "BYTEA",
    }
}

/// Binds a model value against whatever column type Postgres expects.
struct PgValue(Value);

impl std::fmt::Debug for PgValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PgValue({})", self.0.type_name())
    }
}

impl ToSql for PgValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut tokio_postgres::types::private::BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match &self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Int(i) => {
                if *ty == Type::INT2 {
                    (i16::try_from(*i)?).to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    (i32::try_from(*i)?).to_sql(ty, out)
                } else if *ty == Type::FLOAT4 {
                    (*i as f32).to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    (*i as f64).to_sql(ty, out)
                } else {
                    i.to_sql(ty, out)
                }
            }
            Value::UInt(u) => {
                if *ty == Type::INT2 {
                    (i16::try_from(*u)?).to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    (i32::try_from(*u)?).to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    (*u as f64).to_sql(ty, out)
                } else {
                    (i64::try_from(*u)?).to_sql(ty, out)
                }
            }
            Value::Float(v) => {
                if *ty == Type::FLOAT4 {
                    (*v as f32).to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            Value::Timestamp(ts) => ts.to_sql(ty, out),
            Value::String(s) => s.to_sql(ty, out),
            Value::Bytes(b) => b.to_sql(ty, out),
            Value::List(_) | Value::Map(_) => self.0.to_json().to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn from_row(row: &Row) -> Result<Vec<Value>, StoreError> {
    let mut out = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(idx)?
                .map(Value::Bool)
                .unwrap_or(Value::Null)
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(idx)?
                .map(|v| Value::Int(i64::from(v)))
                .unwrap_or(Value::Null)
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(idx)?
                .map(|v| Value::Int(i64::from(v)))
                .unwrap_or(Value::Null)
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(idx)?
                .map(Value::Int)
                .unwrap_or(Value::Null)
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(idx)?
                .map(|v| Value::Float(f64::from(v)))
                .unwrap_or(Value::Null)
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(idx)?
                .map(Value::Float)
                .unwrap_or(Value::Null)
        } else if *ty == Type::TIMESTAMPTZ || *ty == Type::TIMESTAMP {
            row.try_get::<_, Option<DateTime<Utc>>>(idx)?
                .map(Value::Timestamp)
                .unwrap_or(Value::Null)
        } else if *ty == Type::BYTEA {
            row.try_get::<_, Option<Vec<u8>>>(idx)?
                .map(Value::Bytes)
                .unwrap_or(Value::Null)
        } else {
            row.try_get::<_, Option<String>>(idx)?
                .map(Value::String)
                .unwrap_or(Value::Null)
        };
        out.push(value);
    }
    Ok(out)
}

impl TimescaleTsdb {
    pub async fn connect(
        host: &str,
        port: u16,
        db: &str,
        user: &str,
        password: &str,
    ) -> Result<TimescaleTsdb, StoreError> {
        let adapter = TimescaleTsdb {
            client: Mutex::new(None),
            host: host.to_string(),
            port,
            db: std::sync::RwLock::new(db.to_string()),
            user: user.to_string(),
            password: password.to_string(),
        };
        adapter.locked_client().await?;
        info!("connected to timescale at {host}:{port}/{db}");
        Ok(adapter)
    }

    fn db_name(&self) -> String {
        self.db.read().expect("db name lock poisoned").clone()
    }

    fn conn_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host,
            self.port,
            self.db_name(),
            self.user,
            self.password
        )
    }

    /// Lazily (re)connect under the client lock, so no caller can observe
    /// a half-initialized connection.
    async fn locked_client(
        &self,
    ) -> Result<tokio::sync::MutexGuard<'_, Option<Client>>, StoreError> {
        let mut slot = self.client.lock().await;
        let stale = match slot.as_ref() {
            Some(client) => client.is_closed(),
            None => true,
        };
        if stale {
            let conn_string = self.conn_string();
            let client = retry_with_backoff("timescale connect", 4, || async {
                let (client, connection) = tokio_postgres::connect(&conn_string, NoTls)
                    .await
                    .map_err(|e| StoreError::Connect(e.to_string()))?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!("timescale connection task ended: {e}");
                    }
                });
                Ok::<_, StoreError>(client)
            })
            .await?;
            *slot = Some(client);
        }
        Ok(slot)
    }

    async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, StoreError> {
        let slot = self.locked_client().await?;
        let client = slot.as_ref().expect("client present under lock");
        Ok(client.execute(sql, params).await?)
    }

    async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, StoreError> {
        let slot = self.locked_client().await?;
        let client = slot.as_ref().expect("client present under lock");
        Ok(client.query(sql, params).await?)
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
            defs.push("\"updated_at\" TIMESTAMPTZ".to_string());
        }
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(table)?,
            defs.join(", ")
        ))
    }

    fn bound_params(ing: &Ingester) -> Result<Vec<PgValue>, StoreError> {
        persistent_columns(ing)
            .iter()
            .map(|f| {
                check_unsigned_fit(f, &f.value)?;
                Ok(PgValue(f.value.clone()))
            })
            .collect()
    }

    fn is_missing_table(e: &StoreError) -> bool {
        match e {
            StoreError::Postgres(pg) => pg
                .code()
                .is_some_and(|c| *c == tokio_postgres::error::SqlState::UNDEFINED_TABLE),
            _ => false,
        }
    }
}

#[async_trait]
impl Tsdb for TimescaleTsdb {
    fn backend(&self) -> &'static str {
        "timescale"
    }

    async fn ping(&self) -> bool {
        self.query("SELECT 1", &[]).await.is_ok()
    }

    async fn close(&self) {
        let mut slot = self.client.lock().await;
        *slot = None;
    }

    async fn create_db(&self, name: &str, force: bool) -> Result<(), StoreError> {
        // CREATE DATABASE cannot be parameterized; the name is quoted as an
        // identifier after escaping.
        let quoted = quote_ident(&escape_literal(name))?;
        if force {
            self.execute(&format!("DROP DATABASE IF EXISTS {quoted}"), &[])
                .await?;
        }
        match self.execute(&format!("CREATE DATABASE {quoted}"), &[]).await {
            Ok(_) => {
                info!("created database {name}");
                Ok(())
            }
            Err(StoreError::Postgres(e))
                if e.code()
                    .is_some_and(|c| *c == tokio_postgres::error::SqlState::DUPLICATE_DATABASE) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn use_db(&self, name: &str) -> Result<(), StoreError> {
        {
            let mut slot = self.client.lock().await;
            *slot = None;
            let mut db = self.db.write().expect("db name lock poisoned");
            *db = name.to_string();
        }
        self.locked_client().await?;
        Ok(())
    }

    async fn create_table(&self, ing: &Ingester, name: Option<&str>) -> Result<(), StoreError> {
        let table = name.unwrap_or(&ing.name);
        let sql = Self::create_table_sql(ing, table)?;
        self.execute(&sql, &[]).await?;

        if ing.resource_kind == ResourceKind::Timeseries {
            let hypertable = format!(
                "SELECT create_hypertable('{}', 'ts', if_not_exists => TRUE)",
                escape_literal(&quote_ident(table)?)
            );
            if let Err(e) = self.query(&hypertable, &[]).await {
                warn!("hypertable conversion skipped for {table}: {e}");
            }
        }
        info!("ensured timescale table {}.{table}", self.db_name());
        Ok(())
    }

    async fn insert(&self, ing: &Ingester, table: Option<&str>) -> Result<(), StoreError> {
        let table = table.unwrap_or(&ing.name);
        let fields = persistent_columns(ing);
        let placeholders: Vec<String> = (1..=fields.len()).map(|i| format!("${i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table)?,
            column_list(&fields)?,
            placeholders.join(", ")
        );
        let params = Self::bound_params(ing)?;
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        match self.execute(&sql, &refs).await {
            Ok(_) => Ok(()),
            Err(e) if Self::is_missing_table(&e) => {
                warn!("table {table} missing, creating then retrying insert");
                self.create_table(ing, Some(table)).await?;
                self.execute(&sql, &refs).await?;
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
        let table = table.unwrap_or(&ing.name);
        let fields = persistent_columns(ing);
        let placeholders: Vec<String> = (1..=fields.len()).map(|i| format!("${i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table)?,
            column_list(&fields)?,
            placeholders.join(", ")
        );
        for row in rows {
            let params: Result<Vec<PgValue>, StoreError> = fields
                .iter()
                .zip(row)
                .map(|(f, v)| {
                    check_unsigned_fit(f, v)?;
                    Ok(PgValue(v.clone()))
                })
                .collect();
            let params = params?;
            let refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            self.execute(&sql, &refs).await?;
        }
        Ok(())
    }

    async fn upsert(&self, ing: &Ingester, table: Option<&str>) -> Result<(), StoreError> {
        let table = table.unwrap_or(&ing.name);
        let fields = persistent_columns(ing);
        let placeholders: Vec<String> = (1..=fields.len() + 1).map(|i| format!("${i}")).collect();
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
             ON CONFLICT (\"uid\") DO UPDATE SET {}",
            quote_ident(table)?,
            column_list(&fields)?,
            placeholders.join(", "),
            updates.join(", ")
        );
        let mut params = Self::bound_params(ing)?;
        params.push(PgValue(Value::Timestamp(Utc::now())));
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        match self.execute(&sql, &refs).await {
            Ok(_) => Ok(()),
            Err(e) if Self::is_missing_table(&e) => {
                self.create_table(ing, Some(table)).await?;
                self.execute(&sql, &refs).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_by_id(&self, table: &str, uid: &str) -> Result<Option<Snapshot>, StoreError> {
        let sql = format!("SELECT * FROM {} WHERE \"uid\" = $1", quote_ident(table)?);
        let rows = self.query(&sql, &[&uid]).await?;
        match rows.first() {
            Some(row) => {
                let values = from_row(row)?;
                let snapshot: Snapshot = row
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .zip(values)
                    .collect();
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn fetch_batch_by_ids(
        &self,
        table: &str,
        uids: &[String],
    ) -> Result<Vec<Snapshot>, StoreError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM {} WHERE \"uid\" = ANY($1) ORDER BY \"updated_at\" DESC",
            quote_ident(table)?
        );
        let rows = self.query(&sql, &[&uids]).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let values = from_row(row)?;
            out.push(
                row.columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .zip(values)
                    .collect(),
            );
        }
        Ok(out)
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

        let bucket = escape_literal(&interval.pg_interval());
        let agg = if use_first { "first" } else { "last" };
        let mut selects = vec![format!("time_bucket('{bucket}', \"ts\") AS \"ts\"")];
        for column in &columns {
            let q = quote_ident(column)?;
            selects.push(format!("{agg}({q}, \"ts\") AS {q}"));
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE \"ts\" >= $1 AND \"ts\" <= $2 \
             GROUP BY 1 ORDER BY 1 ASC",
            selects.join(", "),
            quote_ident(table)?
        );
        let rows = self.query(&sql, &[&from, &to]).await?;
        let mut assembled = Vec::with_capacity(rows.len());
        for row in &rows {
            assembled.push(from_row(row)?);
        }
        let mut result_columns = vec!["ts".to_string()];
        result_columns.extend(columns);
        Ok(Table {
            columns: result_columns,
            rows: assembled,
        })
    }

    async fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let rows = self
            .query(
                "SELECT tablename FROM pg_tables WHERE schemaname = 'public' ORDER BY tablename",
                &[],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    async fn get_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, StoreError> {
        let rows = self
            .query(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_name = $1 AND table_schema = 'public' ORDER BY ordinal_position",
                &[&table],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| ColumnInfo {
                name: r.get(0),
                sql_type: r.get(1),
                primary_key: false,
            })
            .collect())
    }

    async fn alter_table(
        &self,
        table: &str,
        add: &[(String, FieldType)],
        drop: &[String],
    ) -> Result<(), StoreError> {
        for (name, kind) in add {
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                quote_ident(table)?,
                quote_ident(name)?,
                sql_type(*kind)
            );
            self.execute(&sql, &[]).await?;
        }
        for name in drop {
            let sql = format!(
                "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
                quote_ident(table)?,
                quote_ident(name)?
            );
            self.execute(&sql, &[]).await?;
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        // Autocommit; the client has no open transaction to flush.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_model::{Field, IngesterKind};

    fn sample_ingester(kind: ResourceKind) -> Ingester {
        Ingester {
            name: "AVAX".into(),
            resource_kind: kind,
            ingester_kind: IngesterKind::HttpApi,
            interval: "m5".parse().unwrap(),
            fields: vec![Field::new("price", FieldType::Float64)],
            target: String::new(),
            selector: String::new(),
            params: serde_json::Value::Null,
            transformers: Vec::new(),
            tags: Vec::new(),
            protected: false,
            last_ingested: None,
        }
        .finalize(IngesterKind::HttpApi)
        .unwrap()
    }

    #[test]
    fn timeseries_ddl_leads_with_ts() {
        let ing = sample_ingester(ResourceKind::Timeseries);
        let sql = TimescaleTsdb::create_table_sql(&ing, "AVAX").unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"AVAX\" (\"ts\" TIMESTAMPTZ, \"price\" DOUBLE PRECISION)"
        );
    }

    #[test]
    fn update_ddl_keys_on_uid() {
        let ing = sample_ingester(ResourceKind::Update);
        let sql = TimescaleTsdb::create_table_sql(&ing, "AVAX").unwrap();
        assert!(sql.contains("\"uid\" TEXT PRIMARY KEY"));
        assert!(sql.contains("\"updated_at\" TIMESTAMPTZ"));
    }

    #[test]
    fn unsigned_types_widen_without_silent_overflow() {
        assert_eq!(sql_type(FieldType::UInt8), "SMALLINT");
        assert_eq!(sql_type(FieldType::UInt16), "INTEGER");
        assert_eq!(sql_type(FieldType::UInt32), "BIGINT");
        assert_eq!(sql_type(FieldType::UInt64), "BIGINT");

        let mut ing = sample_ingester(ResourceKind::Timeseries);
        let mut counter = Field::new("n", FieldType::UInt64);
        counter.value = Value::UInt(u64::MAX);
        ing.fields.push(counter);
        assert!(matches!(
            TimescaleTsdb::bound_params(&ing),
            Err(StoreError::Overflow { .. })
        ));
    }
}
