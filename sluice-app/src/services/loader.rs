use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::warn;

use sluice_model::{Interval, Scope, Snapshot, User, Value};
use sluice_store::Table;

use crate::api::error::ApiError;
use crate::state::AppState;

/// Parse a path/query resource selector (`BTCUSD,ETHUSD`, `all`, `*`)
/// into validated, visibility-filtered resource names.
pub fn parse_resources(
    state: &AppState,
    user: &User,
    selector: Option<&str>,
) -> Result<Vec<String>, ApiError> {
    let requested = selector.unwrap_or("*");
    let names: Vec<String> = if matches!(requested, "*" | "all") {
        state.visible_resources(user)
    } else {
        requested
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter(|name| {
                let visible =
                    state.resources.contains_key(*name) && (user.is_admin() || !state.is_protected(name));
                if !visible {
                    warn!("resource filtered from query: {name}");
                }
                visible
            })
            .map(str::to_string)
            .collect()
    };
    if names.is_empty() {
        return Err(ApiError::NotFound("no resources found".into()));
    }
    Ok(names)
}

/// Scope-gated schema view over the configured resources.
pub fn get_schema(
    state: &AppState,
    user: &User,
    resources: &[String],
    scope: Scope,
) -> Result<serde_json::Value, ApiError> {
    if !user.is_admin() && !scope.is_public() {
        return Err(ApiError::Forbidden("scope requires admin".into()));
    }
    let mut out = serde_json::Map::new();
    for name in resources {
        if let Some(ing) = state.resource(name) {
            out.insert(name.clone(), ing.describe(scope));
        }
    }
    Ok(serde_json::Value::Object(out))
}

/// Latest snapshot per resource from the registry, with optional quote
/// conversion: numeric fields multiply by the quote resource's field
/// value, rounded to `precision` significant figures.
pub async fn get_last_values(
    state: &AppState,
    resources: &[String],
    quote: Option<&str>,
    precision: i32,
) -> Result<BTreeMap<String, Snapshot>, ApiError> {
    let snapshots = state.registry.get_snapshots(resources).await?;
    let mut out = BTreeMap::new();
    let mut missing = Vec::new();
    for (name, snapshot) in resources.iter().zip(snapshots) {
        match snapshot {
            Some(snap) => {
                out.insert(name.clone(), snap);
            }
            None => missing.push(name.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(ApiError::NotFound(format!(
            "resources not found: {}",
            missing.join(", ")
        )));
    }

    // The reference index is the identity quote, not a convertible
    // resource; values already denominate in it.
    if let Some(quote) = quote.filter(|q| *q != "USDC.idx") {
        let quote_value = fetch_quote_value(state, quote).await?;
        for snap in out.values_mut() {
            for value in snap.values_mut() {
                if let Value::Float(v) = value {
                    *value = Value::Float(round_sigfig(*v * quote_value, precision));
                }
            }
        }
    }
    for (_, snap) in out.iter_mut() {
        snap.insert(
            "quote".to_string(),
            Value::String(quote.unwrap_or("USDC.idx").to_string()),
        );
        snap.insert("precision".to_string(), Value::Int(i64::from(precision)));
    }
    Ok(out)
}

async fn fetch_quote_value(state: &AppState, quote: &str) -> Result<f64, ApiError> {
    let (resource, field) = quote
        .split_once('.')
        .ok_or_else(|| ApiError::User(format!("bad quote selector: {quote}")))?;
    let snapshot = state
        .registry
        .get_snapshot(resource)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("quote resource not found: {resource}")))?;
    let value = snapshot
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| ApiError::User(format!("quote field not found or not numeric: {quote}")))?;
    if !value.is_finite() {
        return Err(ApiError::User(format!("quote value is not finite: {quote}")));
    }
    Ok(value)
}

/// Bucketed history across resources, forward-filled and optionally
/// denominated in a quote series.
pub async fn get_history(
    state: &AppState,
    resources: &[String],
    columns: &[String],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    interval: Interval,
    quote: Option<&str>,
    precision: i32,
) -> Result<Table, ApiError> {
    let mut table = state
        .tsdb
        .fetch_batch(resources, from, to, interval, columns)
        .await?;
    if table.rows.is_empty() {
        return Err(ApiError::NotFound("no data found".into()));
    }
    fill_forward(&mut table);

    if let Some(quote) = quote.filter(|q| *q != "USDC.idx") {
        let (quote_resource, quote_field) = quote
            .split_once('.')
            .ok_or_else(|| ApiError::User(format!("bad quote selector: {quote}")))?;
        let quote_table = state
            .tsdb
            .fetch(
                quote_resource,
                from,
                to,
                interval,
                &[quote_field.to_string()],
                false,
            )
            .await?;
        if quote_table.rows.is_empty() {
            return Err(ApiError::NotFound("no quote data found".into()));
        }
        divide_by_quote(&mut table, &quote_table, quote_field, precision)?;
    }
    Ok(table)
}

/// Carry the last non-null value forward through each numeric column.
pub fn fill_forward(table: &mut Table) {
    let ts_idx = table.column_index("ts");
    let mut last: Vec<Option<Value>> = vec![None; table.columns.len()];
    for row in &mut table.rows {
        for (idx, cell) in row.iter_mut().enumerate() {
            if Some(idx) == ts_idx {
                continue;
            }
            if cell.is_null() {
                if let Some(previous) = &last[idx] {
                    *cell = previous.clone();
                }
            } else {
                last[idx] = Some(cell.clone());
            }
        }
    }
}

/// Divide every numeric column by the quote series value at (or before)
/// the row's bucket, denominating the table in the quote.
fn divide_by_quote(
    table: &mut Table,
    quote_table: &Table,
    quote_field: &str,
    precision: i32,
) -> Result<(), ApiError> {
    let quote_ts = quote_table
        .column_index("ts")
        .ok_or_else(|| ApiError::Internal("quote table missing ts".into()))?;
    let quote_val = quote_table
        .column_index(quote_field)
        .ok_or_else(|| ApiError::Internal("quote table missing value column".into()))?;
    let mut by_ts: BTreeMap<i64, f64> = BTreeMap::new();
    for row in &quote_table.rows {
        if let (Value::Timestamp(ts), Some(v)) = (&row[quote_ts], row[quote_val].as_f64()) {
            by_ts.insert(ts.timestamp_millis(), v);
        }
    }
    if by_ts.is_empty() {
        return Err(ApiError::NotFound("no quote data found".into()));
    }

    let ts_idx = table
        .column_index("ts")
        .ok_or_else(|| ApiError::Internal("history table missing ts".into()))?;
    for row in &mut table.rows {
        let Value::Timestamp(ts) = row[ts_idx] else {
            continue;
        };
        let at = ts.timestamp_millis();
        // Latest quote at or before this bucket.
        let Some((_, quote)) = by_ts.range(..=at).next_back() else {
            continue;
        };
        if *quote == 0.0 {
            continue;
        }
        for (idx, cell) in row.iter_mut().enumerate() {
            if idx == ts_idx {
                continue;
            }
            if let Some(v) = cell.as_f64() {
                *cell = Value::Float(round_sigfig(v / quote, precision));
            }
        }
    }
    Ok(())
}

/// Round to `precision` significant figures.
pub fn round_sigfig(value: f64, precision: i32) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return 0.0;
    }
    let magnitude = value.abs().log10().floor() as i32;
    let factor = 10f64.powi(precision - 1 - magnitude);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn round_sigfig_matches_reference_cases() {
        assert_eq!(round_sigfig(123.456789, 3), 123.0);
        assert_eq!(round_sigfig(0.00123456, 3), 0.00123);
        assert_eq!(round_sigfig(0.0, 3), 0.0);
        assert_eq!(round_sigfig(98765.0, 2), 99000.0);
    }

    #[test]
    fn fill_forward_carries_last_non_null() {
        let mut table = Table {
            columns: vec!["ts".into(), "p".into()],
            rows: vec![
                vec![Value::Int(0), Value::Float(1.0)],
                vec![Value::Int(1), Value::Null],
                vec![Value::Int(2), Value::Null],
                vec![Value::Int(3), Value::Float(4.0)],
            ],
        };
        fill_forward(&mut table);
        assert_eq!(table.rows[1][1], Value::Float(1.0));
        assert_eq!(table.rows[2][1], Value::Float(1.0));
        assert_eq!(table.rows[3][1], Value::Float(4.0));
    }

    #[test]
    fn leading_nulls_stay_null_without_prior_value() {
        let mut table = Table {
            columns: vec!["ts".into(), "p".into()],
            rows: vec![
                vec![Value::Int(0), Value::Null],
                vec![Value::Int(1), Value::Float(2.0)],
            ],
        };
        fill_forward(&mut table);
        assert_eq!(table.rows[0][1], Value::Null);
    }

    #[test]
    fn quote_division_uses_latest_quote_at_or_before_bucket() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap();
        let mut table = Table {
            columns: vec!["ts".into(), "p".into()],
            rows: vec![
                vec![Value::Timestamp(t0), Value::Float(30.0)],
                vec![Value::Timestamp(t1), Value::Float(45.0)],
            ],
        };
        let quote_table = Table {
            columns: vec!["ts".into(), "1".into()],
            rows: vec![
                vec![Value::Timestamp(t0), Value::Float(1.0)],
                vec![Value::Timestamp(t1), Value::Float(1.5)],
            ],
        };
        divide_by_quote(&mut table, &quote_table, "1", 6).unwrap();
        assert_eq!(table.rows[0][1], Value::Float(30.0));
        assert_eq!(table.rows[1][1], Value::Float(30.0));
    }
}
