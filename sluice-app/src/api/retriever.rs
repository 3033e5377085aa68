use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rocket::http::ContentType;
use rocket::serde::json::Json;
use rocket::{Request, Response, State, get};

use sluice_model::{Interval, Scope, Value};

use crate::api::AuthedUser;
use crate::api::error::ApiError;
use crate::format::{DataFormat, format_table, jsify_timestamps};
use crate::services::loader;
use crate::state::AppState;

/// Body with a format-dependent content type (history endpoints).
pub struct Formatted {
    content_type: ContentType,
    body: String,
}

impl<'r, 'o: 'r> rocket::response::Responder<'r, 'o> for Formatted {
    fn respond_to(self, _: &'r Request<'_>) -> rocket::response::Result<'o> {
        Response::build()
            .header(self.content_type)
            .sized_body(self.body.len(), std::io::Cursor::new(self.body))
            .ok()
    }
}

#[get("/ping")]
pub async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "timestamp": Utc::now().to_rfc3339() }))
}

#[get("/info")]
pub async fn info(state: &State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "engine": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "backend": state.tsdb.backend(),
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn schema_impl(
    state: &AppState,
    user: AuthedUser,
    resources: Option<&str>,
    scope: Option<&str>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let scope = scope.map(Scope::from_query_name).unwrap_or(Scope::DEFAULT);
    let names = loader::parse_resources(state, &user.0, resources)?;
    Ok(Json(loader::get_schema(state, &user.0, &names, scope)?))
}

#[get("/schema?<scope>")]
pub async fn schema(
    state: &State<Arc<AppState>>,
    user: AuthedUser,
    scope: Option<&str>,
) -> Result<Json<serde_json::Value>, ApiError> {
    schema_impl(state, user, None, scope).await
}

#[get("/schema/<resources>?<scope>")]
pub async fn schema_for(
    state: &State<Arc<AppState>>,
    user: AuthedUser,
    resources: &str,
    scope: Option<&str>,
) -> Result<Json<serde_json::Value>, ApiError> {
    schema_impl(state, user, Some(resources), scope).await
}

async fn last_impl(
    state: &AppState,
    user: AuthedUser,
    resources: Option<&str>,
    quote: Option<&str>,
    precision: Option<i32>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let names = loader::parse_resources(state, &user.0, resources)?;
    let values =
        loader::get_last_values(state, &names, quote, precision.unwrap_or(6)).await?;
    let body: serde_json::Map<String, serde_json::Value> = values
        .into_iter()
        .map(|(name, snapshot)| {
            let object: serde_json::Map<String, serde_json::Value> = snapshot
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();
            (name, serde_json::Value::Object(object))
        })
        .collect();
    Ok(Json(serde_json::Value::Object(body)))
}

#[get("/last?<quote>&<precision>")]
pub async fn last(
    state: &State<Arc<AppState>>,
    user: AuthedUser,
    quote: Option<&str>,
    precision: Option<i32>,
) -> Result<Json<serde_json::Value>, ApiError> {
    last_impl(state, user, None, quote, precision).await
}

#[get("/last/<resources>?<quote>&<precision>")]
pub async fn last_for(
    state: &State<Arc<AppState>>,
    user: AuthedUser,
    resources: &str,
    quote: Option<&str>,
    precision: Option<i32>,
) -> Result<Json<serde_json::Value>, ApiError> {
    last_impl(state, user, Some(resources), quote, precision).await
}

fn parse_date(raw: Option<&str>, fallback: DateTime<Utc>) -> Result<DateTime<Utc>, ApiError> {
    match raw {
        None => Ok(fallback),
        Some(s) => s
            .parse::<DateTime<Utc>>()
            .or_else(|_| {
                s.parse::<i64>()
                    .ok()
                    .and_then(|secs| DateTime::from_timestamp(secs, 0))
                    .ok_or(())
            })
            .map_err(|_| ApiError::User(format!("bad date: {s}"))),
    }
}

#[allow(clippy::too_many_arguments)]
async fn history_impl(
    state: &AppState,
    user: AuthedUser,
    resources: Option<&str>,
    fields: Option<&str>,
    from_date: Option<&str>,
    to_date: Option<&str>,
    interval: Option<&str>,
    format: Option<&str>,
    quote: Option<&str>,
    precision: Option<i32>,
) -> Result<Formatted, ApiError> {
    let names = loader::parse_resources(state, &user.0, resources)?;
    let to = parse_date(to_date, Utc::now())?;
    let from = parse_date(from_date, to - Duration::days(7))?;
    if from > to {
        return Err(ApiError::User("from_date is after to_date".into()));
    }
    let interval: Interval = interval
        .unwrap_or("m5")
        .parse()
        .map_err(|_| ApiError::User(format!("bad interval: {}", interval.unwrap_or(""))))?;
    let format: DataFormat = format
        .unwrap_or("json:row")
        .parse()
        .map_err(|e| ApiError::User(format!("{e}")))?;
    let columns: Vec<String> = fields
        .map(|f| {
            f.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty() && *s != "*")
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let table = loader::get_history(
        state,
        &names,
        &columns,
        from,
        to,
        interval,
        quote,
        precision.unwrap_or(6),
    )
    .await?;
    let table = jsify_timestamps(table);
    let body = format_table(&table, format).map_err(|e| ApiError::User(e.to_string()))?;
    Ok(Formatted {
        content_type: format.content_type(),
        body,
    })
}

#[get("/history?<fields>&<from_date>&<to_date>&<interval>&<format>&<quote>&<precision>")]
#[allow(clippy::too_many_arguments)]
pub async fn history(
    state: &State<Arc<AppState>>,
    user: AuthedUser,
    fields: Option<&str>,
    from_date: Option<&str>,
    to_date: Option<&str>,
    interval: Option<&str>,
    format: Option<&str>,
    quote: Option<&str>,
    precision: Option<i32>,
) -> Result<Formatted, ApiError> {
    history_impl(
        state, user, None, fields, from_date, to_date, interval, format, quote, precision,
    )
    .await
}

#[get("/history/<resources>?<fields>&<from_date>&<to_date>&<interval>&<format>&<quote>&<precision>")]
#[allow(clippy::too_many_arguments)]
pub async fn history_for(
    state: &State<Arc<AppState>>,
    user: AuthedUser,
    resources: &str,
    fields: Option<&str>,
    from_date: Option<&str>,
    to_date: Option<&str>,
    interval: Option<&str>,
    format: Option<&str>,
    quote: Option<&str>,
    precision: Option<i32>,
) -> Result<Formatted, ApiError> {
    history_impl(
        state,
        user,
        Some(resources),
        fields,
        from_date,
        to_date,
        interval,
        format,
        quote,
        precision,
    )
    .await
}

/// Resolve one side of a conversion pair to a numeric snapshot value.
async fn side_value(state: &AppState, selector: &str) -> Result<f64, ApiError> {
    let (resource, field) = selector
        .split_once('.')
        .ok_or_else(|| ApiError::User(format!("bad pair member: {selector}")))?;
    let snapshot = state
        .registry
        .get_snapshot(resource)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("resource not found: {resource}")))?;
    snapshot
        .get(field)
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
        .ok_or_else(|| ApiError::User(format!("field not numeric: {selector}")))
}

/// `/convert/<pair>` with pair = `Base.field-Quote.field`.
#[get("/convert/<pair>?<amount>&<precision>")]
pub async fn convert(
    state: &State<Arc<AppState>>,
    _user: AuthedUser,
    pair: &str,
    amount: Option<f64>,
    precision: Option<i32>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (base, quote) = pair
        .split_once('-')
        .ok_or_else(|| ApiError::User(format!("bad pair: {pair}")))?;
    let base_value = side_value(state, base).await?;
    let quote_value = side_value(state, quote).await?;
    if quote_value == 0.0 {
        return Err(ApiError::User("quote value is zero".into()));
    }
    let amount = amount.unwrap_or(1.0);
    let rate = base_value / quote_value;
    Ok(Json(serde_json::json!({
        "base": base,
        "quote": quote,
        "rate": rate,
        "amount": amount,
        "result": loader::round_sigfig(rate * amount, precision.unwrap_or(6)),
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

/// `/pegcheck/<pair>`: deviation of two snapshot values against a
/// tolerance (default 0.5%).
#[get("/pegcheck/<pair>?<max_deviation>")]
pub async fn pegcheck(
    state: &State<Arc<AppState>>,
    _user: AuthedUser,
    pair: &str,
    max_deviation: Option<f64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (left, right) = pair
        .split_once('-')
        .ok_or_else(|| ApiError::User(format!("bad pair: {pair}")))?;
    let a = side_value(state, left).await?;
    let b = side_value(state, right).await?;
    let mid = (a + b) / 2.0;
    if mid == 0.0 {
        return Err(ApiError::User("pair values average to zero".into()));
    }
    let deviation = (a - b).abs() / mid;
    let tolerance = max_deviation.unwrap_or(0.005);
    Ok(Json(serde_json::json!({
        "pair": pair,
        "left": a,
        "right": b,
        "deviation": deviation,
        "tolerance": tolerance,
        "pegged": deviation <= tolerance,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

#[get("/analysis?<from_date>&<to_date>")]
pub async fn analysis(
    state: &State<Arc<AppState>>,
    user: AuthedUser,
    from_date: Option<&str>,
    to_date: Option<&str>,
) -> Result<Json<serde_json::Value>, ApiError> {
    analysis_impl(state, user, None, from_date, to_date).await
}

#[get("/analysis/<resources>?<from_date>&<to_date>")]
pub async fn analysis_for(
    state: &State<Arc<AppState>>,
    user: AuthedUser,
    resources: &str,
    from_date: Option<&str>,
    to_date: Option<&str>,
) -> Result<Json<serde_json::Value>, ApiError> {
    analysis_impl(state, user, Some(resources), from_date, to_date).await
}

async fn analysis_impl(
    state: &AppState,
    user: AuthedUser,
    resources: Option<&str>,
    from_date: Option<&str>,
    to_date: Option<&str>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let names = loader::parse_resources(state, &user.0, resources)?;
    let to = parse_date(to_date, Utc::now())?;
    let from = parse_date(from_date, to - Duration::days(7))?;
    Ok(Json(serde_json::json!({
        "message": "Analysis endpoint placeholder",
        "resources": names,
        "from_date": from.to_rfc3339(),
        "to_date": to.to_rfc3339(),
    })))
}

#[get("/limits")]
pub async fn limits(
    state: &State<Arc<AppState>>,
    user: AuthedUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(state.limiter.get_user_limits(&user.0).await?))
}

pub fn routes() -> Vec<rocket::Route> {
    rocket::routes![
        ping,
        info,
        schema,
        schema_for,
        last,
        last_for,
        history,
        history_for,
        convert,
        pegcheck,
        analysis,
        analysis_for,
        limits,
    ]
}
