use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{State, get};

use sluice_model::Scope;

use crate::api::AdminUser;
use crate::api::error::ApiError;
use crate::state::AppState;

#[get("/admin/users/<uid>")]
pub async fn get_user(
    state: &State<Arc<AppState>>,
    _admin: AdminUser,
    uid: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state
        .tsdb
        .fetch_by_id(sluice_model::USERS_TABLE, uid)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("user not found: {uid}")))?;
    let object: serde_json::Map<String, serde_json::Value> = record
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    Ok(Json(serde_json::Value::Object(object)))
}

#[get("/admin/users/<uid>/limits")]
pub async fn get_user_limits(
    state: &State<Arc<AppState>>,
    _admin: AdminUser,
    uid: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state
        .tsdb
        .fetch_by_id(sluice_model::USERS_TABLE, uid)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("user not found: {uid}")))?;
    let user = sluice_model::User::from_record(&record, state.config.default_rate_limits)
        .ok_or_else(|| ApiError::Internal("malformed user record".into()))?;
    Ok(Json(state.limiter.get_user_limits(&user).await?))
}

/// Live instance registry: every process heartbeating into the shared
/// namespace.
#[get("/admin/instances")]
pub async fn instances(
    state: &State<Arc<AppState>>,
    _admin: AdminUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    let instances = state.registry.list_instances().await?;
    let body: Vec<serde_json::Value> = instances
        .into_iter()
        .map(|(uid, name)| serde_json::json!({ "uid": uid, "name": name }))
        .collect();
    Ok(Json(serde_json::json!({ "instances": body })))
}

/// Full-scope schema dump, protected fields included.
#[get("/admin/ingesters")]
pub async fn ingesters(
    state: &State<Arc<AppState>>,
    _admin: AdminUser,
) -> Json<serde_json::Value> {
    let mut out = serde_json::Map::new();
    for (name, ing) in &state.resources {
        out.insert(name.clone(), ing.describe(Scope::DEBUG));
    }
    Json(serde_json::Value::Object(out))
}

#[get("/admin/tables")]
pub async fn tables(
    state: &State<Arc<AppState>>,
    _admin: AdminUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tables = state.tsdb.list_tables().await?;
    Ok(Json(serde_json::json!({ "tables": tables })))
}

pub fn routes() -> Vec<rocket::Route> {
    rocket::routes![get_user, get_user_limits, instances, ingesters, tables]
}
