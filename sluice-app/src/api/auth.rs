use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{State, post};
use serde::Deserialize;

use crate::api::AuthedUser;
use crate::api::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ChallengeRequest {
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub address: String,
    pub signature: String,
}

#[post("/auth/login", data = "<body>")]
pub async fn login(
    state: &State<Arc<AppState>>,
    body: Json<LoginRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let jwt = state.auth.login_static(&body.token).await?;
    Ok(Json(serde_json::json!({ "token": jwt })))
}

#[post("/auth/challenge", data = "<body>")]
pub async fn challenge(
    state: &State<Arc<AppState>>,
    body: Json<ChallengeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let message = state.auth.create_challenge(&body.address).await?;
    Ok(Json(serde_json::json!({
        "address": body.address,
        "challenge": message,
        "expires_in": 300,
    })))
}

#[post("/auth/verify", data = "<body>")]
pub async fn verify(
    state: &State<Arc<AppState>>,
    body: Json<VerifyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let jwt = state
        .auth
        .verify_challenge(&body.address, &body.signature)
        .await?;
    Ok(Json(serde_json::json!({ "token": jwt })))
}

#[post("/auth/logout")]
pub async fn logout(
    state: &State<Arc<AppState>>,
    user: AuthedUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.auth.logout(&user.0.uid).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

pub fn routes() -> Vec<rocket::Route> {
    rocket::routes![login, challenge, verify, logout]
}
