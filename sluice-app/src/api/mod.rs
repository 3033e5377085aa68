pub mod admin;
pub mod auth;
pub mod error;
pub mod retriever;

use std::sync::Arc;

use log::warn;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::{Header, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::Response;

use sluice_model::{User, UserStatus};

use crate::services::limiter::LimiterError;
use crate::state::AppState;

/// Resolve (once per request) the principal from the bearer token or the
/// client IP. Cached so the guard and the rate-limit fairing agree.
pub async fn current_user<'r>(req: &'r Request<'_>) -> &'r User {
    req.local_cache_async(async {
        let ip = req
            .client_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let bearer = req
            .headers()
            .get_one("Authorization")
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::to_string)
            .or_else(|| {
                req.query_value::<String>("token")
                    .and_then(Result::ok)
            });
        match req.rocket().state::<Arc<AppState>>() {
            Some(state) => state.auth.resolve(bearer.as_deref(), &ip).await,
            None => User::anonymous_from_ip(&ip, Default::default()),
        }
    })
    .await
}

/// Request guard carrying the resolved principal; banned users stop here.
pub struct AuthedUser(pub User);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthedUser {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<AuthedUser, ()> {
        let user = current_user(req).await;
        if user.status == UserStatus::Banned {
            return Outcome::Error((Status::Forbidden, ()));
        }
        Outcome::Success(AuthedUser(user.clone()))
    }
}

/// Admin-only guard for the protected surface.
pub struct AdminUser(pub User);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminUser {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<AdminUser, ()> {
        let user = current_user(req).await;
        if user.is_admin() {
            Outcome::Success(AdminUser(user.clone()))
        } else {
            Outcome::Error((Status::Forbidden, ()))
        }
    }
}

/// Post-response rate limiting, charged with the actual response size
/// (the pre-check runs against the committed counters, so a concurrent
/// burst can overshoot by one increment but never undercount). Serving
/// happens first; an exceeded window replaces the response with a 429.
pub struct RateLimitFairing;

#[rocket::async_trait]
impl Fairing for RateLimitFairing {
    fn info(&self) -> Info {
        Info {
            name: "rate limiter",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, req: &'r Request<'_>, res: &mut Response<'r>) {
        let path = req.uri().path().to_string();
        // The WS endpoint charges its own costs per subscribe frame.
        if path == "/ws" {
            return;
        }
        let Some(state) = req.rocket().state::<Arc<AppState>>() else {
            return;
        };
        let user = current_user(req).await.clone();
        if user.status == UserStatus::Banned {
            replace_response(res, Status::Forbidden, "user is banned");
            return;
        }

        let bytes = res.body().preset_size().unwrap_or(0) as u64;
        match state.limiter.check_and_increment(&user, &path, bytes).await {
            Ok(verdict) => {
                if !verdict.bypass {
                    res.set_header(Header::new(
                        "X-RateLimit-Remaining",
                        verdict.remaining_header(),
                    ));
                    res.set_header(Header::new(
                        "X-RateLimit-Reset",
                        verdict.reset.to_rfc3339(),
                    ));
                }
                let auth = state.clone();
                tokio::spawn(async move {
                    auth.auth.track_usage(user, &path, bytes as i64).await;
                });
            }
            Err(LimiterError::Limited {
                metric,
                retry_after,
            }) => {
                replace_response(
                    res,
                    Status::TooManyRequests,
                    &format!("rate limit exceeded ({metric})"),
                );
                res.set_header(Header::new("Retry-After", retry_after.to_string()));
            }
            Err(LimiterError::Blacklisted) => {
                replace_response(res, Status::Forbidden, "user is blacklisted");
            }
            Err(LimiterError::Registry(e)) => {
                // Serve on limiter backend failures rather than 503ing
                // the whole surface.
                warn!("limiter unavailable, serving unmetered: {e}");
            }
        }
    }
}

fn replace_response(res: &mut Response<'_>, status: Status, message: &str) {
    let body = serde_json::json!({ "error": message }).to_string();
    res.set_status(status);
    res.set_header(rocket::http::ContentType::JSON);
    res.set_sized_body(body.len(), std::io::Cursor::new(body));
}

pub fn routes() -> Vec<rocket::Route> {
    let mut routes = retriever::routes();
    routes.extend(auth::routes());
    routes.extend(admin::routes());
    routes
}
