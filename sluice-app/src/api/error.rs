use log::error;
use miette::Diagnostic;
use rocket::Request;
use rocket::http::{ContentType, Header, Status};
use rocket::response::{Responder, Response};
use thiserror::Error;

use crate::services::auth::AuthError;
use crate::services::limiter::LimiterError;

/// API-facing error taxonomy; each kind maps to one HTTP status family.
#[derive(Debug, Error, Diagnostic)]
pub enum ApiError {
    #[error("{0}")]
    User(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Auth(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limit exceeded ({metric})")]
    RateLimit { metric: String, retry_after: u64 },

    #[error("backend unavailable")]
    Backend(String),

    #[error("internal error")]
    Internal(String),
}

impl From<LimiterError> for ApiError {
    fn from(e: LimiterError) -> ApiError {
        match e {
            LimiterError::Blacklisted => ApiError::Forbidden("user is blacklisted".into()),
            LimiterError::Limited {
                metric,
                retry_after,
            } => ApiError::RateLimit {
                metric,
                retry_after,
            },
            LimiterError::Registry(e) => ApiError::Backend(e.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> ApiError {
        match e {
            AuthError::Registry(inner) => ApiError::Backend(inner.to_string()),
            AuthError::Store(inner) => ApiError::Backend(inner.to_string()),
            other => ApiError::Auth(other.to_string()),
        }
    }
}

impl From<sluice_store::StoreError> for ApiError {
    fn from(e: sluice_store::StoreError) -> ApiError {
        if e.is_transient() {
            ApiError::Backend(e.to_string())
        } else {
            ApiError::Internal(e.to_string())
        }
    }
}

impl From<sluice_store::RegistryError> for ApiError {
    fn from(e: sluice_store::RegistryError) -> ApiError {
        ApiError::Backend(e.to_string())
    }
}

impl ApiError {
    fn status(&self) -> Status {
        match self {
            ApiError::User(_) => Status::BadRequest,
            ApiError::NotFound(_) => Status::NotFound,
            ApiError::Auth(_) => Status::Unauthorized,
            ApiError::Forbidden(_) => Status::Forbidden,
            ApiError::RateLimit { .. } => Status::TooManyRequests,
            ApiError::Backend(_) => Status::ServiceUnavailable,
            ApiError::Internal(_) => Status::InternalServerError,
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for ApiError {
    fn respond_to(self, _: &'r Request<'_>) -> rocket::response::Result<'o> {
        if matches!(self, ApiError::Internal(_) | ApiError::Backend(_)) {
            error!("{self:?}");
        }
        let body = serde_json::json!({ "error": self.to_string() }).to_string();
        let mut response = Response::build();
        response
            .status(self.status())
            .header(ContentType::JSON)
            .sized_body(body.len(), std::io::Cursor::new(body));
        if let ApiError::RateLimit { retry_after, .. } = &self {
            response.header(Header::new("Retry-After", retry_after.to_string()));
        }
        response.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(ApiError::User("bad".into()).status(), Status::BadRequest);
        assert_eq!(ApiError::NotFound("x".into()).status(), Status::NotFound);
        assert_eq!(ApiError::Auth("t".into()).status(), Status::Unauthorized);
        assert_eq!(ApiError::Forbidden("p".into()).status(), Status::Forbidden);
        assert_eq!(
            ApiError::RateLimit {
                metric: "rpm".into(),
                retry_after: 42
            }
            .status(),
            Status::TooManyRequests
        );
        assert_eq!(
            ApiError::Backend("down".into()).status(),
            Status::ServiceUnavailable
        );
    }
}
