//! Unified API error handling with structured responses.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::auth::AuthError;

/// API error type. Variants mirror the wire-visible error taxonomy.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session not found")]
    SessionNotFound,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("gone: {0}")]
    Gone(String),

    #[error("payload too large: {0}")]
    TooLarge(String),

    #[error("rate limited")]
    RateLimited,

    #[error("a turn is already running")]
    TurnInProgress,

    #[error("payment required: {0}")]
    PaymentRequired(String),

    #[error("storage failure: {0}")]
    PersistFailed(String),

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),
}

impl ApiError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn gone(msg: impl Into<String>) -> Self {
        Self::Gone(msg.into())
    }

    pub fn too_large(msg: impl Into<String>) -> Self {
        Self::TooLarge(msg.into())
    }

    pub fn dependency_unavailable(msg: impl Into<String>) -> Self {
        Self::DependencyUnavailable(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) | Self::SessionNotFound => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) | Self::TurnInProgress => StatusCode::CONFLICT,
            Self::Gone(_) => StatusCode::GONE,
            Self::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            Self::PersistFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::SessionNotFound => "session_not_found",
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::Gone(_) => "gone",
            Self::TooLarge(_) => "too_large",
            Self::RateLimited => "rate_limited",
            Self::TurnInProgress => "turn_in_progress",
            Self::PaymentRequired(_) => "payment_required",
            Self::PersistFailed(_) => "persist_failed",
            Self::DependencyUnavailable(_) => "dependency_unavailable",
        }
    }
}

/// Structured error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::PersistFailed(msg) => {
                warn!(error_code = code, message = %msg, "storage-backed request failed");
            }
            ApiError::DependencyUnavailable(msg) => {
                warn!(error_code = code, message = %msg, "dependency unavailable");
            }
            _ => {
                debug!(error_code = code, message = %message, "client error");
            }
        }

        let body = ErrorResponse {
            error: message,
            code,
        };
        let mut response = (status, Json(body)).into_response();
        if matches!(self, ApiError::RateLimited) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

/// Backend failures surface as persist_failed; the process stays up.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!(error = %err, "backend failure");
        Self::PersistFailed(err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken => ApiError::Unauthorized("missing bearer token".to_string()),
            AuthError::InvalidToken(msg) => ApiError::Unauthorized(format!("invalid token: {msg}")),
            AuthError::TokenExpired => ApiError::Unauthorized("token has expired".to_string()),
            AuthError::InvalidCredentials => {
                ApiError::Unauthorized("invalid credentials".to_string())
            }
            AuthError::Internal(msg) => ApiError::PersistFailed(msg),
        }
    }
}

impl From<crate::ws::CreateSessionError> for ApiError {
    fn from(err: crate::ws::CreateSessionError) -> Self {
        use crate::ws::CreateSessionError;
        match err {
            CreateSessionError::AgentNotFound => ApiError::not_found("agent not found"),
            CreateSessionError::Forbidden => ApiError::forbidden("agent access denied"),
            CreateSessionError::RuntimeOffline => {
                ApiError::dependency_unavailable("runtime is offline")
            }
            CreateSessionError::SessionLimit => ApiError::RateLimited,
            CreateSessionError::Backend(err) => err.into(),
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            ApiError::unauthorized("").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::forbidden("").status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::not_found("").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::SessionNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::validation("").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::conflict("").status_code(), StatusCode::CONFLICT);
        assert_eq!(ApiError::gone("").status_code(), StatusCode::GONE);
        assert_eq!(
            ApiError::too_large("").status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::PaymentRequired(String::new()).status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            ApiError::DependencyUnavailable(String::new()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let response = ApiError::RateLimited.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            HeaderValue::from_static("1")
        );
    }
}
