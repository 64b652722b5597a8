//! API request handlers.

pub mod admin;
pub mod auth;
pub mod files;
pub mod registration;
pub mod sessions;
pub mod users;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use super::error::ApiResult;
use super::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Liveness.
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness: the database must answer.
pub async fn readyz(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state
        .db
        .ping()
        .await
        .map_err(|e| super::error::ApiError::dependency_unavailable(e.to_string()))?;
    Ok(StatusCode::OK)
}
