//! Auth surface: provider discovery and builtin password login.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::api::middleware::client_ip;
use crate::api::state::AppState;
use crate::store::Role;

#[derive(Debug, Serialize)]
pub struct AuthConfigResponse {
    pub provider: &'static str,
}

/// `GET /api/auth/config` — which provider the UI should drive.
pub async fn auth_config(State(state): State<AppState>) -> Json<AuthConfigResponse> {
    Json(AuthConfigResponse {
        provider: state.validator.provider_name(),
    })
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginUser {
    pub id: String,
    pub username: String,
    pub role: Role,
    pub org_id: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: LoginUser,
}

/// `POST /api/auth/login` — password login, builtin provider only,
/// rate-limited per client IP.
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    if !state.login_limiter.allow(&client_ip(&headers)) {
        return Err(ApiError::RateLimited);
    }

    let Some(builtin) = state.builtin.as_ref() else {
        return Err(ApiError::validation(
            "password login is unavailable with an external identity provider",
        ));
    };

    if request.username.is_empty() || request.username.len() > 64 {
        return Err(ApiError::validation("username must be 1-64 characters"));
    }
    if request.password.is_empty() || request.password.len() > 128 {
        return Err(ApiError::validation("password must be 1-128 characters"));
    }

    let (token, identity) = builtin.login(&request.username, &request.password).await?;
    info!(user_id = %identity.user_id, "user logged in");

    Ok(Json(LoginResponse {
        token,
        user: LoginUser {
            id: identity.user_id,
            username: identity.username,
            role: identity.role,
            org_id: identity.org_id,
        },
    }))
}
