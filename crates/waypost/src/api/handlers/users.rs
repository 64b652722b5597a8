//! User management, listings, and per-user agent grants.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::api::middleware::{CurrentUser, RequireAdmin};
use crate::api::state::AppState;
use crate::auth::BuiltinAuth;
use crate::config::AgentAccessMode;
use crate::store::{NewUser, PermissionGrant, Role, Runtime, User};

/// `GET /api/users` — users of the caller's org.
pub async fn list_users(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
) -> ApiResult<Json<Vec<User>>> {
    let users = state.store.list_users(&identity.org_id).await?;
    Ok(Json(users))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub role: Option<Role>,
}

/// `POST /api/users` — admin creates a password user; builtin provider only.
pub async fn create_user(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Json(request): Json<CreateUserRequest>,
) -> ApiResult<(StatusCode, Json<User>)> {
    if state.builtin.is_none() {
        return Err(ApiError::validation(
            "user creation is managed by the external identity provider",
        ));
    }
    if request.username.len() < 2 || request.username.len() > 64 {
        return Err(ApiError::validation("username must be 2-64 characters"));
    }
    if request.password.len() < 8 || request.password.len() > 128 {
        return Err(ApiError::validation("password must be 8-128 characters"));
    }
    if state
        .store
        .get_user_by_username(&request.username)
        .await?
        .is_some()
    {
        return Err(ApiError::conflict("username is already taken"));
    }

    let password_hash = BuiltinAuth::hash_password(&request.password)?;
    let user = state
        .store
        .create_user(NewUser {
            org_id: admin.org_id.clone(),
            external_id: None,
            username: request.username,
            password_hash: Some(password_hash),
            role: request.role.unwrap_or(Role::User),
        })
        .await?;

    info!(user_id = %user.id, created_by = %admin.user_id, "user created");
    Ok((StatusCode::CREATED, Json(user)))
}

/// Agent listing item with JSON columns decoded for the UI.
#[derive(Debug, serde::Serialize)]
pub struct AgentView {
    pub id: String,
    pub org_id: String,
    pub runtime_id: String,
    pub profile: String,
    pub name: String,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caps: Option<Value>,
}

/// `GET /api/agents` — agents visible to the caller, honoring the default
/// access mode and per-user grants.
pub async fn list_agents(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
) -> ApiResult<Json<Vec<AgentView>>> {
    let agents = state.store.list_agents(&identity.org_id).await?;

    let restrict = state.settings.auth.default_agent_access == AgentAccessMode::None
        && !identity.is_admin();

    let mut views = Vec::with_capacity(agents.len());
    for agent in agents {
        if restrict
            && !state
                .store
                .has_permission(&identity.user_id, &agent.id)
                .await?
        {
            continue;
        }
        views.push(AgentView {
            online: state.hub.runtime_online(&agent.runtime_id),
            tags: agent.tags.as_deref().and_then(|s| serde_json::from_str(s).ok()),
            caps: agent.caps.as_deref().and_then(|s| serde_json::from_str(s).ok()),
            id: agent.id,
            org_id: agent.org_id,
            runtime_id: agent.runtime_id,
            profile: agent.profile,
            name: agent.name,
        });
    }
    Ok(Json(views))
}

/// `GET /api/runtimes`.
pub async fn list_runtimes(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
) -> ApiResult<Json<Vec<Runtime>>> {
    let runtimes = state.store.list_runtimes(&identity.org_id).await?;
    Ok(Json(runtimes))
}

#[derive(Debug, Deserialize)]
pub struct PermissionRequestBody {
    pub user_id: String,
    pub agent_id: String,
}

/// `POST /api/permissions` — grant a user access to an agent.
pub async fn grant_permission(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Json(request): Json<PermissionRequestBody>,
) -> ApiResult<StatusCode> {
    if state.store.get_agent(&request.agent_id).await?.is_none() {
        return Err(ApiError::not_found("agent not found"));
    }
    state
        .store
        .grant_permission(&request.user_id, &request.agent_id)
        .await?;
    info!(user_id = %request.user_id, agent_id = %request.agent_id,
          granted_by = %admin.user_id, "agent access granted");
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /api/permissions`.
pub async fn revoke_permission(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Json(request): Json<PermissionRequestBody>,
) -> ApiResult<StatusCode> {
    let removed = state
        .store
        .revoke_permission(&request.user_id, &request.agent_id)
        .await?;
    if !removed {
        return Err(ApiError::not_found("no such grant"));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/users/{id}/permissions` — self or admin.
pub async fn list_user_permissions(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Vec<PermissionGrant>>> {
    if !identity.is_admin() && identity.user_id != user_id {
        return Err(ApiError::forbidden("not your grants"));
    }
    let grants = state.store.list_permissions_for_user(&user_id).await?;
    Ok(Json(grants))
}
