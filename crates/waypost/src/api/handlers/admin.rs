//! Admin views: cross-user sessions, the audit trail, agents with override
//! state, and the effective endpoint configuration.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use waypost_protocol::{AgentConfigUpdate, Envelope, MessageKind};

use crate::api::error::{ApiError, ApiResult};
use crate::api::middleware::RequireAdmin;
use crate::api::state::AppState;
use crate::store::{AuditEvent, AuditRecord, Session};

/// `GET /api/admin/sessions` — every session in the org.
pub async fn admin_sessions(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
) -> ApiResult<Json<Vec<Session>>> {
    let sessions = state.store.list_sessions(&admin.org_id).await?;
    Ok(Json(sessions))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

/// `GET /api/admin/audit?limit` — newest first.
pub async fn admin_audit(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<AuditEvent>>> {
    let events = state
        .store
        .list_audit_events(&admin.org_id, query.limit.unwrap_or(100))
        .await?;
    Ok(Json(events))
}

#[derive(Debug, Serialize)]
pub struct AdminAgentView {
    pub id: String,
    pub runtime_id: String,
    pub profile: String,
    pub name: String,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_security: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_limits: Option<Value>,
}

/// `GET /api/admin/agents` — agents with their override state.
pub async fn admin_agents(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
) -> ApiResult<Json<Vec<AdminAgentView>>> {
    let agents = state.store.list_agents(&admin.org_id).await?;
    let mut views = Vec::with_capacity(agents.len());
    for agent in agents {
        let over = state.store.get_agent_override(&agent.id).await?;
        views.push(AdminAgentView {
            online: state.hub.runtime_online(&agent.runtime_id),
            security: agent
                .security
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok()),
            override_security: over
                .as_ref()
                .and_then(|o| o.security.as_deref())
                .and_then(|s| serde_json::from_str(s).ok()),
            override_limits: over
                .as_ref()
                .and_then(|o| o.limits.as_deref())
                .and_then(|s| serde_json::from_str(s).ok()),
            id: agent.id,
            runtime_id: agent.runtime_id,
            profile: agent.profile,
            name: agent.name,
        });
    }
    Ok(Json(views))
}

#[derive(Debug, Deserialize)]
pub struct AgentConfigRequest {
    #[serde(default)]
    pub security: Option<Value>,
    #[serde(default)]
    pub limits: Option<Value>,
}

/// `PUT /api/admin/agents/{id}/config` — set the override and push it to
/// the owning runtime if it is connected.
pub async fn set_agent_config(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Path(agent_id): Path<String>,
    Json(request): Json<AgentConfigRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let agent = state
        .store
        .get_agent(&agent_id)
        .await?
        .ok_or_else(|| ApiError::not_found("agent not found"))?;

    let security = request
        .security
        .as_ref()
        .map(|v| serde_json::to_string(v))
        .transpose()
        .map_err(|e| ApiError::validation(format!("invalid security override: {e}")))?;
    let limits = request
        .limits
        .as_ref()
        .map(|v| serde_json::to_string(v))
        .transpose()
        .map_err(|e| ApiError::validation(format!("invalid limits override: {e}")))?;

    state
        .store
        .upsert_agent_override(
            &agent.id,
            &agent.org_id,
            security.as_deref(),
            limits.as_deref(),
            &admin.user_id,
        )
        .await?;

    state
        .store
        .record_audit(
            AuditRecord::new(&agent.org_id, "agent.config_update")
                .user(&admin.user_id)
                .agent(&agent.id)
                .runtime(&agent.runtime_id),
        )
        .await?;

    let pushed = state.hub.send_to_runtime(
        &agent.runtime_id,
        Envelope::new(MessageKind::AgentConfigUpdate).with_payload(&AgentConfigUpdate {
            agent_id: agent.id.clone(),
            security: request.security,
            limits: request.limits,
        }),
    );

    info!(agent_id = %agent.id, pushed, "agent config override set");
    Ok(Json(serde_json::json!({ "ok": true, "pushed": pushed })))
}

#[derive(Debug, Serialize)]
pub struct AdminConfigView {
    pub provider: &'static str,
    pub turn_based: bool,
    pub max_sessions_per_user: usize,
    pub idle_timeout_secs: u64,
    pub max_file_bytes: usize,
    pub max_body_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asr_url: Option<String>,
}

/// `GET /api/admin/config` — the effective endpoint configuration.
pub async fn admin_config(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
) -> Json<AdminConfigView> {
    Json(AdminConfigView {
        provider: state.validator.provider_name(),
        turn_based: state.settings.sessions.turn_based,
        max_sessions_per_user: state.settings.sessions.max_per_user,
        idle_timeout_secs: state.settings.sessions.idle_timeout_secs,
        max_file_bytes: state.settings.files.max_file_bytes,
        max_body_bytes: state.settings.server.max_body_bytes,
        asr_url: state.settings.integrations.asr_url.clone(),
    })
}
