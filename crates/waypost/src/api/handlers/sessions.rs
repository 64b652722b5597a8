//! Session lifecycle and transcript reads.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::api::middleware::CurrentUser;
use crate::api::state::AppState;
use crate::store::{Session, SessionState, StoredMessage};
use crate::ws::Hub;

/// API-level default page size; the store caps harder.
const DEFAULT_MESSAGE_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub agent_id: String,
}

/// `GET /api/sessions` — the caller's sessions.
pub async fn list_sessions(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
) -> ApiResult<Json<Vec<Session>>> {
    let sessions = state
        .store
        .list_sessions_for_user(&identity.user_id)
        .await?;
    Ok(Json(sessions))
}

/// `POST /api/sessions` — create against an agent; the runtime hears about
/// it asynchronously.
pub async fn create_session(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    if request.agent_id.is_empty() || request.agent_id.len() > 128 {
        return Err(ApiError::validation("agent_id must be 1-128 characters"));
    }

    if let Err(reason) = state.plan_gate.check(&identity.org_id).await {
        return Err(ApiError::PaymentRequired(reason));
    }

    let session = state.hub.create_session(&identity, &request.agent_id).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// `GET /api/sessions/{id}`.
pub async fn get_session(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Session>> {
    let session = load_visible_session(&state, &identity, &session_id).await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub after_seq: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// `GET /api/sessions/{id}/messages?after_seq&limit` — transcript page in
/// ascending seq order.
pub async fn get_messages(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    Path(session_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<Vec<StoredMessage>>> {
    let session = load_visible_session(&state, &identity, &session_id).await?;

    let after_seq = query.after_seq.unwrap_or(0);
    if after_seq < 0 {
        return Err(ApiError::validation("after_seq must be non-negative"));
    }
    let limit = query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT);
    if limit <= 0 {
        return Err(ApiError::validation("limit must be positive"));
    }

    let messages = state.store.get_messages(&session.id, after_seq, limit).await?;
    Ok(Json(messages))
}

/// `POST /api/sessions/{id}/close` — terminal transition; idempotent.
pub async fn close_session(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    let session = load_visible_session(&state, &identity, &session_id).await?;

    if session.state == SessionState::Closed {
        return Ok(StatusCode::NO_CONTENT);
    }

    state.hub.close_session(&identity, &session, "user").await?;
    info!(session_id = %session.id, user_id = %identity.user_id, "session closed");
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn load_visible_session(
    state: &AppState,
    identity: &crate::auth::Identity,
    session_id: &str,
) -> Result<Session, ApiError> {
    let session = state
        .store
        .get_session(session_id)
        .await?
        .ok_or(ApiError::SessionNotFound)?;
    if !Hub::can_view(identity, &session) {
        return Err(ApiError::forbidden("not your session"));
    }
    Ok(session)
}
