//! Device-code runtime registration: start, poll, approve.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::api::error::{ApiError, ApiResult};
use crate::api::middleware::{client_ip, RequireAdmin};
use crate::api::state::AppState;
use crate::auth::{generate_runtime_id, generate_runtime_token, token_hash};
use crate::store::{AuditRecord, DeviceCodeStatus, Store, DEVICE_CODE_TTL_SECS};

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_code: String,
    pub verification_url: String,
    pub polling_token: String,
    pub expires_in: i64,
    pub interval: u64,
}

/// `POST /api/runtime/register` — open a pairing window. Unauthenticated,
/// IP rate-limited.
pub async fn register_start(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<RegisterResponse>> {
    if !state.device_limiter.allow(&client_ip(&headers)) {
        return Err(ApiError::RateLimited);
    }

    let code = state.store.create_device_code("default").await?;

    // Opportunistic cleanup of long-dead codes.
    let store = state.store.clone();
    tokio::spawn(async move {
        if let Err(e) = store.purge_stale_device_codes().await {
            warn!(error = %e, "purging stale device codes failed");
        }
    });

    Ok(Json(RegisterResponse {
        user_code: code.user_code,
        verification_url: "/register".to_string(),
        polling_token: code.polling_token,
        expires_in: DEVICE_CODE_TTL_SECS,
        interval: 5,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PollRequest {
    pub polling_token: String,
}

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub status: DeviceCodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

/// `POST /api/runtime/register/poll` — the runtime's side of the pairing
/// loop. The minted token appears in exactly one response.
pub async fn register_poll(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PollRequest>,
) -> ApiResult<Json<PollResponse>> {
    if !state.device_limiter.allow(&client_ip(&headers)) {
        return Err(ApiError::RateLimited);
    }

    let code = state
        .store
        .get_device_code_by_polling_token(&request.polling_token)
        .await?
        .ok_or_else(|| ApiError::not_found("unknown polling token"))?;

    if Store::device_code_expired(&code) {
        state.store.mark_device_code_expired(&code.id).await?;
        return Ok(Json(PollResponse {
            status: DeviceCodeStatus::Expired,
            token: None,
            runtime_id: None,
            org_id: None,
        }));
    }

    match code.status {
        DeviceCodeStatus::Pending | DeviceCodeStatus::Expired => Ok(Json(PollResponse {
            status: code.status,
            token: None,
            runtime_id: None,
            org_id: None,
        })),
        DeviceCodeStatus::Approved => {
            // First approved poll takes the plaintext; later polls see the
            // status alone.
            let token = state.store.take_device_code_token(&code.id).await?;
            let disclosed = token.is_some();
            let response = PollResponse {
                status: DeviceCodeStatus::Approved,
                runtime_id: if disclosed { code.runtime_id.clone() } else { None },
                org_id: if disclosed { Some(code.org_id.clone()) } else { None },
                token,
            };
            if disclosed {
                info!(runtime_id = ?code.runtime_id, "runtime credential disclosed");
            }
            Ok(Json(response))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub user_code: String,
    #[serde(default)]
    pub runtime_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApproveResponse {
    pub ok: bool,
    pub runtime_id: String,
}

/// `POST /api/runtime/register/approve` — admin pairs the device code with
/// a freshly minted runtime identity.
pub async fn register_approve(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Json(request): Json<ApproveRequest>,
) -> ApiResult<Json<ApproveResponse>> {
    let user_code = request.user_code.trim().to_uppercase();
    if user_code.is_empty() || user_code.len() > 32 {
        return Err(ApiError::validation("invalid user code"));
    }

    let code = state
        .store
        .get_device_code_by_user_code(&user_code)
        .await?
        .ok_or_else(|| ApiError::not_found("unknown user code"))?;

    if Store::device_code_expired(&code) || code.status == DeviceCodeStatus::Expired {
        return Err(ApiError::gone("device code has expired"));
    }
    if code.status == DeviceCodeStatus::Approved {
        return Err(ApiError::conflict("device code already approved"));
    }

    let runtime_id = generate_runtime_id();
    let plaintext = generate_runtime_token();
    let name = request
        .runtime_name
        .as_deref()
        .unwrap_or(&runtime_id)
        .trim()
        .to_string();
    if name.len() > 64 {
        return Err(ApiError::validation("runtime name too long"));
    }

    state
        .store
        .create_runtime_token(
            &code.org_id,
            &runtime_id,
            &token_hash(&plaintext),
            &name,
            &admin.user_id,
        )
        .await?;

    let approved = state
        .store
        .approve_device_code(&code.id, &runtime_id, &plaintext, &admin.user_id)
        .await?;
    if !approved {
        // Someone else approved or expired the code between our read and
        // the update.
        return Err(ApiError::conflict("device code already resolved"));
    }

    state
        .store
        .record_audit(
            AuditRecord::new(&code.org_id, "runtime.register_approved")
                .user(&admin.user_id)
                .runtime(&runtime_id)
                .detail(json!({ "user_code": user_code, "name": name })),
        )
        .await?;

    info!(runtime_id = %runtime_id, approved_by = %admin.user_id, "runtime registration approved");
    Ok(Json(ApproveResponse {
        ok: true,
        runtime_id,
    }))
}
