//! Session file transfer over HTTP.

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use waypost_protocol::{AgentOutput, Envelope, FileRef, FileUpload, MessageKind, CHANNEL_FILE};

use crate::api::error::{ApiError, ApiResult};
use crate::api::middleware::CurrentUser;
use crate::api::state::AppState;
use crate::files;
use crate::store::{AuditRecord, Direction};

use super::sessions::load_visible_session;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub seq: i64,
}

/// `POST /api/sessions/{id}/files` — multipart upload: persist to disk,
/// append a `file`-channel message, audit, relay to the runtime, fan out.
pub async fn upload_file(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    Path(session_id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadResponse>)> {
    let session = load_visible_session(&state, &identity, &session_id).await?;

    let mut upload: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::validation("file part needs a filename"))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::too_large(format!("reading upload failed: {e}")))?;
        upload = Some((name, bytes.to_vec()));
        break;
    }
    let (raw_name, bytes) =
        upload.ok_or_else(|| ApiError::validation("multipart field 'file' is required"))?;

    if bytes.len() > state.settings.files.max_file_bytes {
        return Err(ApiError::too_large("file exceeds the size limit"));
    }
    let name = files::sanitize_filename(&raw_name)
        .map_err(|e| ApiError::validation(format!("unusable file name: {e}")))?;

    let file_id = format!("file_{}", nanoid::nanoid!(12));
    files::store_file(
        &state.settings.files.root,
        &session.id,
        &file_id,
        &name,
        &bytes,
    )
    .await?;

    let file_ref = FileRef {
        file_id: file_id.clone(),
        name: name.clone(),
        size: bytes.len() as u64,
    };
    let content = serde_json::to_string(&file_ref)
        .map_err(|e| ApiError::PersistFailed(e.to_string()))?;

    let message_id = format!("msg_{}", nanoid::nanoid!(12));
    let seq = state
        .store
        .append_message(&session.id, &message_id, Direction::User, CHANNEL_FILE, &content)
        .await?;

    state
        .store
        .record_audit(
            AuditRecord::new(&session.org_id, "file.uploaded")
                .user(&identity.user_id)
                .session(&session.id)
                .detail(json!({ "file_id": file_id, "name": name, "size": bytes.len() })),
        )
        .await?;

    // Relay the bytes to the runtime and the reference to the subscribers.
    let relay = Envelope::new(MessageKind::FileUpload)
        .with_session(&session.id)
        .with_payload(&FileUpload {
            session_id: session.id.clone(),
            file_id: file_id.clone(),
            name: name.clone(),
            content_base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
        });
    state.hub.broadcast_to_session(
        &session.id,
        Envelope::new(MessageKind::AgentOutput)
            .with_session(&session.id)
            .with_payload(&AgentOutput {
                session_id: session.id.clone(),
                message_id: None,
                seq,
                channel: CHANNEL_FILE.to_string(),
                content,
                is_final: true,
            }),
    );
    if !state.hub.send_to_runtime(&session.runtime_id, relay) {
        warn!(session_id = %session.id, "file stored but runtime unreachable");
    }

    info!(session_id = %session.id, file_id = %file_id, size = bytes.len(), "file uploaded");
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            file_id,
            name,
            size: bytes.len() as u64,
            seq,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub session_id: String,
}

/// `GET /api/files/{file_id}?session_id=…` — serve the stored file with a
/// sanitized attachment disposition. Symlinks are refused upstream.
pub async fn download_file(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    Path(file_id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let session = load_visible_session(&state, &identity, &query.session_id).await?;

    let located = files::locate_file(&state.settings.files.root, &session.id, &file_id)
        .await
        .map_err(|e| {
            warn!(error = %e, "file lookup failed");
            ApiError::forbidden("file is not servable")
        })?;
    let Some((path, name)) = located else {
        return Err(ApiError::not_found("file not found"));
    };

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::PersistFailed(format!("reading stored file: {e}")))?;

    let mime = mime_guess::from_path(&name).first_or_octet_stream();
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(
            header::CONTENT_DISPOSITION,
            files::content_disposition(&name),
        )
        .body(Body::from(bytes))
        .map_err(|e| ApiError::PersistFailed(e.to_string()))?;
    Ok(response)
}
