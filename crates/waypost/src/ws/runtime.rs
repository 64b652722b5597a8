//! Runtime-side WebSocket: hello handshake, registration, dispatch.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use waypost_protocol::{
    AgentConfigUpdate, AgentOutput, Envelope, FileAvailable, FileRef, HelloAck, MessageKind,
    NativeSessionsResponse, PermissionRequest, RuntimeHello, SessionCreated, TokenRefresh,
    TurnCompleted, TurnStarted, CHANNEL_FILE,
};

use crate::api::state::AppState;
use crate::files;
use crate::store::{AuditRecord, Direction, SessionState};

use super::hub::{Hub, Outbound, RuntimeHandle};
use super::{read_frame, spawn_writer, PONG_WAIT};

/// `GET /ws/runtime` — upgrade; the credential arrives inside the hello.
pub async fn runtime_ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let hub = state.hub.clone();
    ws.max_message_size(hub.cfg.max_ws_message_bytes)
        .on_upgrade(move |socket| handle_runtime_socket(socket, hub))
}

async fn handle_runtime_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sink, mut stream) = socket.split();

    // Exactly one frame is read before the connection is trusted, and it
    // must be a hello.
    let hello = match tokio::time::timeout(PONG_WAIT, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => {
            match serde_json::from_str::<Envelope>(&text) {
                Ok(env) if env.kind == MessageKind::RuntimeHello => match env.decode::<RuntimeHello>() {
                    Ok(hello) => hello,
                    Err(e) => {
                        debug!(error = %e, "malformed runtime hello payload");
                        return;
                    }
                },
                Ok(env) => {
                    debug!(kind = %env.kind, "first runtime frame was not a hello");
                    return;
                }
                Err(e) => {
                    debug!(error = %e, "unparseable first runtime frame");
                    return;
                }
            }
        }
        _ => return,
    };

    let Some(validated) = hub
        .runtime_auth
        .validate(&hello.runtime_id, &hello.token)
        .await
    else {
        let nack = Envelope::new(MessageKind::HelloAck).with_payload(&HelloAck {
            ok: false,
            error: Some("invalid runtime credentials".to_string()),
        });
        if let Ok(text) = serde_json::to_string(&nack) {
            let _ = sink.send(Message::Text(text.into())).await;
        }
        let _ = sink.send(Message::Close(None)).await;
        return;
    };

    // Effective org: the token row's org wins, then the hello's claim.
    let org_id = validated
        .org_id
        .or(hello.org_id.clone())
        .unwrap_or_else(|| "default".to_string());
    if let Err(e) = hub.store.ensure_org(&org_id).await {
        warn!(error = %e, "ensuring org failed, refusing runtime");
        return;
    }

    let runtime_id = hello.runtime_id.clone();
    let conn_id = hub.next_conn_id();
    let (tx, rx) = mpsc::channel(hub.cfg.reply_buffer);

    // Atomically take ownership of the runtime id; a pre-existing connection
    // is told to close and its reader will find itself superseded.
    let displaced = hub.register_runtime(
        &runtime_id,
        RuntimeHandle {
            conn_id,
            org_id: org_id.clone(),
            tx: tx.clone(),
        },
    );
    if let Some(old) = displaced {
        info!(runtime_id = %runtime_id, "displacing previous runtime connection");
        let _ = old.tx.try_send(Outbound::Close(None));
    }

    if let Err(e) = hub.store.upsert_runtime(&runtime_id, &org_id, &runtime_id).await {
        warn!(error = %e, runtime_id = %runtime_id, "persisting runtime failed");
        hub.deregister_runtime(&runtime_id, conn_id);
        return;
    }
    if let Err(e) = hub
        .store
        .replace_agents(&runtime_id, &org_id, &hello.agents)
        .await
    {
        warn!(error = %e, runtime_id = %runtime_id, "registering agents failed");
        hub.deregister_runtime(&runtime_id, conn_id);
        return;
    }

    // Push stored config overrides to the just-connected runtime.
    for agent in &hello.agents {
        match hub.store.get_agent_override(&agent.id).await {
            Ok(Some(over)) => {
                let update = Envelope::new(MessageKind::AgentConfigUpdate).with_payload(
                    &AgentConfigUpdate {
                        agent_id: agent.id.clone(),
                        security: over
                            .security
                            .as_deref()
                            .and_then(|s| serde_json::from_str(s).ok()),
                        limits: over
                            .limits
                            .as_deref()
                            .and_then(|s| serde_json::from_str(s).ok()),
                    },
                );
                let _ = tx.send(Outbound::Frame(update)).await;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, agent_id = %agent.id, "loading agent override failed"),
        }
    }

    let ack = Envelope::new(MessageKind::HelloAck).with_payload(&HelloAck {
        ok: true,
        error: None,
    });
    if tx.send(Outbound::Frame(ack)).await.is_err() {
        hub.deregister_runtime(&runtime_id, conn_id);
        return;
    }

    if let Err(e) = hub
        .store
        .record_audit(
            AuditRecord::new(&org_id, "runtime.connect")
                .runtime(&runtime_id)
                .detail(json!({ "agents": hello.agents.len() })),
        )
        .await
    {
        warn!(error = %e, "recording runtime.connect failed");
    }

    let writer = spawn_writer(sink, rx);

    // Token rotation: one refresher per connection, killed with it.
    let refresher_cancel = hub.shutdown.child_token();
    if hub.runtime_auth.rotation_enabled() {
        spawn_token_refresher(
            hub.clone(),
            runtime_id.clone(),
            tx.clone(),
            refresher_cancel.clone(),
        );
    }

    info!(runtime_id = %runtime_id, agents = hello.agents.len(), "runtime connected");

    while let Some(message) = read_frame(&mut stream).await {
        let Message::Text(text) = message else {
            debug!(runtime_id = %runtime_id, "ignoring non-text runtime frame");
            continue;
        };
        if text.len() > hub.cfg.max_ws_message_bytes {
            warn!(runtime_id = %runtime_id, size = text.len(), "oversized runtime frame dropped");
            continue;
        }
        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(env) => env,
            Err(e) => {
                debug!(runtime_id = %runtime_id, error = %e, "unparseable runtime frame");
                continue;
            }
        };
        dispatch_runtime_message(&hub, &runtime_id, envelope).await;
    }

    refresher_cancel.cancel();
    writer.abort();

    // Superseded-aware cleanup: only the connection that still owns the
    // registry entry marks the runtime offline.
    if hub.deregister_runtime(&runtime_id, conn_id) {
        if let Err(e) = hub.store.set_runtime_online(&runtime_id, false).await {
            warn!(error = %e, runtime_id = %runtime_id, "marking runtime offline failed");
        }
        if let Err(e) = hub
            .store
            .record_audit(AuditRecord::new(&org_id, "runtime.disconnect").runtime(&runtime_id))
            .await
        {
            warn!(error = %e, "recording runtime.disconnect failed");
        }
        info!(runtime_id = %runtime_id, "runtime disconnected");
    } else {
        debug!(runtime_id = %runtime_id, "superseded runtime reader exiting");
    }
}

/// Mint and push a fresh time-limited token at 80% of its lifetime. A send
/// failure means the connection is gone; the refresher dies with it.
fn spawn_token_refresher(
    hub: Arc<Hub>,
    runtime_id: String,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
) {
    let interval =
        std::time::Duration::from_secs_f64(hub.runtime_auth.token_lifetime_secs() as f64 * 0.8);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let Some((token, expires_at)) = hub.runtime_auth.mint_timed_token(&runtime_id) else {
                break;
            };
            let refresh = Envelope::new(MessageKind::TokenRefresh)
                .with_payload(&TokenRefresh { token, expires_at });
            if tx.send(Outbound::Frame(refresh)).await.is_err() {
                debug!(runtime_id = %runtime_id, "token refresher stopping, connection gone");
                break;
            }
            debug!(runtime_id = %runtime_id, "pushed rotated runtime token");
        }
    });
}

async fn dispatch_runtime_message(hub: &Arc<Hub>, runtime_id: &str, envelope: Envelope) {
    match envelope.kind {
        MessageKind::SessionCreated => {
            let Ok(created) = envelope.decode::<SessionCreated>() else {
                return;
            };
            if created.ok {
                if let Some(handle) = created.native_handle.as_deref() {
                    if let Err(e) = hub
                        .store
                        .set_session_native_handle(&created.session_id, handle)
                        .await
                    {
                        warn!(error = %e, session_id = %created.session_id,
                              "persisting native handle failed");
                    }
                }
            }
        }

        MessageKind::AgentOutput => {
            let Ok(output) = envelope.decode::<AgentOutput>() else {
                return;
            };
            handle_agent_output(hub, runtime_id, output).await;
        }

        MessageKind::TurnStarted => {
            let Ok(started) = envelope.decode::<TurnStarted>() else {
                return;
            };
            if !session_owned_by(hub, &started.session_id, runtime_id).await {
                return;
            }
            hub.turn_started
                .insert(started.session_id.clone(), Instant::now());
            if let Err(e) = hub
                .store
                .update_session_state(&started.session_id, SessionState::Responding)
                .await
            {
                warn!(error = %e, "updating session to responding failed");
            }
            hub.broadcast_to_session(&started.session_id, envelope);
        }

        MessageKind::TurnCompleted => {
            let Ok(completed) = envelope.decode::<TurnCompleted>() else {
                return;
            };
            if !session_owned_by(hub, &completed.session_id, runtime_id).await {
                return;
            }
            if let Err(e) = hub
                .store
                .update_session_state(&completed.session_id, SessionState::Active)
                .await
            {
                warn!(error = %e, "updating session to active failed");
            }

            let duration_ms = hub
                .turn_started
                .remove(&completed.session_id)
                .map(|(_, started)| started.elapsed().as_millis() as i64);
            let mut detail = json!({});
            if let Some(ms) = duration_ms {
                detail["duration_ms"] = json!(ms);
            }
            if let Some(code) = completed.exit_code {
                detail["exit_code"] = json!(code);
            }
            let org_id = session_org(hub, &completed.session_id).await;
            if let Err(e) = hub
                .store
                .record_audit(
                    AuditRecord::new(org_id, "turn.completed")
                        .session(&completed.session_id)
                        .runtime(runtime_id)
                        .detail(detail),
                )
                .await
            {
                warn!(error = %e, "recording turn.completed failed");
            }
            hub.broadcast_to_session(&completed.session_id, envelope);
        }

        MessageKind::StopAck => {
            if let Some(session_id) = envelope.session_id.clone() {
                hub.broadcast_to_session(&session_id, envelope);
            }
        }

        MessageKind::PermissionRequest => {
            let Ok(request) = envelope.decode::<PermissionRequest>() else {
                return;
            };
            if !session_owned_by(hub, &request.session_id, runtime_id).await {
                return;
            }
            hub.clone().install_permission(&request.request_id, &request.session_id, runtime_id);
            let org_id = session_org(hub, &request.session_id).await;
            if let Err(e) = hub
                .store
                .record_audit(
                    AuditRecord::new(org_id, "permission.requested")
                        .session(&request.session_id)
                        .runtime(runtime_id)
                        .detail(json!({ "request_id": request.request_id, "tool": request.tool })),
                )
                .await
            {
                warn!(error = %e, "recording permission.requested failed");
            }
            hub.broadcast_to_session(&request.session_id, envelope);
        }

        MessageKind::FileAvailable => {
            let Ok(available) = envelope.decode::<FileAvailable>() else {
                return;
            };
            handle_file_available(hub, runtime_id, available).await;
        }

        MessageKind::AgentConfigAck => {
            debug!(runtime_id, "agent config acknowledged");
        }

        MessageKind::NativeSessionsResponse => {
            let Ok(response) = envelope.decode::<NativeSessionsResponse>() else {
                return;
            };
            let Some((_, conn_id)) = hub.pending_native_lists.remove(&response.request_id) else {
                debug!(request_id = %response.request_id, "native list reply with no waiter");
                return;
            };
            if let Some(client) = hub.clients.get(&conn_id) {
                hub.send(&client.tx, envelope);
            }
        }

        MessageKind::Pong => {}

        other => {
            debug!(runtime_id, kind = %other, "unexpected runtime message");
        }
    }
}

/// Sessions are pinned to their runtime at creation; traffic about a session
/// from any other runtime is discarded.
async fn session_owned_by(hub: &Arc<Hub>, session_id: &str, runtime_id: &str) -> bool {
    match hub.store.get_session(session_id).await {
        Ok(Some(session)) if session.runtime_id == runtime_id => true,
        Ok(Some(session)) => {
            warn!(
                session_id,
                claimed = runtime_id,
                owner = %session.runtime_id,
                "runtime sent traffic for a session it does not own"
            );
            false
        }
        Ok(None) => {
            debug!(session_id, "runtime traffic for unknown session");
            false
        }
        Err(e) => {
            warn!(error = %e, session_id, "session lookup failed");
            false
        }
    }
}

async fn session_org(hub: &Arc<Hub>, session_id: &str) -> String {
    hub.store
        .get_session(session_id)
        .await
        .ok()
        .flatten()
        .map(|s| s.org_id)
        .unwrap_or_else(|| "default".to_string())
}

async fn handle_agent_output(hub: &Arc<Hub>, runtime_id: &str, output: AgentOutput) {
    if !session_owned_by(hub, &output.session_id, runtime_id).await {
        return;
    }
    if output.content.len() > hub.cfg.max_content_bytes {
        warn!(
            session_id = %output.session_id,
            size = output.content.len(),
            "oversized agent output dropped"
        );
        return;
    }

    let message_id = format!("msg_{}", nanoid::nanoid!(12));
    let seq = match hub
        .store
        .append_message(
            &output.session_id,
            &message_id,
            Direction::Agent,
            &output.channel,
            &output.content,
        )
        .await
    {
        Ok(seq) => seq,
        Err(e) => {
            warn!(error = %e, session_id = %output.session_id, "persisting agent output failed");
            return;
        }
    };
    if let Err(e) = hub.store.touch_session(&output.session_id).await {
        warn!(error = %e, "touching session failed");
    }

    // Outbound copy carries the authoritative seq; the runtime's message_id
    // is not echoed.
    let fan_out = Envelope::new(MessageKind::AgentOutput)
        .with_session(&output.session_id)
        .with_payload(&AgentOutput {
            session_id: output.session_id.clone(),
            message_id: None,
            seq,
            channel: output.channel.clone(),
            content: output.content.clone(),
            is_final: output.is_final,
        });
    hub.broadcast_to_session(&output.session_id, fan_out);
}

async fn handle_file_available(hub: &Arc<Hub>, runtime_id: &str, available: FileAvailable) {
    if files::validate_component(&available.session_id).is_err()
        || files::validate_component(&available.file_id).is_err()
    {
        warn!(runtime_id, "file.available with invalid path components");
        return;
    }
    let name = match files::sanitize_filename(&available.name) {
        Ok(name) => name,
        Err(e) => {
            warn!(runtime_id, error = %e, "file.available with unusable name");
            return;
        }
    };
    if !session_owned_by(hub, &available.session_id, runtime_id).await {
        return;
    }

    let bytes = match base64::engine::general_purpose::STANDARD.decode(&available.content_base64) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(runtime_id, error = %e, "file.available with invalid base64");
            return;
        }
    };
    if bytes.len() > hub.cfg.max_file_bytes {
        warn!(
            runtime_id,
            size = bytes.len(),
            "file.available exceeds the file size cap"
        );
        return;
    }

    if let Err(e) = files::store_file(
        &hub.cfg.files_root,
        &available.session_id,
        &available.file_id,
        &name,
        &bytes,
    )
    .await
    {
        warn!(error = %e, "storing runtime file failed");
        return;
    }

    let file_ref = FileRef {
        file_id: available.file_id.clone(),
        name: name.clone(),
        size: bytes.len() as u64,
    };
    let content = match serde_json::to_string(&file_ref) {
        Ok(content) => content,
        Err(e) => {
            warn!(error = %e, "encoding file reference failed");
            return;
        }
    };

    let message_id = format!("msg_{}", nanoid::nanoid!(12));
    let seq = match hub
        .store
        .append_message(
            &available.session_id,
            &message_id,
            Direction::Agent,
            CHANNEL_FILE,
            &content,
        )
        .await
    {
        Ok(seq) => seq,
        Err(e) => {
            warn!(error = %e, "persisting file message failed");
            return;
        }
    };

    let org_id = session_org(hub, &available.session_id).await;
    if let Err(e) = hub
        .store
        .record_audit(
            AuditRecord::new(org_id, "file.available")
                .session(&available.session_id)
                .runtime(runtime_id)
                .detail(json!({ "file_id": available.file_id, "name": name, "size": bytes.len() })),
        )
        .await
    {
        warn!(error = %e, "recording file.available failed");
    }

    let fan_out = Envelope::new(MessageKind::AgentOutput)
        .with_session(&available.session_id)
        .with_payload(&AgentOutput {
            session_id: available.session_id.clone(),
            message_id: None,
            seq,
            channel: CHANNEL_FILE.to_string(),
            content,
            is_final: true,
        });
    hub.broadcast_to_session(&available.session_id, fan_out);
}
