//! Client (UI) WebSocket: bearer auth, subscription management, user turns.

use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use waypost_protocol::{
    ClientSubscribe, ClientUnsubscribe, Envelope, HistoryMessage, HistoryResponse, MessageKind,
    NativeSessionsList, PermissionResponse, StopRequest, UserMessage, CHANNEL_STDIN,
};

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::auth::Identity;
use crate::ratelimit::Bucket;
use crate::store::{AuditRecord, Direction, SessionState, MAX_PAGE};

use super::hub::{ClientHandle, Hub, Outbound};
use super::{read_frame, spawn_writer};

/// Per-connection inbound budget.
const INBOUND_RATE: f64 = 30.0;
const INBOUND_BURST: f64 = 50.0;

/// Replay ceiling for one subscribe.
const REPLAY_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct ClientWsQuery {
    /// Bearer token as a query parameter, for browser WebSocket clients
    /// that cannot set headers.
    pub token: Option<String>,
}

/// `GET /ws/client` — authenticate first, upgrade second.
pub async fn client_ws_handler(
    State(state): State<AppState>,
    Query(query): Query<ClientWsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = match bearer_token(&headers, query.token.as_deref()) {
        Some(token) => token,
        None => return ApiError::unauthorized("missing bearer token").into_response(),
    };
    let identity = match state.validator.validate(&token).await {
        Ok(identity) => identity,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let hub = state.hub.clone();
    ws.max_message_size(hub.cfg.max_ws_message_bytes)
        .on_upgrade(move |socket| handle_client_socket(socket, hub, identity))
}

fn bearer_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(token) = query_token {
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    let header = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
}

async fn handle_client_socket(socket: WebSocket, hub: Arc<Hub>, identity: Identity) {
    let (mut sink, mut stream) = socket.split();

    let conn_id = hub.next_conn_id();
    let (tx, rx) = mpsc::channel(hub.cfg.reply_buffer);

    let admitted = hub.register_client(
        conn_id,
        ClientHandle {
            identity: identity.clone(),
            tx: tx.clone(),
        },
    );
    if !admitted {
        info!(user_id = %identity.user_id, "client connection cap reached");
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "too many connections".into(),
            })))
            .await;
        return;
    }

    let writer = spawn_writer(sink, rx);
    info!(user_id = %identity.user_id, conn_id, "client connected");

    let mut bucket = Bucket::new(INBOUND_BURST);

    while let Some(message) = read_frame(&mut stream).await {
        let Message::Text(text) = message else {
            continue;
        };
        // Over-limit messages are dropped without a reply.
        if !bucket.allow(INBOUND_RATE, INBOUND_BURST) {
            debug!(user_id = %identity.user_id, "client message rate limited");
            continue;
        }
        if text.len() > hub.cfg.max_ws_message_bytes {
            hub.send(
                &tx,
                Hub::error_frame("too_large", "message exceeds size limit", None),
            );
            continue;
        }
        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(env) => env,
            Err(e) => {
                debug!(user_id = %identity.user_id, error = %e, "unparseable client frame");
                continue;
            }
        };
        dispatch_client_message(&hub, &identity, conn_id, &tx, envelope).await;
    }

    writer.abort();
    hub.deregister_client(conn_id);
    info!(user_id = %identity.user_id, conn_id, "client disconnected");
}

async fn dispatch_client_message(
    hub: &Arc<Hub>,
    identity: &Identity,
    conn_id: u64,
    tx: &mpsc::Sender<Outbound>,
    envelope: Envelope,
) {
    match envelope.kind {
        MessageKind::UserMessage => {
            let Ok(message) = envelope.decode::<UserMessage>() else {
                hub.send(tx, Hub::error_frame("validation", "malformed user.message", None));
                return;
            };
            handle_user_message(hub, identity, tx, message, envelope).await;
        }

        MessageKind::ClientSubscribe => {
            let Ok(subscribe) = envelope.decode::<ClientSubscribe>() else {
                return;
            };
            handle_subscribe(hub, identity, conn_id, tx, subscribe).await;
        }

        MessageKind::ClientUnsubscribe => {
            let Ok(unsubscribe) = envelope.decode::<ClientUnsubscribe>() else {
                return;
            };
            hub.unsubscribe(&unsubscribe.session_id, conn_id);
        }

        MessageKind::StopRequest => {
            let Ok(stop) = envelope.decode::<StopRequest>() else {
                return;
            };
            let Some(session) = load_session_checked(hub, identity, &stop.session_id, tx, false).await
            else {
                return;
            };
            hub.send_to_runtime(&session.runtime_id, envelope);
            if let Err(e) = hub
                .store
                .record_audit(
                    AuditRecord::new(&session.org_id, "session.stop")
                        .user(&identity.user_id)
                        .session(&session.id),
                )
                .await
            {
                warn!(error = %e, "recording session.stop failed");
            }
        }

        MessageKind::PermissionResponse => {
            let Ok(response) = envelope.decode::<PermissionResponse>() else {
                return;
            };
            if load_session_checked(hub, identity, &response.session_id, tx, false)
                .await
                .is_none()
            {
                return;
            }
            match hub.resolve_permission(identity, &response).await {
                Ok(true) => {}
                // Already timed out: dropped silently by design.
                Ok(false) => {
                    debug!(request_id = %response.request_id, "late permission response dropped")
                }
                Err(e) => warn!(error = %e, "resolving permission failed"),
            }
        }

        MessageKind::NativeSessionsList => {
            let Ok(list) = envelope.decode::<NativeSessionsList>() else {
                return;
            };
            let agent = match hub.store.get_agent(&list.agent_id).await {
                Ok(Some(agent)) => agent,
                Ok(None) => {
                    hub.send(tx, Hub::error_frame("not_found", "agent not found", None));
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "agent lookup failed");
                    hub.send(
                        tx,
                        Hub::error_frame("persist_failed", "agent lookup failed", None),
                    );
                    return;
                }
            };
            hub.pending_native_lists
                .insert(list.request_id.clone(), conn_id);
            if !hub.send_to_runtime(&agent.runtime_id, envelope) {
                hub.pending_native_lists.remove(&list.request_id);
                hub.send(
                    tx,
                    Hub::error_frame("dependency_unavailable", "runtime is offline", None),
                );
            }
        }

        MessageKind::Ping => {
            hub.send(tx, Envelope::new(MessageKind::Pong));
        }

        MessageKind::Pong => {}

        other => {
            debug!(user_id = %identity.user_id, kind = %other, "unexpected client message");
        }
    }
}

/// Load a session, answering with an `error` frame on failure. `admin_ok`
/// widens the check from strict ownership to owner-or-admin (used for
/// observation, not for acting in the session).
async fn load_session_checked(
    hub: &Arc<Hub>,
    identity: &Identity,
    session_id: &str,
    tx: &mpsc::Sender<Outbound>,
    admin_ok: bool,
) -> Option<crate::store::Session> {
    match hub.store.get_session(session_id).await {
        Ok(Some(session)) => {
            let allowed = if admin_ok {
                Hub::can_view(identity, &session)
            } else {
                session.user_id == identity.user_id
            };
            if allowed {
                Some(session)
            } else {
                hub.send(
                    tx,
                    Hub::error_frame("forbidden", "not your session", Some(session_id)),
                );
                None
            }
        }
        Ok(None) => {
            hub.send(
                tx,
                Hub::error_frame("session_not_found", "session not found", Some(session_id)),
            );
            None
        }
        Err(e) => {
            warn!(error = %e, session_id, "session lookup failed");
            hub.send(
                tx,
                Hub::error_frame("persist_failed", "session lookup failed", Some(session_id)),
            );
            None
        }
    }
}

async fn handle_user_message(
    hub: &Arc<Hub>,
    identity: &Identity,
    tx: &mpsc::Sender<Outbound>,
    message: UserMessage,
    envelope: Envelope,
) {
    // Idempotency: a resent (session_id, message_id) pair is dropped without
    // a second append, forward, or audit.
    match hub
        .store
        .message_exists(&message.session_id, &message.message_id)
        .await
    {
        Ok(true) => {
            debug!(message_id = %message.message_id, "duplicate user message dropped");
            return;
        }
        Ok(false) => {}
        Err(e) => {
            warn!(error = %e, "idempotency check failed");
            hub.send(
                tx,
                Hub::error_frame(
                    "persist_failed",
                    "message check failed",
                    Some(&message.session_id),
                ),
            );
            return;
        }
    }

    let Some(session) = load_session_checked(hub, identity, &message.session_id, tx, false).await else {
        return;
    };

    if session.state == SessionState::Closed {
        hub.send(
            tx,
            Hub::error_frame("conflict", "session is closed", Some(&session.id)),
        );
        return;
    }

    if hub.cfg.turn_based && session.state == SessionState::Responding {
        hub.send(
            tx,
            Hub::error_frame(
                "turn_in_progress",
                "a turn is already running",
                Some(&session.id),
            ),
        );
        return;
    }

    if message.content.len() > hub.cfg.max_content_bytes {
        hub.send(
            tx,
            Hub::error_frame("too_large", "message content too large", Some(&session.id)),
        );
        return;
    }

    // Persist-then-forward: the transcript owns the message before the
    // runtime hears about it.
    let seq = match hub
        .store
        .append_message(
            &session.id,
            &message.message_id,
            Direction::User,
            CHANNEL_STDIN,
            &message.content,
        )
        .await
    {
        Ok(seq) => seq,
        Err(e) => {
            warn!(error = %e, session_id = %session.id, "persisting user message failed");
            hub.send(
                tx,
                Hub::error_frame("persist_failed", "message not persisted", Some(&session.id)),
            );
            return;
        }
    };
    if let Err(e) = hub.store.touch_session(&session.id).await {
        warn!(error = %e, "touching session failed");
    }

    if let Err(e) = hub
        .store
        .record_audit(
            AuditRecord::new(&session.org_id, "message.sent")
                .user(&identity.user_id)
                .session(&session.id)
                .detail(serde_json::json!({ "seq": seq })),
        )
        .await
    {
        warn!(error = %e, "recording message.sent failed");
    }

    // Subscribers see the user message with its assigned seq.
    let fan_out = Envelope::new(MessageKind::UserMessage)
        .with_session(&session.id)
        .with_payload(&serde_json::json!({
            "session_id": session.id,
            "message_id": message.message_id,
            "content": message.content,
            "seq": seq,
        }));
    hub.broadcast_to_session(&session.id, fan_out);

    // A forward failure is not an error to the sender: the message is
    // captured and replays on the next subscribe.
    if !hub.send_to_runtime(&session.runtime_id, envelope) {
        warn!(session_id = %session.id, runtime_id = %session.runtime_id,
              "user message persisted but runtime unreachable");
    }
}

async fn handle_subscribe(
    hub: &Arc<Hub>,
    identity: &Identity,
    conn_id: u64,
    tx: &mpsc::Sender<Outbound>,
    subscribe: ClientSubscribe,
) {
    let Some(session) = load_session_checked(hub, identity, &subscribe.session_id, tx, true).await else {
        return;
    };

    hub.subscribe(&session.id, conn_id, tx.clone());

    // Replay on request, in pages, capped at REPLAY_LIMIT.
    let Some(mut after_seq) = subscribe.after_seq else {
        return;
    };
    let mut replayed: i64 = 0;
    let mut messages = Vec::new();
    while replayed < REPLAY_LIMIT {
        let page_size = MAX_PAGE.min(REPLAY_LIMIT - replayed);
        let page = match hub.store.get_messages(&session.id, after_seq, page_size).await {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, "loading history failed");
                hub.send(
                    tx,
                    Hub::error_frame("persist_failed", "history unavailable", Some(&session.id)),
                );
                return;
            }
        };
        if page.is_empty() {
            break;
        }
        replayed += page.len() as i64;
        after_seq = page.last().map(|m| m.seq).unwrap_or(after_seq);
        messages.extend(page.into_iter().map(|m| HistoryMessage {
            id: m.id,
            seq: m.seq,
            direction: m.direction.to_string(),
            channel: m.channel,
            content: m.content,
            created_at: m.created_at,
        }));
    }

    let history = Envelope::new(MessageKind::HistoryResponse)
        .with_session(&session.id)
        .with_payload(&HistoryResponse {
            session_id: session.id.clone(),
            messages,
        });
    // History goes through the same per-connection queue as live fan-out,
    // so the client sees replay before anything that follows it.
    if tx.send(Outbound::Frame(history)).await.is_err() {
        debug!(conn_id, "subscriber vanished during history replay");
    }
}
