//! The hub owns all transient routing state: which runtime and client
//! connections exist, who subscribes to which session, which permission
//! requests are pending, and which native-list requests await a reply.
//!
//! Concurrency model: registries are `DashMap`s, so displacement and
//! permission resolution get their single-winner semantics from atomic map
//! `insert`/`remove`. Every peer connection owns an `mpsc` sender; one
//! writer task per connection owns the socket sink and serializes every
//! outbound frame, keepalive pings included.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::CloseFrame;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use waypost_protocol::{
    Envelope, ErrorPayload, MessageKind, PermissionResponse, SessionClose, SessionClosed,
    SessionCreate,
};

use crate::auth::{Identity, RuntimeAuthenticator};
use crate::config::{AgentAccessMode, Settings};
use crate::store::{AuditRecord, NewSession, Session, SessionState, Store};

/// How long a permission request may stay pending before it is auto-denied.
pub const PERMISSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Outbound traffic for one connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(Envelope),
    Close(Option<CloseFrame>),
}

pub type WsSender = mpsc::Sender<Outbound>;

/// Routing-relevant configuration, extracted from [`Settings`] once at
/// startup.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub turn_based: bool,
    pub max_sessions_per_user: usize,
    pub max_client_conns_per_user: usize,
    pub max_content_bytes: usize,
    pub max_ws_message_bytes: usize,
    pub reply_buffer: usize,
    pub max_file_bytes: usize,
    pub files_root: PathBuf,
    pub idle_timeout_secs: u64,
    pub idle_overrides: HashMap<String, u64>,
    pub default_agent_access: AgentAccessMode,
    pub message_retention_days: u32,
    pub audit_retention_days: u32,
}

impl HubConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            turn_based: settings.sessions.turn_based,
            max_sessions_per_user: settings.sessions.max_per_user,
            max_client_conns_per_user: 10,
            max_content_bytes: settings.sessions.max_content_bytes,
            max_ws_message_bytes: settings.sessions.max_ws_message_bytes,
            reply_buffer: settings.sessions.reply_buffer,
            max_file_bytes: settings.files.max_file_bytes,
            files_root: settings.files.root.clone(),
            idle_timeout_secs: settings.sessions.idle_timeout_secs,
            idle_overrides: settings.sessions.idle_overrides.clone(),
            default_agent_access: settings.auth.default_agent_access,
            message_retention_days: settings.storage.message_retention_days,
            audit_retention_days: settings.storage.audit_retention_days,
        }
    }

    /// Idle timeout for a profile, seconds. `0` disables reaping.
    pub fn idle_timeout_for(&self, profile: &str) -> u64 {
        self.idle_overrides
            .get(profile)
            .copied()
            .unwrap_or(self.idle_timeout_secs)
    }
}

/// A live runtime connection.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeHandle {
    pub conn_id: u64,
    pub org_id: String,
    pub tx: WsSender,
}

/// A live client connection.
#[derive(Debug, Clone)]
pub(crate) struct ClientHandle {
    pub identity: Identity,
    pub tx: WsSender,
}

/// A permission request waiting for its single terminal transition.
pub(crate) struct PendingPermission {
    pub session_id: String,
    pub runtime_id: String,
    pub cancel: CancellationToken,
}

/// Session creation failure, mapped to HTTP by the API layer.
#[derive(Debug, thiserror::Error)]
pub enum CreateSessionError {
    #[error("agent not found")]
    AgentNotFound,
    #[error("agent access denied")]
    Forbidden,
    #[error("runtime is offline")]
    RuntimeOffline,
    #[error("session limit reached")]
    SessionLimit,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub struct Hub {
    pub(crate) store: Store,
    pub(crate) runtime_auth: Arc<RuntimeAuthenticator>,
    pub(crate) cfg: HubConfig,
    pub(crate) shutdown: CancellationToken,

    next_conn_id: AtomicU64,
    pub(crate) runtimes: DashMap<String, RuntimeHandle>,
    pub(crate) clients: DashMap<u64, ClientHandle>,
    pub(crate) user_conn_counts: DashMap<String, usize>,
    /// session_id -> conn_id -> sender.
    pub(crate) subscribers: DashMap<String, HashMap<u64, WsSender>>,
    /// request_id -> pending permission.
    pub(crate) pending_permissions: DashMap<String, PendingPermission>,
    /// request_id -> client conn awaiting a native_sessions.response.
    pub(crate) pending_native_lists: DashMap<String, u64>,
    /// session_id -> turn start, for duration telemetry.
    pub(crate) turn_started: DashMap<String, Instant>,
}

impl Hub {
    pub fn new(
        store: Store,
        runtime_auth: Arc<RuntimeAuthenticator>,
        cfg: HubConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            runtime_auth,
            cfg,
            shutdown,
            next_conn_id: AtomicU64::new(1),
            runtimes: DashMap::new(),
            clients: DashMap::new(),
            user_conn_counts: DashMap::new(),
            subscribers: DashMap::new(),
            pending_permissions: DashMap::new(),
            pending_native_lists: DashMap::new(),
            turn_started: DashMap::new(),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &HubConfig {
        &self.cfg
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Connection registries
    // ------------------------------------------------------------------

    /// Register a runtime connection, returning the handle it displaced, if
    /// any. The insert is the atomic arbiter: whichever hello lands second
    /// owns the id.
    pub(crate) fn register_runtime(
        &self,
        runtime_id: &str,
        handle: RuntimeHandle,
    ) -> Option<RuntimeHandle> {
        self.runtimes.insert(runtime_id.to_string(), handle)
    }

    /// Superseded-aware removal: only drops the entry (and reports true) if
    /// it still points at `conn_id`. A newer connection's entry survives.
    pub(crate) fn deregister_runtime(&self, runtime_id: &str, conn_id: u64) -> bool {
        self.runtimes
            .remove_if(runtime_id, |_, handle| handle.conn_id == conn_id)
            .is_some()
    }

    pub fn runtime_online(&self, runtime_id: &str) -> bool {
        self.runtimes.contains_key(runtime_id)
    }

    /// Register a client connection unless the user is at their cap.
    pub(crate) fn register_client(&self, conn_id: u64, handle: ClientHandle) -> bool {
        let user_id = handle.identity.user_id.clone();
        {
            let mut count = self.user_conn_counts.entry(user_id).or_insert(0);
            if *count >= self.cfg.max_client_conns_per_user {
                return false;
            }
            *count += 1;
        }
        self.clients.insert(conn_id, handle);
        true
    }

    pub(crate) fn deregister_client(&self, conn_id: u64) {
        let Some((_, handle)) = self.clients.remove(&conn_id) else {
            return;
        };
        let user_id = handle.identity.user_id;
        if let Some(mut count) = self.user_conn_counts.get_mut(&user_id) {
            *count = count.saturating_sub(1);
        }
        self.user_conn_counts.remove_if(&user_id, |_, c| *c == 0);

        for mut entry in self.subscribers.iter_mut() {
            entry.value_mut().remove(&conn_id);
        }
        self.subscribers.retain(|_, conns| !conns.is_empty());
        self.pending_native_lists.retain(|_, c| *c != conn_id);
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Queue a frame on one connection. Failure (peer gone or buffer full)
    /// is reported but never blocks the caller; the peer's own reader will
    /// clean it up.
    pub(crate) fn send(&self, tx: &WsSender, envelope: Envelope) -> bool {
        match tx.try_send(Outbound::Frame(envelope)) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "dropping frame for slow or closed peer");
                false
            }
        }
    }

    pub(crate) fn send_to_runtime(&self, runtime_id: &str, envelope: Envelope) -> bool {
        match self.runtimes.get(runtime_id) {
            Some(handle) => self.send(&handle.tx, envelope),
            None => {
                debug!(runtime_id, "no connection for runtime, dropping frame");
                false
            }
        }
    }

    /// Fan a frame out to every subscriber of a session. The subscriber set
    /// is snapshotted first so a slow peer cannot hold the map open.
    pub fn broadcast_to_session(&self, session_id: &str, envelope: Envelope) {
        let targets: Vec<WsSender> = match self.subscribers.get(session_id) {
            Some(entry) => entry.values().cloned().collect(),
            None => return,
        };
        for tx in targets {
            self.send(&tx, envelope.clone());
        }
    }

    pub(crate) fn subscribe(&self, session_id: &str, conn_id: u64, tx: WsSender) {
        self.subscribers
            .entry(session_id.to_string())
            .or_default()
            .insert(conn_id, tx);
    }

    pub(crate) fn unsubscribe(&self, session_id: &str, conn_id: u64) {
        if let Some(mut entry) = self.subscribers.get_mut(session_id) {
            entry.remove(&conn_id);
        }
        self.subscribers
            .remove_if(session_id, |_, conns| conns.is_empty());
    }

    /// Build an `error` frame.
    pub(crate) fn error_frame(code: &str, message: &str, session_id: Option<&str>) -> Envelope {
        Envelope::new(MessageKind::Error).with_payload(&ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
            session_id: session_id.map(String::from),
        })
    }

    // ------------------------------------------------------------------
    // Visibility
    // ------------------------------------------------------------------

    /// Owner or admin may observe a session.
    pub fn can_view(identity: &Identity, session: &Session) -> bool {
        identity.is_admin() || session.user_id == identity.user_id
    }

    /// Whether `identity` may use `agent_id`, honoring the default access
    /// mode and per-user grants.
    pub async fn can_use_agent(&self, identity: &Identity, agent_id: &str) -> anyhow::Result<bool> {
        if identity.is_admin() || self.cfg.default_agent_access == AgentAccessMode::All {
            return Ok(true);
        }
        self.store.has_permission(&identity.user_id, agent_id).await
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Resolve the agent, enforce caps, insert the `creating` row, audit,
    /// and fire the asynchronous `session.create` at the owning runtime.
    pub async fn create_session(
        &self,
        identity: &Identity,
        agent_id: &str,
    ) -> Result<Session, CreateSessionError> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or(CreateSessionError::AgentNotFound)?;

        if !self.can_use_agent(identity, agent_id).await? {
            return Err(CreateSessionError::Forbidden);
        }

        if !self.runtime_online(&agent.runtime_id) {
            return Err(CreateSessionError::RuntimeOffline);
        }

        if self.cfg.max_sessions_per_user > 0 {
            let live = self
                .store
                .count_live_sessions_for_user(&identity.user_id)
                .await?;
            if live >= self.cfg.max_sessions_per_user as i64 {
                return Err(CreateSessionError::SessionLimit);
            }
        }

        let session = self
            .store
            .create_session(NewSession {
                org_id: identity.org_id.clone(),
                user_id: identity.user_id.clone(),
                agent_id: agent.id.clone(),
                runtime_id: agent.runtime_id.clone(),
                profile: agent.profile.clone(),
            })
            .await?;

        self.store
            .record_audit(
                AuditRecord::new(&identity.org_id, "session.create")
                    .user(&identity.user_id)
                    .session(&session.id)
                    .agent(&agent.id)
                    .runtime(&agent.runtime_id),
            )
            .await?;

        let create = Envelope::new(MessageKind::SessionCreate)
            .with_session(&session.id)
            .with_payload(&SessionCreate {
                session_id: session.id.clone(),
                agent_id: agent.id,
                profile: session.profile.clone(),
                user_id: identity.user_id.clone(),
            });
        if !self.send_to_runtime(&agent.runtime_id, create) {
            // The row stays in `creating`; the client sees it never turn
            // active and can close it. Nothing to roll back.
            warn!(session_id = %session.id, runtime_id = %agent.runtime_id,
                  "session.create could not be forwarded");
        }

        info!(session_id = %session.id, user_id = %identity.user_id, "session created");
        Ok(session)
    }

    /// Close a session from the HTTP surface: mark closed, audit, tell the
    /// runtime, tell the subscribers.
    pub async fn close_session(
        &self,
        identity: &Identity,
        session: &Session,
        reason: &str,
    ) -> anyhow::Result<()> {
        self.store
            .update_session_state(&session.id, SessionState::Closed)
            .await?;
        self.store
            .record_audit(
                AuditRecord::new(&session.org_id, "session.close")
                    .user(&identity.user_id)
                    .session(&session.id)
                    .detail(json!({ "reason": reason })),
            )
            .await?;

        let close = Envelope::new(MessageKind::SessionClose)
            .with_session(&session.id)
            .with_payload(&SessionClose {
                session_id: session.id.clone(),
                reason: Some(reason.to_string()),
            });
        self.send_to_runtime(&session.runtime_id, close);

        let closed = Envelope::new(MessageKind::SessionClosed)
            .with_session(&session.id)
            .with_payload(&SessionClosed {
                session_id: session.id.clone(),
                reason: Some(reason.to_string()),
            });
        self.broadcast_to_session(&session.id, closed);
        self.turn_started.remove(&session.id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Permission state machine
    // ------------------------------------------------------------------

    /// Install a pending permission entry and arm its timer. On expiry the
    /// timer branch removes the entry; whoever removes it owns the terminal
    /// transition.
    pub(crate) fn install_permission(
        self: Arc<Self>,
        request_id: &str,
        session_id: &str,
        runtime_id: &str,
    ) {
        let cancel = self.shutdown.child_token();
        self.pending_permissions.insert(
            request_id.to_string(),
            PendingPermission {
                session_id: session_id.to_string(),
                runtime_id: runtime_id.to_string(),
                cancel: cancel.clone(),
            },
        );

        let request_id = request_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(PERMISSION_TIMEOUT) => {
                    self.permission_timed_out(&request_id).await;
                }
            }
        });
    }

    async fn permission_timed_out(&self, request_id: &str) {
        // The remove is the arbiter: if the client's response won, the entry
        // is already gone and this branch is a no-op.
        let Some((_, pending)) = self.pending_permissions.remove(request_id) else {
            return;
        };

        let org_id = self
            .store
            .get_session(&pending.session_id)
            .await
            .ok()
            .flatten()
            .map(|s| s.org_id)
            .unwrap_or_else(|| "default".to_string());

        if let Err(e) = self
            .store
            .record_audit(
                AuditRecord::new(org_id, "permission.timeout")
                    .session(&pending.session_id)
                    .detail(json!({ "request_id": request_id })),
            )
            .await
        {
            warn!(error = %e, "recording permission timeout failed");
        }

        let denial = Envelope::new(MessageKind::PermissionResponse)
            .with_session(&pending.session_id)
            .with_payload(&PermissionResponse {
                session_id: pending.session_id.clone(),
                request_id: request_id.to_string(),
                approved: false,
            });
        self.send_to_runtime(&pending.runtime_id, denial.clone());
        self.broadcast_to_session(&pending.session_id, denial);
        info!(request_id, session_id = %pending.session_id, "permission request timed out");
    }

    /// Resolve a pending permission from a client response. Returns false
    /// when no entry was pending (it already timed out) — the caller drops
    /// the response silently. The entry must belong to the session the
    /// response names.
    pub(crate) async fn resolve_permission(
        &self,
        identity: &Identity,
        response: &PermissionResponse,
    ) -> anyhow::Result<bool> {
        let Some((_, pending)) = self
            .pending_permissions
            .remove_if(&response.request_id, |_, p| {
                p.session_id == response.session_id
            })
        else {
            return Ok(false);
        };
        pending.cancel.cancel();

        let action = if response.approved {
            "permission.granted"
        } else {
            "permission.denied"
        };
        self.store
            .record_audit(
                AuditRecord::new(&identity.org_id, action)
                    .user(&identity.user_id)
                    .session(&pending.session_id)
                    .detail(json!({ "request_id": response.request_id })),
            )
            .await?;

        let relay = Envelope::new(MessageKind::PermissionResponse)
            .with_session(&pending.session_id)
            .with_payload(response);
        self.send_to_runtime(&pending.runtime_id, relay);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn test_hub() -> Arc<Hub> {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(&db);
        let auth = Arc::new(RuntimeAuthenticator::new(
            store.clone(),
            HashMap::new(),
            None,
            3600,
        ));
        let settings = Settings::default();
        Hub::new(
            store,
            auth,
            HubConfig::from_settings(&settings),
            CancellationToken::new(),
        )
    }

    fn handle(conn_id: u64) -> (RuntimeHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        (
            RuntimeHandle {
                conn_id,
                org_id: "default".into(),
                tx,
            },
            rx,
        )
    }

    fn identity(user: &str) -> Identity {
        Identity {
            user_id: user.into(),
            username: user.into(),
            role: crate::store::Role::User,
            org_id: "default".into(),
        }
    }

    #[tokio::test]
    async fn displacement_keeps_newest_connection() {
        let hub = test_hub().await;

        let (h1, _rx1) = handle(1);
        assert!(hub.register_runtime("r1", h1).is_none());

        let (h2, _rx2) = handle(2);
        let displaced = hub.register_runtime("r1", h2).unwrap();
        assert_eq!(displaced.conn_id, 1);

        // The displaced reader's cleanup must not remove the new entry.
        assert!(!hub.deregister_runtime("r1", 1));
        assert!(hub.runtime_online("r1"));

        // The owning reader's cleanup does.
        assert!(hub.deregister_runtime("r1", 2));
        assert!(!hub.runtime_online("r1"));
    }

    #[tokio::test]
    async fn client_connection_cap_enforced() {
        let hub = test_hub().await;

        for i in 0..hub.cfg.max_client_conns_per_user {
            let (tx, _rx) = mpsc::channel(1);
            // Receivers dropped; registration cares only about counting.
            assert!(
                hub.register_client(
                    i as u64,
                    ClientHandle {
                        identity: identity("u1"),
                        tx,
                    }
                ),
                "connection {i} should be admitted"
            );
        }

        let (tx, _rx) = mpsc::channel(1);
        assert!(!hub.register_client(
            99,
            ClientHandle {
                identity: identity("u1"),
                tx,
            }
        ));

        // Freeing one slot re-admits.
        hub.deregister_client(0);
        let (tx, _rx) = mpsc::channel(1);
        assert!(hub.register_client(
            100,
            ClientHandle {
                identity: identity("u1"),
                tx,
            }
        ));
    }

    #[tokio::test]
    async fn subscriber_sets_clean_up_with_client() {
        let hub = test_hub().await;
        let (tx, mut rx) = mpsc::channel(8);
        hub.register_client(
            7,
            ClientHandle {
                identity: identity("u1"),
                tx: tx.clone(),
            },
        );
        hub.subscribe("sess_1", 7, tx);

        hub.broadcast_to_session("sess_1", Envelope::new(MessageKind::TurnStarted));
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Frame(_)));

        hub.deregister_client(7);
        hub.broadcast_to_session("sess_1", Envelope::new(MessageKind::TurnStarted));
        assert!(rx.try_recv().is_err());
        assert!(hub.subscribers.get("sess_1").is_none());
    }

    #[tokio::test]
    async fn permission_single_winner_response_side() {
        let hub = test_hub().await;
        let (rt, mut rt_rx) = handle(1);
        hub.register_runtime("r1", rt);

        hub.clone().install_permission("req1", "sess_1", "r1");

        let response = PermissionResponse {
            session_id: "sess_1".into(),
            request_id: "req1".into(),
            approved: true,
        };
        // First resolution wins and relays to the runtime.
        assert!(hub
            .resolve_permission(&identity("u1"), &response)
            .await
            .unwrap());
        assert!(matches!(rt_rx.try_recv().unwrap(), Outbound::Frame(_)));

        // Second resolution finds nothing pending.
        assert!(!hub
            .resolve_permission(&identity("u1"), &response)
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn permission_timeout_auto_denies_both_ways() {
        let hub = test_hub().await;
        let (rt, mut rt_rx) = handle(1);
        hub.register_runtime("r1", rt);

        let (sub_tx, mut sub_rx) = mpsc::channel(8);
        hub.subscribe("sess_1", 5, sub_tx);

        hub.clone().install_permission("req1", "sess_1", "r1");
        tokio::time::advance(PERMISSION_TIMEOUT + Duration::from_secs(1)).await;
        // Let the timer task run.
        tokio::task::yield_now().await;

        let frame = rt_rx.recv().await.unwrap();
        let Outbound::Frame(env) = frame else {
            panic!("expected frame")
        };
        assert_eq!(env.kind, MessageKind::PermissionResponse);
        let denial: PermissionResponse = env.decode().unwrap();
        assert!(!denial.approved);

        let Outbound::Frame(env) = sub_rx.recv().await.unwrap() else {
            panic!("expected frame")
        };
        assert_eq!(env.kind, MessageKind::PermissionResponse);

        // A late client response is a no-op.
        assert!(!hub
            .resolve_permission(
                &identity("u1"),
                &PermissionResponse {
                    session_id: "sess_1".into(),
                    request_id: "req1".into(),
                    approved: true,
                }
            )
            .await
            .unwrap());
    }
}
