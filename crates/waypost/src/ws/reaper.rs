//! Background housekeeping: the idle reaper and retention purges.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use waypost_protocol::{Envelope, MessageKind, SessionClosed};

use crate::store::{AuditRecord, SessionState, Store};

use super::hub::Hub;

const REAPER_INTERVAL: Duration = Duration::from_secs(60);
const RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Scan live sessions every minute and close the ones whose `updated_at`
/// has fallen behind the applicable idle timeout.
pub fn spawn_idle_reaper(hub: Arc<Hub>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(REAPER_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = hub.shutdown.cancelled() => break,
                _ = tick.tick() => reap_idle_sessions(&hub).await,
            }
        }
    });
}

pub(crate) async fn reap_idle_sessions(hub: &Arc<Hub>) {
    let sessions = match hub.store().list_live_sessions().await {
        Ok(sessions) => sessions,
        Err(e) => {
            warn!(error = %e, "idle reaper could not list sessions");
            return;
        }
    };

    let now = Utc::now().naive_utc();
    for session in sessions {
        let timeout_secs = hub.config().idle_timeout_for(&session.profile);
        if timeout_secs == 0 {
            continue;
        }
        let Ok(updated_at) =
            NaiveDateTime::parse_from_str(&session.updated_at, "%Y-%m-%d %H:%M:%S")
        else {
            debug!(session_id = %session.id, "unparseable updated_at, skipping");
            continue;
        };
        let idle = now.signed_duration_since(updated_at);
        if idle.num_seconds() <= timeout_secs as i64 {
            continue;
        }

        if let Err(e) = hub
            .store()
            .update_session_state(&session.id, SessionState::Closed)
            .await
        {
            warn!(error = %e, session_id = %session.id, "idle close failed");
            continue;
        }
        if let Err(e) = hub
            .store()
            .record_audit(
                AuditRecord::new(&session.org_id, "session.idle_close")
                    .session(&session.id)
                    .user(&session.user_id)
                    .detail(json!({ "idle_secs": idle.num_seconds() })),
            )
            .await
        {
            warn!(error = %e, "recording idle close failed");
        }

        let closed = Envelope::new(MessageKind::SessionClosed)
            .with_session(&session.id)
            .with_payload(&SessionClosed {
                session_id: session.id.clone(),
                reason: Some("idle".to_string()),
            });
        hub.broadcast_to_session(&session.id, closed);
        hub.turn_started.remove(&session.id);
        info!(session_id = %session.id, idle_secs = idle.num_seconds(), "idle session closed");
    }
}

/// Hourly retention sweep over transcripts and the audit trail.
pub fn spawn_retention(
    store: Store,
    message_retention_days: u32,
    audit_retention_days: u32,
    shutdown: tokio_util::sync::CancellationToken,
) {
    if message_retention_days == 0 && audit_retention_days == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(RETENTION_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if message_retention_days > 0 {
                        let cutoff = Utc::now() - chrono::Duration::days(message_retention_days as i64);
                        match store.purge_messages_before(cutoff).await {
                            Ok(0) => {}
                            Ok(purged) => info!(purged, "purged old messages"),
                            Err(e) => warn!(error = %e, "message retention sweep failed"),
                        }
                    }
                    if audit_retention_days > 0 {
                        let cutoff = Utc::now() - chrono::Duration::days(audit_retention_days as i64);
                        match store.purge_audit_before(cutoff).await {
                            Ok(0) => {}
                            Ok(purged) => info!(purged, "purged old audit events"),
                            Err(e) => warn!(error = %e, "audit retention sweep failed"),
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RuntimeAuthenticator;
    use crate::config::Settings;
    use crate::db::Database;
    use crate::store::NewSession;
    use crate::ws::hub::HubConfig;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    async fn hub_with_timeout(idle_secs: u64) -> Arc<Hub> {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(&db);
        let auth = Arc::new(RuntimeAuthenticator::new(
            store.clone(),
            HashMap::new(),
            None,
            3600,
        ));
        let mut settings = Settings::default();
        settings.sessions.idle_timeout_secs = idle_secs;
        Hub::new(
            store,
            auth,
            HubConfig::from_settings(&settings),
            CancellationToken::new(),
        )
    }

    async fn seed_session(hub: &Arc<Hub>, updated_at_offset_secs: i64) -> String {
        let session = hub
            .store()
            .create_session(NewSession {
                org_id: "default".into(),
                user_id: "u1".into(),
                agent_id: "a1".into(),
                runtime_id: "r1".into(),
                profile: "cli".into(),
            })
            .await
            .unwrap();
        // Backdate updated_at to simulate idleness.
        sqlx::query("UPDATE sessions SET updated_at = datetime('now', ?) WHERE id = ?")
            .bind(format!("-{updated_at_offset_secs} seconds"))
            .bind(&session.id)
            .execute(hub.store().pool())
            .await
            .unwrap();
        session.id
    }

    #[tokio::test]
    async fn idle_sessions_are_closed() {
        let hub = hub_with_timeout(60).await;
        let stale = seed_session(&hub, 120).await;
        let fresh = seed_session(&hub, 10).await;

        reap_idle_sessions(&hub).await;

        let stale = hub.store().get_session(&stale).await.unwrap().unwrap();
        assert_eq!(stale.state, SessionState::Closed);
        let fresh = hub.store().get_session(&fresh).await.unwrap().unwrap();
        assert_ne!(fresh.state, SessionState::Closed);
    }

    #[tokio::test]
    async fn zero_timeout_disables_reaping() {
        let hub = hub_with_timeout(0).await;
        let stale = seed_session(&hub, 10_000).await;

        reap_idle_sessions(&hub).await;

        let session = hub.store().get_session(&stale).await.unwrap().unwrap();
        assert_ne!(session.state, SessionState::Closed);
    }
}
