//! Session rows. Every mutation refreshes `updated_at`, which the idle
//! reaper uses as its clock.

use anyhow::{Context, Result};

use super::models::{Session, SessionState};
use super::Store;

/// Parameters for inserting a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub org_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub runtime_id: String,
    pub profile: String,
}

impl Store {
    fn generate_session_id() -> String {
        format!("sess_{}", nanoid::nanoid!(12))
    }

    pub async fn create_session(&self, new: NewSession) -> Result<Session> {
        let id = Self::generate_session_id();
        sqlx::query(
            r#"
            INSERT INTO sessions (id, org_id, user_id, agent_id, runtime_id, profile, state)
            VALUES (?, ?, ?, ?, ?, ?, 'creating')
            "#,
        )
        .bind(&id)
        .bind(&new.org_id)
        .bind(&new.user_id)
        .bind(&new.agent_id)
        .bind(&new.runtime_id)
        .bind(&new.profile)
        .execute(self.pool())
        .await
        .context("inserting session")?;

        self.get_session(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session not found after insert"))
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, org_id, user_id, agent_id, runtime_id, profile, state,
                   native_handle, created_at, updated_at
            FROM sessions WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .context("fetching session")?;
        Ok(session)
    }

    pub async fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, org_id, user_id, agent_id, runtime_id, profile, state,
                   native_handle, created_at, updated_at
            FROM sessions WHERE user_id = ? ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await
        .context("listing sessions for user")?;
        Ok(sessions)
    }

    pub async fn list_sessions(&self, org_id: &str) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, org_id, user_id, agent_id, runtime_id, profile, state,
                   native_handle, created_at, updated_at
            FROM sessions WHERE org_id = ? ORDER BY created_at DESC
            "#,
        )
        .bind(org_id)
        .fetch_all(self.pool())
        .await
        .context("listing sessions")?;
        Ok(sessions)
    }

    /// Sessions the idle reaper considers: anything not yet closed.
    pub async fn list_live_sessions(&self) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, org_id, user_id, agent_id, runtime_id, profile, state,
                   native_handle, created_at, updated_at
            FROM sessions WHERE state != 'closed' ORDER BY created_at
            "#,
        )
        .fetch_all(self.pool())
        .await
        .context("listing live sessions")?;
        Ok(sessions)
    }

    pub async fn count_live_sessions_for_user(&self, user_id: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sessions WHERE user_id = ? AND state != 'closed'",
        )
        .bind(user_id)
        .fetch_one(self.pool())
        .await
        .context("counting live sessions")?;
        Ok(row.0)
    }

    pub async fn update_session_state(&self, id: &str, state: SessionState) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET state = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(state.to_string())
        .bind(id)
        .execute(self.pool())
        .await
        .context("updating session state")?;
        Ok(())
    }

    pub async fn set_session_native_handle(&self, id: &str, handle: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET native_handle = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(handle)
        .bind(id)
        .execute(self.pool())
        .await
        .context("setting session native handle")?;
        Ok(())
    }

    /// Refresh `updated_at` without a state change (message traffic keeps an
    /// active session out of the reaper's reach).
    pub async fn touch_session(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET updated_at = datetime('now') WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .context("touching session")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn new_session(user: &str) -> NewSession {
        NewSession {
            org_id: "default".into(),
            user_id: user.into(),
            agent_id: "a1".into(),
            runtime_id: "r1".into(),
            profile: "cli".into(),
        }
    }

    #[tokio::test]
    async fn lifecycle_and_counting() {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(&db);

        let s1 = store.create_session(new_session("u1")).await.unwrap();
        let s2 = store.create_session(new_session("u1")).await.unwrap();
        assert_eq!(s1.state, SessionState::Creating);
        assert_eq!(store.count_live_sessions_for_user("u1").await.unwrap(), 2);

        store
            .update_session_state(&s2.id, SessionState::Closed)
            .await
            .unwrap();
        assert_eq!(store.count_live_sessions_for_user("u1").await.unwrap(), 1);

        let live = store.list_live_sessions().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, s1.id);
    }

    #[tokio::test]
    async fn native_handle_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(&db);

        let s = store.create_session(new_session("u1")).await.unwrap();
        assert!(s.native_handle.is_none());

        store
            .set_session_native_handle(&s.id, "cli-session-9")
            .await
            .unwrap();
        let got = store.get_session(&s.id).await.unwrap().unwrap();
        assert_eq!(got.native_handle.as_deref(), Some("cli-session-9"));
    }
}
