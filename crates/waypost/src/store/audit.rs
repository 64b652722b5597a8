//! Audit trail. `detail` is an action-specific JSON blob stored as TEXT.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::models::AuditEvent;
use super::Store;

/// Builder-style record for one audit event.
#[derive(Debug, Clone, Default)]
pub struct AuditRecord {
    pub org_id: String,
    pub action: String,
    pub user_id: Option<String>,
    pub runtime_id: Option<String>,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub detail: Option<Value>,
}

impl AuditRecord {
    pub fn new(org_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn runtime(mut self, runtime_id: impl Into<String>) -> Self {
        self.runtime_id = Some(runtime_id.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl Store {
    pub async fn record_audit(&self, record: AuditRecord) -> Result<()> {
        let detail = record
            .detail
            .as_ref()
            .map(|v| serde_json::to_string(v))
            .transpose()
            .context("encoding audit detail")?;

        sqlx::query(
            r#"
            INSERT INTO audit_events (org_id, action, user_id, runtime_id, session_id, agent_id, detail)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.org_id)
        .bind(&record.action)
        .bind(&record.user_id)
        .bind(&record.runtime_id)
        .bind(&record.session_id)
        .bind(&record.agent_id)
        .bind(&detail)
        .execute(self.pool())
        .await
        .context("inserting audit event")?;
        Ok(())
    }

    pub async fn list_audit_events(&self, org_id: &str, limit: i64) -> Result<Vec<AuditEvent>> {
        let limit = limit.clamp(1, 1000);
        let events = sqlx::query_as::<_, AuditEvent>(
            r#"
            SELECT id, org_id, action, user_id, runtime_id, session_id, agent_id, detail, created_at
            FROM audit_events WHERE org_id = ?
            ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(org_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .context("listing audit events")?;
        Ok(events)
    }

    pub async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_events WHERE created_at < ?")
            .bind(cutoff.format("%Y-%m-%d %H:%M:%S").to_string())
            .execute(self.pool())
            .await
            .context("purging old audit events")?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    #[tokio::test]
    async fn record_and_list_newest_first() {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(&db);

        store
            .record_audit(AuditRecord::new("default", "session.create").user("u1"))
            .await
            .unwrap();
        store
            .record_audit(
                AuditRecord::new("default", "turn.completed")
                    .session("s1")
                    .detail(json!({"duration_ms": 1200, "exit_code": 0})),
            )
            .await
            .unwrap();

        let events = store.list_audit_events("default", 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "turn.completed");
        let detail: Value = serde_json::from_str(events[0].detail.as_deref().unwrap()).unwrap();
        assert_eq!(detail["duration_ms"], 1200);
    }
}
