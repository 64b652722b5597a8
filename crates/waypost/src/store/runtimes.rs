//! Runtimes, agents, and admin config overrides.

use anyhow::{Context, Result};
use waypost_protocol::AgentDescriptor;

use super::models::{Agent, AgentConfigOverride, Runtime};
use super::Store;

impl Store {
    /// Insert or refresh a runtime row on hello.
    pub async fn upsert_runtime(&self, id: &str, org_id: &str, name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runtimes (id, org_id, name, online, last_seen)
            VALUES (?, ?, ?, 1, datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                org_id = excluded.org_id,
                name = excluded.name,
                online = 1,
                last_seen = datetime('now')
            "#,
        )
        .bind(id)
        .bind(org_id)
        .bind(name)
        .execute(self.pool())
        .await
        .context("upserting runtime")?;
        Ok(())
    }

    pub async fn set_runtime_online(&self, id: &str, online: bool) -> Result<()> {
        sqlx::query("UPDATE runtimes SET online = ?, last_seen = datetime('now') WHERE id = ?")
            .bind(online)
            .bind(id)
            .execute(self.pool())
            .await
            .context("updating runtime online state")?;
        Ok(())
    }

    pub async fn get_runtime(&self, id: &str) -> Result<Option<Runtime>> {
        let runtime = sqlx::query_as::<_, Runtime>(
            "SELECT id, org_id, name, online, last_seen FROM runtimes WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .context("fetching runtime")?;
        Ok(runtime)
    }

    pub async fn list_runtimes(&self, org_id: &str) -> Result<Vec<Runtime>> {
        let runtimes = sqlx::query_as::<_, Runtime>(
            "SELECT id, org_id, name, online, last_seen FROM runtimes WHERE org_id = ? ORDER BY id",
        )
        .bind(org_id)
        .fetch_all(self.pool())
        .await
        .context("listing runtimes")?;
        Ok(runtimes)
    }

    /// Replace the advertised agent set for a runtime: stale rows are wiped
    /// before re-insertion, in one transaction.
    pub async fn replace_agents(
        &self,
        runtime_id: &str,
        org_id: &str,
        agents: &[AgentDescriptor],
    ) -> Result<()> {
        let mut tx = self.pool().begin().await.context("starting transaction")?;

        sqlx::query("DELETE FROM agents WHERE runtime_id = ?")
            .bind(runtime_id)
            .execute(&mut *tx)
            .await
            .context("wiping stale agents")?;

        for agent in agents {
            let tags = agent
                .tags
                .as_ref()
                .map(|v| serde_json::to_string(v))
                .transpose()
                .context("encoding agent tags")?;
            let caps =
                serde_json::to_string(&agent.caps).context("encoding agent caps")?;
            let security = agent
                .security
                .as_ref()
                .map(|v| serde_json::to_string(v))
                .transpose()
                .context("encoding agent security")?;

            sqlx::query(
                r#"
                INSERT INTO agents (id, org_id, runtime_id, profile, name, tags, caps, security)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&agent.id)
            .bind(org_id)
            .bind(runtime_id)
            .bind(&agent.profile)
            .bind(&agent.name)
            .bind(&tags)
            .bind(&caps)
            .bind(&security)
            .execute(&mut *tx)
            .await
            .context("inserting agent")?;
        }

        tx.commit().await.context("committing agent replacement")?;
        Ok(())
    }

    pub async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let agent = sqlx::query_as::<_, Agent>(
            r#"
            SELECT id, org_id, runtime_id, profile, name, tags, caps, security
            FROM agents WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .context("fetching agent")?;
        Ok(agent)
    }

    pub async fn list_agents(&self, org_id: &str) -> Result<Vec<Agent>> {
        let agents = sqlx::query_as::<_, Agent>(
            r#"
            SELECT id, org_id, runtime_id, profile, name, tags, caps, security
            FROM agents WHERE org_id = ? ORDER BY id
            "#,
        )
        .bind(org_id)
        .fetch_all(self.pool())
        .await
        .context("listing agents")?;
        Ok(agents)
    }

    pub async fn list_agents_for_runtime(&self, runtime_id: &str) -> Result<Vec<Agent>> {
        let agents = sqlx::query_as::<_, Agent>(
            r#"
            SELECT id, org_id, runtime_id, profile, name, tags, caps, security
            FROM agents WHERE runtime_id = ? ORDER BY id
            "#,
        )
        .bind(runtime_id)
        .fetch_all(self.pool())
        .await
        .context("listing agents for runtime")?;
        Ok(agents)
    }

    pub async fn upsert_agent_override(
        &self,
        agent_id: &str,
        org_id: &str,
        security: Option<&str>,
        limits: Option<&str>,
        updated_by: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_config_overrides (agent_id, org_id, security, limits, updated_by, updated_at)
            VALUES (?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(agent_id) DO UPDATE SET
                security = excluded.security,
                limits = excluded.limits,
                updated_by = excluded.updated_by,
                updated_at = datetime('now')
            "#,
        )
        .bind(agent_id)
        .bind(org_id)
        .bind(security)
        .bind(limits)
        .bind(updated_by)
        .execute(self.pool())
        .await
        .context("upserting agent config override")?;
        Ok(())
    }

    pub async fn get_agent_override(&self, agent_id: &str) -> Result<Option<AgentConfigOverride>> {
        let over = sqlx::query_as::<_, AgentConfigOverride>(
            r#"
            SELECT agent_id, org_id, security, limits, updated_by, updated_at
            FROM agent_config_overrides WHERE agent_id = ?
            "#,
        )
        .bind(agent_id)
        .fetch_optional(self.pool())
        .await
        .context("fetching agent config override")?;
        Ok(over)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use waypost_protocol::{AgentCaps, ExecModel};

    fn descriptor(id: &str) -> AgentDescriptor {
        AgentDescriptor {
            id: id.to_string(),
            profile: "cli".into(),
            name: id.to_uppercase(),
            tags: None,
            caps: AgentCaps {
                native_session_ids: true,
                turn_completion: true,
                resume_attach: false,
                exec_model: ExecModel::Interactive,
            },
            security: None,
        }
    }

    #[tokio::test]
    async fn re_registration_wipes_stale_agents() {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(&db);

        store.upsert_runtime("r1", "default", "lab").await.unwrap();
        store
            .replace_agents("r1", "default", &[descriptor("a1"), descriptor("a2")])
            .await
            .unwrap();
        assert_eq!(store.list_agents_for_runtime("r1").await.unwrap().len(), 2);

        // New hello advertises a different set; the old one must be gone.
        store
            .replace_agents("r1", "default", &[descriptor("a3")])
            .await
            .unwrap();
        let agents = store.list_agents_for_runtime("r1").await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, "a3");
        assert!(store.get_agent("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn runtime_upsert_marks_online() {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(&db);

        store.upsert_runtime("r1", "default", "lab").await.unwrap();
        assert!(store.get_runtime("r1").await.unwrap().unwrap().online);

        store.set_runtime_online("r1", false).await.unwrap();
        let rt = store.get_runtime("r1").await.unwrap().unwrap();
        assert!(!rt.online);
        assert!(rt.last_seen.is_some());
    }

    #[tokio::test]
    async fn override_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(&db);

        store
            .upsert_agent_override("a1", "default", Some(r#"{"network":"off"}"#), None, "usr_x")
            .await
            .unwrap();
        store
            .upsert_agent_override("a1", "default", None, Some(r#"{"cpu":2}"#), "usr_y")
            .await
            .unwrap();

        let over = store.get_agent_override("a1").await.unwrap().unwrap();
        assert_eq!(over.updated_by, "usr_y");
        assert!(over.security.is_none());
        assert_eq!(over.limits.as_deref(), Some(r#"{"cpu":2}"#));
    }
}
