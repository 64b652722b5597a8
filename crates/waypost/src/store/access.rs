//! Per-user agent access grants.

use anyhow::{Context, Result};

use super::models::PermissionGrant;
use super::Store;

impl Store {
    pub async fn grant_permission(&self, user_id: &str, agent_id: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO permissions (user_id, agent_id) VALUES (?, ?)")
            .bind(user_id)
            .bind(agent_id)
            .execute(self.pool())
            .await
            .context("granting permission")?;
        Ok(())
    }

    pub async fn revoke_permission(&self, user_id: &str, agent_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM permissions WHERE user_id = ? AND agent_id = ?")
            .bind(user_id)
            .bind(agent_id)
            .execute(self.pool())
            .await
            .context("revoking permission")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn has_permission(&self, user_id: &str, agent_id: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM permissions WHERE user_id = ? AND agent_id = ?")
                .bind(user_id)
                .bind(agent_id)
                .fetch_optional(self.pool())
                .await
                .context("checking permission")?;
        Ok(row.is_some())
    }

    pub async fn list_permissions_for_user(&self, user_id: &str) -> Result<Vec<PermissionGrant>> {
        let grants = sqlx::query_as::<_, PermissionGrant>(
            r#"
            SELECT user_id, agent_id, created_at
            FROM permissions WHERE user_id = ? ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await
        .context("listing permissions")?;
        Ok(grants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn grant_check_revoke() {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(&db);

        assert!(!store.has_permission("u1", "a1").await.unwrap());

        store.grant_permission("u1", "a1").await.unwrap();
        // Double grant is a no-op, not an error.
        store.grant_permission("u1", "a1").await.unwrap();
        assert!(store.has_permission("u1", "a1").await.unwrap());
        assert_eq!(store.list_permissions_for_user("u1").await.unwrap().len(), 1);

        assert!(store.revoke_permission("u1", "a1").await.unwrap());
        assert!(!store.revoke_permission("u1", "a1").await.unwrap());
        assert!(!store.has_permission("u1", "a1").await.unwrap());
    }
}
