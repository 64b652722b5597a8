//! Organizations and users.

use anyhow::{Context, Result};

use super::models::{Org, Role, Subscription, User};
use super::Store;

/// Parameters for inserting a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub org_id: String,
    pub external_id: Option<String>,
    pub username: String,
    pub password_hash: Option<String>,
    pub role: Role,
}

impl Store {
    fn generate_user_id() -> String {
        format!("usr_{}", nanoid::nanoid!(12))
    }

    /// Make sure an organization row exists. Used when a runtime hello names
    /// an org the control plane has not seen yet.
    pub async fn ensure_org(&self, id: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO orgs (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(id)
            .execute(self.pool())
            .await
            .context("ensuring organization")?;
        Ok(())
    }

    pub async fn get_org(&self, id: &str) -> Result<Option<Org>> {
        let org = sqlx::query_as::<_, Org>(
            "SELECT id, name, plan, created_at FROM orgs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .context("fetching organization")?;
        Ok(org)
    }

    pub async fn create_user(&self, new: NewUser) -> Result<User> {
        let id = Self::generate_user_id();
        sqlx::query(
            r#"
            INSERT INTO users (id, org_id, external_id, username, password_hash, role)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.org_id)
        .bind(&new.external_id)
        .bind(&new.username)
        .bind(&new.password_hash)
        .bind(new.role.to_string())
        .execute(self.pool())
        .await
        .context("inserting user")?;

        self.get_user(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user not found after insert"))
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, org_id, external_id, username, password_hash, role, created_at
            FROM users WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .context("fetching user")?;
        Ok(user)
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, org_id, external_id, username, password_hash, role, created_at
            FROM users WHERE username = ?
            "#,
        )
        .bind(username)
        .fetch_optional(self.pool())
        .await
        .context("fetching user by username")?;
        Ok(user)
    }

    pub async fn get_user_by_external_id(&self, external_id: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, org_id, external_id, username, password_hash, role, created_at
            FROM users WHERE external_id = ?
            "#,
        )
        .bind(external_id)
        .fetch_optional(self.pool())
        .await
        .context("fetching user by external id")?;
        Ok(user)
    }

    pub async fn list_users(&self, org_id: &str) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            r#"
            SELECT id, org_id, external_id, username, password_hash, role, created_at
            FROM users WHERE org_id = ? ORDER BY created_at
            "#,
        )
        .bind(org_id)
        .fetch_all(self.pool())
        .await
        .context("listing users")?;
        Ok(users)
    }

    pub async fn get_subscription(&self, org_id: &str) -> Result<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT id, org_id, plan, status, current_period_end, created_at
            FROM subscriptions WHERE org_id = ?
            "#,
        )
        .bind(org_id)
        .fetch_optional(self.pool())
        .await
        .context("fetching subscription")?;
        Ok(sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn create_and_look_up_user() {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(&db);

        let user = store
            .create_user(NewUser {
                org_id: "default".into(),
                external_id: None,
                username: "ada".into(),
                password_hash: Some("x".into()),
                role: Role::Admin,
            })
            .await
            .unwrap();
        assert!(user.id.starts_with("usr_"));
        assert_eq!(user.role, Role::Admin);

        let by_name = store.get_user_by_username("ada").await.unwrap().unwrap();
        assert_eq!(by_name.id, user.id);

        assert!(store.get_user("usr_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ensure_org_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(&db);

        store.ensure_org("acme").await.unwrap();
        store.ensure_org("acme").await.unwrap();
        assert!(store.get_org("acme").await.unwrap().is_some());
        assert!(store.get_org("default").await.unwrap().is_some());
    }
}
