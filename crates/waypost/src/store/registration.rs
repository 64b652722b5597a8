//! Device-code pairing rows and hashed runtime credentials.

use anyhow::{Context, Result};

use super::models::{DeviceCode, DeviceCodeStatus, RuntimeToken};
use super::Store;

/// Device codes live this long before polling reports `expired`.
pub const DEVICE_CODE_TTL_SECS: i64 = 300;

/// Alphabet for the human-readable pairing code: no vowels or lookalike
/// glyphs, so codes are unambiguous over voice or chat.
const USER_CODE_ALPHABET: [char; 20] = [
    'B', 'C', 'D', 'F', 'G', 'H', 'J', 'K', 'L', 'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'V', 'W',
    'X', 'Z',
];

impl Store {
    fn generate_user_code() -> String {
        let half = || nanoid::nanoid!(4, &USER_CODE_ALPHABET);
        format!("{}-{}", half(), half())
    }

    /// Open a pairing window: a pending device code valid for five minutes.
    pub async fn create_device_code(&self, org_id: &str) -> Result<DeviceCode> {
        let id = format!("dc_{}", nanoid::nanoid!(12));
        let user_code = Self::generate_user_code();
        let polling_token = format!("poll_{}", nanoid::nanoid!(32));

        sqlx::query(
            r#"
            INSERT INTO device_codes (id, user_code, polling_token, org_id, status, expires_at)
            VALUES (?, ?, ?, ?, 'pending', datetime('now', ?))
            "#,
        )
        .bind(&id)
        .bind(&user_code)
        .bind(&polling_token)
        .bind(org_id)
        .bind(format!("+{} seconds", DEVICE_CODE_TTL_SECS))
        .execute(self.pool())
        .await
        .context("inserting device code")?;

        self.get_device_code(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("device code not found after insert"))
    }

    pub async fn get_device_code(&self, id: &str) -> Result<Option<DeviceCode>> {
        let code = sqlx::query_as::<_, DeviceCode>(
            r#"
            SELECT id, user_code, polling_token, org_id, status, runtime_id, token,
                   approved_by, created_at, expires_at
            FROM device_codes WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .context("fetching device code")?;
        Ok(code)
    }

    pub async fn get_device_code_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<Option<DeviceCode>> {
        let code = sqlx::query_as::<_, DeviceCode>(
            r#"
            SELECT id, user_code, polling_token, org_id, status, runtime_id, token,
                   approved_by, created_at, expires_at
            FROM device_codes WHERE user_code = ?
            "#,
        )
        .bind(user_code)
        .fetch_optional(self.pool())
        .await
        .context("fetching device code by user code")?;
        Ok(code)
    }

    pub async fn get_device_code_by_polling_token(
        &self,
        polling_token: &str,
    ) -> Result<Option<DeviceCode>> {
        let code = sqlx::query_as::<_, DeviceCode>(
            r#"
            SELECT id, user_code, polling_token, org_id, status, runtime_id, token,
                   approved_by, created_at, expires_at
            FROM device_codes WHERE polling_token = ?
            "#,
        )
        .bind(polling_token)
        .fetch_optional(self.pool())
        .await
        .context("fetching device code by polling token")?;
        Ok(code)
    }

    /// Transition a pending code to `approved`, attaching the minted runtime
    /// id and token plaintext. Returns false if the code was not pending
    /// (already approved, or expired by [`mark_device_code_expired`]).
    pub async fn approve_device_code(
        &self,
        id: &str,
        runtime_id: &str,
        token_plaintext: &str,
        approved_by: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE device_codes
            SET status = 'approved', runtime_id = ?, token = ?, approved_by = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(runtime_id)
        .bind(token_plaintext)
        .bind(approved_by)
        .bind(id)
        .execute(self.pool())
        .await
        .context("approving device code")?;
        Ok(result.rows_affected() == 1)
    }

    /// Take the stored plaintext, clearing it so the token is disclosed
    /// exactly once. `None` means someone already took it. The conditional
    /// update is the arbiter: of two concurrent callers, exactly one sees
    /// `rows_affected == 1`.
    pub async fn take_device_code_token(&self, id: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT token FROM device_codes WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await
                .context("reading device code token")?;
        let Some((Some(token),)) = row else {
            return Ok(None);
        };

        let result = sqlx::query(
            "UPDATE device_codes SET token = NULL WHERE id = ? AND token IS NOT NULL",
        )
        .bind(id)
        .execute(self.pool())
        .await
        .context("clearing device code token")?;

        if result.rows_affected() == 1 {
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    pub async fn mark_device_code_expired(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE device_codes SET status = 'expired', token = NULL WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .context("expiring device code")?;
        Ok(())
    }

    /// Drop codes whose expiry passed more than an hour ago. Called
    /// opportunistically after each creation.
    pub async fn purge_stale_device_codes(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM device_codes WHERE expires_at < datetime('now', '-1 hour')",
        )
        .execute(self.pool())
        .await
        .context("purging stale device codes")?;
        Ok(result.rows_affected())
    }

    pub async fn create_runtime_token(
        &self,
        org_id: &str,
        runtime_id: &str,
        token_hash: &str,
        name: &str,
        created_by: &str,
    ) -> Result<RuntimeToken> {
        let id = format!("rtok_{}", nanoid::nanoid!(12));
        sqlx::query(
            r#"
            INSERT INTO runtime_tokens (id, org_id, runtime_id, token_hash, name, created_by)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(org_id)
        .bind(runtime_id)
        .bind(token_hash)
        .bind(name)
        .bind(created_by)
        .execute(self.pool())
        .await
        .context("inserting runtime token")?;

        let token = sqlx::query_as::<_, RuntimeToken>(
            r#"
            SELECT id, org_id, runtime_id, token_hash, name, created_by, created_at, last_used_at
            FROM runtime_tokens WHERE id = ?
            "#,
        )
        .bind(&id)
        .fetch_one(self.pool())
        .await
        .context("fetching runtime token after insert")?;
        Ok(token)
    }

    pub async fn get_runtime_token_by_hash(&self, hash: &str) -> Result<Option<RuntimeToken>> {
        let token = sqlx::query_as::<_, RuntimeToken>(
            r#"
            SELECT id, org_id, runtime_id, token_hash, name, created_by, created_at, last_used_at
            FROM runtime_tokens WHERE token_hash = ?
            "#,
        )
        .bind(hash)
        .fetch_optional(self.pool())
        .await
        .context("fetching runtime token by hash")?;
        Ok(token)
    }

    pub async fn touch_runtime_token(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE runtime_tokens SET last_used_at = datetime('now') WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .context("touching runtime token")?;
        Ok(())
    }

    /// Whether a device code's expiry is in the past.
    pub fn device_code_expired(code: &DeviceCode) -> bool {
        // Stored as SQLite `datetime('now')` text, UTC, lexicographically
        // ordered, so a string compare against the same format is exact.
        let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        code.expires_at < now && code.status == DeviceCodeStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn pairing_flow_state_machine() {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(&db);

        let code = store.create_device_code("default").await.unwrap();
        assert_eq!(code.status, DeviceCodeStatus::Pending);
        assert_eq!(code.user_code.len(), 9);
        assert!(code.token.is_none());

        let approved = store
            .approve_device_code(&code.id, "runtime-3f2a", "plaintext-token", "usr_admin")
            .await
            .unwrap();
        assert!(approved);

        // A second approval attempt loses: the row is no longer pending.
        assert!(!store
            .approve_device_code(&code.id, "runtime-ffff", "other", "usr_admin")
            .await
            .unwrap());

        let got = store
            .get_device_code_by_polling_token(&code.polling_token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.status, DeviceCodeStatus::Approved);
        assert_eq!(got.runtime_id.as_deref(), Some("runtime-3f2a"));
    }

    #[tokio::test]
    async fn plaintext_is_taken_exactly_once() {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(&db);

        let code = store.create_device_code("default").await.unwrap();
        store
            .approve_device_code(&code.id, "runtime-3f2a", "secret-plaintext", "usr_admin")
            .await
            .unwrap();

        let first = store.take_device_code_token(&code.id).await.unwrap();
        assert_eq!(first.as_deref(), Some("secret-plaintext"));

        let second = store.take_device_code_token(&code.id).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn runtime_token_hash_lookup() {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(&db);

        store
            .create_runtime_token("default", "runtime-3f2a", "abc123hash", "lab1", "usr_admin")
            .await
            .unwrap();

        let token = store
            .get_runtime_token_by_hash("abc123hash")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(token.runtime_id, "runtime-3f2a");
        assert!(token.last_used_at.is_none());

        store.touch_runtime_token(&token.id).await.unwrap();
        let touched = store
            .get_runtime_token_by_hash("abc123hash")
            .await
            .unwrap()
            .unwrap();
        assert!(touched.last_used_at.is_some());

        assert!(store
            .get_runtime_token_by_hash("missing")
            .await
            .unwrap()
            .is_none());
    }
}
