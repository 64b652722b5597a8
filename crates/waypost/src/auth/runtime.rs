//! Runtime credential validation and minting.
//!
//! A presented `(runtime_id, token)` is tried against three paths in order:
//! time-limited HMAC tokens, the static config table, then the hashed
//! database table. The first match wins.

use std::collections::HashMap;

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::store::Store;

type HmacSha256 = Hmac<Sha256>;

/// Hex length of an HMAC-SHA256 tag.
const MAC_HEX_LEN: usize = 64;

/// Outcome of a successful validation.
#[derive(Debug, Clone)]
pub struct ValidatedRuntime {
    pub runtime_id: String,
    /// Set only by the database path, where the token row pins the org and
    /// overrides whatever the hello claimed.
    pub org_id: Option<String>,
}

/// SHA-256 hex of a token plaintext, the only form ever persisted.
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Mint a fresh random runtime credential: 64 hex chars.
pub fn generate_runtime_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Mint a runtime id in the `runtime-<hex4>` form used for approved
/// registrations.
pub fn generate_runtime_id() -> String {
    let mut bytes = [0u8; 2];
    rand::rng().fill_bytes(&mut bytes);
    format!("runtime-{}", hex::encode(bytes))
}

pub struct RuntimeAuthenticator {
    store: Store,
    static_tokens: HashMap<String, String>,
    secret: Option<Vec<u8>>,
    lifetime_secs: u64,
}

impl RuntimeAuthenticator {
    pub fn new(
        store: Store,
        static_tokens: HashMap<String, String>,
        secret: Option<String>,
        lifetime_secs: u64,
    ) -> Self {
        Self {
            store,
            static_tokens,
            secret: secret.map(|s| s.into_bytes()),
            lifetime_secs,
        }
    }

    /// Whether time-limited tokens (and therefore rotation) are enabled.
    pub fn rotation_enabled(&self) -> bool {
        self.secret.is_some()
    }

    pub fn token_lifetime_secs(&self) -> u64 {
        self.lifetime_secs
    }

    /// Validate a presented credential. `None` means every path rejected it.
    pub async fn validate(&self, runtime_id: &str, token: &str) -> Option<ValidatedRuntime> {
        if let Some(validated) = self.validate_timed(runtime_id, token) {
            return Some(validated);
        }

        if let Some(expected) = self.static_tokens.get(runtime_id) {
            if expected == token {
                return Some(ValidatedRuntime {
                    runtime_id: runtime_id.to_string(),
                    org_id: None,
                });
            }
        }

        self.validate_hashed(runtime_id, token).await
    }

    /// Mint a time-limited token for `runtime_id`. Returns the token and its
    /// expiry as Unix milliseconds. Panics never; `None` when rotation is
    /// not configured.
    pub fn mint_timed_token(&self, runtime_id: &str) -> Option<(String, i64)> {
        let secret = self.secret.as_deref()?;
        let exp = Utc::now().timestamp() + self.lifetime_secs as i64;

        let mut nonce = [0u8; 8];
        rand::rng().fill_bytes(&mut nonce);

        let payload = format!("{}|{}|{}", runtime_id, hex::encode(nonce), exp);
        let payload_hex = hex::encode(payload.as_bytes());

        let mut mac = HmacSha256::new_from_slice(secret).ok()?;
        mac.update(payload_hex.as_bytes());
        let tag = hex::encode(mac.finalize().into_bytes());

        Some((format!("{payload_hex}{tag}"), exp * 1000))
    }

    /// Path 1: recompute the HMAC, check expiry, check the claimed id.
    fn validate_timed(&self, claimed_id: &str, token: &str) -> Option<ValidatedRuntime> {
        let secret = self.secret.as_deref()?;
        if token.len() <= MAC_HEX_LEN {
            return None;
        }
        let (payload_hex, tag_hex) = token.split_at(token.len() - MAC_HEX_LEN);
        let tag = hex::decode(tag_hex).ok()?;

        let mut mac = HmacSha256::new_from_slice(secret).ok()?;
        mac.update(payload_hex.as_bytes());
        mac.verify_slice(&tag).ok()?;

        let payload = String::from_utf8(hex::decode(payload_hex).ok()?).ok()?;
        let mut parts = payload.split('|');
        let runtime_id = parts.next()?;
        let _nonce = parts.next()?;
        let exp: i64 = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }

        if exp <= Utc::now().timestamp() {
            return None;
        }
        if runtime_id != claimed_id {
            return None;
        }

        Some(ValidatedRuntime {
            runtime_id: runtime_id.to_string(),
            org_id: None,
        })
    }

    /// Path 3: hashed lookup. A hit authenticates the claimed id and pins
    /// the org; `last_used_at` is updated off the hot path.
    async fn validate_hashed(&self, claimed_id: &str, token: &str) -> Option<ValidatedRuntime> {
        let hash = token_hash(token);
        let row = match self.store.get_runtime_token_by_hash(&hash).await {
            Ok(row) => row?,
            Err(e) => {
                warn!(error = %e, "runtime token lookup failed");
                return None;
            }
        };

        if row.runtime_id != claimed_id {
            return None;
        }

        let store = self.store.clone();
        let token_id = row.id.clone();
        tokio::spawn(async move {
            if let Err(e) = store.touch_runtime_token(&token_id).await {
                warn!(error = %e, "updating runtime token last_used_at failed");
            }
        });

        Some(ValidatedRuntime {
            runtime_id: row.runtime_id,
            org_id: Some(row.org_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn authenticator(secret: Option<&str>) -> RuntimeAuthenticator {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(&db);
        let mut static_tokens = HashMap::new();
        static_tokens.insert("r-static".to_string(), "static-secret".to_string());
        RuntimeAuthenticator::new(store, static_tokens, secret.map(String::from), 3600)
    }

    #[tokio::test]
    async fn timed_token_round_trips() {
        let auth = authenticator(Some("rotor-secret")).await;

        let (token, expires_at) = auth.mint_timed_token("r1").unwrap();
        assert!(expires_at > Utc::now().timestamp_millis());

        let validated = auth.validate("r1", &token).await.unwrap();
        assert_eq!(validated.runtime_id, "r1");
        assert!(validated.org_id.is_none());

        // The embedded id must match the claimed one.
        assert!(auth.validate("r2", &token).await.is_none());
    }

    #[tokio::test]
    async fn tampered_timed_token_is_rejected() {
        let auth = authenticator(Some("rotor-secret")).await;
        let (token, _) = auth.mint_timed_token("r1").unwrap();

        let mut tampered = token.clone();
        // Flip one nibble of the payload.
        let replacement = if tampered.as_bytes()[0] == b'a' { "b" } else { "a" };
        tampered.replace_range(0..1, replacement);
        assert!(auth.validate("r1", &tampered).await.is_none());
    }

    #[tokio::test]
    async fn static_table_path() {
        let auth = authenticator(None).await;
        assert!(auth.validate("r-static", "static-secret").await.is_some());
        assert!(auth.validate("r-static", "wrong").await.is_none());
        assert!(auth.validate("r-other", "static-secret").await.is_none());
    }

    #[tokio::test]
    async fn hashed_db_path_pins_org() {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(&db);
        let auth =
            RuntimeAuthenticator::new(store.clone(), HashMap::new(), None, 3600);

        let plaintext = generate_runtime_token();
        store
            .create_runtime_token("acme", "runtime-3f2a", &token_hash(&plaintext), "lab", "usr_a")
            .await
            .unwrap();

        let validated = auth.validate("runtime-3f2a", &plaintext).await.unwrap();
        assert_eq!(validated.org_id.as_deref(), Some("acme"));

        // Same token under a different claimed id fails.
        assert!(auth.validate("runtime-0000", &plaintext).await.is_none());
    }

    #[test]
    fn generated_ids_have_expected_shape() {
        let token = generate_runtime_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

        let id = generate_runtime_id();
        assert!(id.starts_with("runtime-"));
        assert_eq!(id.len(), "runtime-".len() + 4);
    }
}
