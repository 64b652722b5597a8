//! Builtin identity: passwords in our own user table, HS256 tokens we mint.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::store::{Role, Store};

use super::identity::{Identity, TokenValidator};
use super::AuthError;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    username: String,
    role: String,
    org: String,
    exp: i64,
}

pub struct BuiltinAuth {
    store: Store,
    encoding: EncodingKey,
    decoding: DecodingKey,
    expiry_secs: u64,
}

impl BuiltinAuth {
    pub fn new(store: Store, secret: &str, expiry_secs: u64) -> Self {
        Self {
            store,
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            expiry_secs,
        }
    }

    /// Verify a password and mint a bearer token.
    pub async fn login(&self, username: &str, password: &str) -> Result<(String, Identity), AuthError> {
        let user = self
            .store
            .get_user_by_username(username)
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .ok_or(AuthError::InvalidCredentials)?;

        let hash = user
            .password_hash
            .as_deref()
            .ok_or(AuthError::InvalidCredentials)?;
        let ok = bcrypt::verify(password, hash)
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        if !ok {
            return Err(AuthError::InvalidCredentials);
        }

        let identity = Identity {
            user_id: user.id.clone(),
            username: user.username.clone(),
            role: user.role,
            org_id: user.org_id.clone(),
        };

        let claims = Claims {
            sub: user.id,
            username: user.username,
            role: user.role.to_string(),
            org: user.org_id,
            exp: Utc::now().timestamp() + self.expiry_secs as i64,
        };
        let token = encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AuthError::Internal(e.to_string()))?;

        Ok((token, identity))
    }

    pub fn hash_password(password: &str) -> Result<String, AuthError> {
        bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(|e| AuthError::Internal(e.to_string()))
    }
}

#[async_trait]
impl TokenValidator for BuiltinAuth {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            })?;

        let role: Role = data.claims.role.parse().unwrap_or(Role::User);
        Ok(Identity {
            user_id: data.claims.sub,
            username: data.claims.username,
            role,
            org_id: data.claims.org,
        })
    }

    fn provider_name(&self) -> &'static str {
        "builtin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::store::NewUser;

    async fn auth_with_user() -> BuiltinAuth {
        let db = Database::in_memory().await.unwrap();
        let store = Store::new(&db);
        store
            .create_user(NewUser {
                org_id: "default".into(),
                external_id: None,
                username: "ada".into(),
                password_hash: Some(BuiltinAuth::hash_password("hunter2").unwrap()),
                role: Role::Admin,
            })
            .await
            .unwrap();
        BuiltinAuth::new(store, "test-secret", 3600)
    }

    #[tokio::test]
    async fn login_then_validate_round_trips_identity() {
        let auth = auth_with_user().await;

        let (token, identity) = auth.login("ada", "hunter2").await.unwrap();
        assert_eq!(identity.username, "ada");
        assert!(identity.is_admin());

        let validated = auth.validate(&token).await.unwrap();
        assert_eq!(validated.user_id, identity.user_id);
        assert_eq!(validated.org_id, "default");
        assert!(validated.is_admin());
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let auth = auth_with_user().await;
        assert!(matches!(
            auth.login("ada", "wrong").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            auth.login("nobody", "hunter2").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn garbage_token_is_invalid() {
        let auth = auth_with_user().await;
        assert!(matches!(
            auth.validate("not-a-jwt").await,
            Err(AuthError::InvalidToken(_))
        ));
    }
}
