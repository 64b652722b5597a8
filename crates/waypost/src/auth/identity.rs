//! The authenticated caller, however their token was validated.

use async_trait::async_trait;

use crate::store::Role;

use super::AuthError;

/// Who is calling. `user_id` is the external subject when identity is
/// proxied from an external provider, otherwise our own user id.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub org_id: String,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Validates user bearer tokens. One implementation per configured provider.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError>;

    /// Provider name surfaced at `GET /api/auth/config`.
    fn provider_name(&self) -> &'static str;

    /// External providers get auto-provisioning of first-seen users.
    fn is_external(&self) -> bool {
        false
    }
}
