//! Application state shared across handlers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::{BuiltinAuth, TokenValidator};
use crate::config::Settings;
use crate::db::Database;
use crate::ratelimit::RateLimiter;
use crate::store::Store;
use crate::ws::Hub;

/// Billing/plan enforcement is an external collaborator; session creation
/// consults this predicate and maps a rejection to HTTP 402.
#[async_trait]
pub trait PlanGate: Send + Sync {
    /// `Err(reason)` blocks the operation.
    async fn check(&self, org_id: &str) -> Result<(), String>;
}

/// Default gate: everything is allowed.
pub struct AllowAll;

#[async_trait]
impl PlanGate for AllowAll {
    async fn check(&self, _org_id: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub store: Store,
    pub hub: Arc<Hub>,
    pub settings: Arc<Settings>,
    /// Validates user bearer tokens for the configured provider.
    pub validator: Arc<dyn TokenValidator>,
    /// Set when the builtin provider is active; serves password login.
    pub builtin: Option<Arc<BuiltinAuth>>,
    pub plan_gate: Arc<dyn PlanGate>,
    /// Login attempts per client IP.
    pub login_limiter: Arc<RateLimiter>,
    /// Authenticated requests per user.
    pub user_limiter: Arc<RateLimiter>,
    /// Device-code registration calls per client IP.
    pub device_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        db: Database,
        store: Store,
        hub: Arc<Hub>,
        settings: Arc<Settings>,
        validator: Arc<dyn TokenValidator>,
        builtin: Option<Arc<BuiltinAuth>>,
    ) -> Self {
        let user_rps = settings.ratelimit.user_rps;
        let user_burst = settings.ratelimit.user_burst;
        Self {
            db,
            store,
            hub,
            settings,
            validator,
            builtin,
            plan_gate: Arc::new(AllowAll),
            login_limiter: RateLimiter::new(5.0, 10.0),
            user_limiter: RateLimiter::new(user_rps, user_burst),
            device_limiter: RateLimiter::new(3.0, 5.0),
        }
    }

    pub fn with_plan_gate(mut self, gate: Arc<dyn PlanGate>) -> Self {
        self.plan_gate = gate;
        self
    }
}
