//! Durable state. The [`Store`] is the only component that mutates the
//! database; everything else goes through it. Methods return `Ok(None)` for
//! not-found and `Err` only for backend failure, so callers can map the two
//! to 404/skip versus 5xx.

mod access;
mod audit;
mod messages;
mod models;
mod registration;
mod runtimes;
mod sessions;
mod users;

pub use audit::AuditRecord;
pub use messages::MAX_PAGE;
pub use models::*;
pub use registration::DEVICE_CODE_TTL_SECS;
pub use sessions::NewSession;
pub use users::NewUser;

use sqlx::SqlitePool;

use crate::db::Database;

/// Repository facade over the database pool. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Direct pool access for callers that need raw queries (tests mostly).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
