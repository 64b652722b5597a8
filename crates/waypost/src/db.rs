//! SQLite database handle: pool setup, schema, legacy migrations.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Current schema. Idempotent: safe to run on a fresh or current database.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS orgs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    plan TEXT NOT NULL DEFAULT 'free',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

INSERT OR IGNORE INTO orgs (id, name) VALUES ('default', 'Default');

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL DEFAULT 'default',
    external_id TEXT,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT,
    role TEXT NOT NULL DEFAULT 'user' CHECK(role IN ('admin', 'user')),
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_users_external ON users(external_id);

CREATE TABLE IF NOT EXISTS runtimes (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL DEFAULT 'default',
    name TEXT NOT NULL DEFAULT '',
    online INTEGER NOT NULL DEFAULT 0,
    last_seen TEXT
);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL DEFAULT 'default',
    runtime_id TEXT NOT NULL,
    profile TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL DEFAULT '',
    tags TEXT,
    caps TEXT,
    security TEXT
);

CREATE INDEX IF NOT EXISTS idx_agents_runtime ON agents(runtime_id);

CREATE TABLE IF NOT EXISTS agent_config_overrides (
    agent_id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL DEFAULT 'default',
    security TEXT,
    limits TEXT,
    updated_by TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL DEFAULT 'default',
    user_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    runtime_id TEXT NOT NULL,
    profile TEXT NOT NULL DEFAULT '',
    state TEXT NOT NULL DEFAULT 'creating'
        CHECK(state IN ('creating', 'active', 'responding', 'idle', 'closed')),
    native_handle TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
CREATE INDEX IF NOT EXISTS idx_sessions_state ON sessions(state);

CREATE TABLE IF NOT EXISTS messages (
    session_id TEXT NOT NULL,
    id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    direction TEXT NOT NULL CHECK(direction IN ('user', 'agent')),
    channel TEXT NOT NULL DEFAULT 'stdout',
    content TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (session_id, id),
    UNIQUE (session_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at);

CREATE TABLE IF NOT EXISTS permissions (
    user_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (user_id, agent_id)
);

CREATE TABLE IF NOT EXISTS audit_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id TEXT NOT NULL DEFAULT 'default',
    action TEXT NOT NULL,
    user_id TEXT,
    runtime_id TEXT,
    session_id TEXT,
    agent_id TEXT,
    detail TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_events(created_at);

CREATE TABLE IF NOT EXISTS device_codes (
    id TEXT PRIMARY KEY,
    user_code TEXT NOT NULL UNIQUE,
    polling_token TEXT NOT NULL UNIQUE,
    org_id TEXT NOT NULL DEFAULT 'default',
    status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending', 'approved', 'expired')),
    runtime_id TEXT,
    token TEXT,
    approved_by TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runtime_tokens (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL DEFAULT 'default',
    runtime_id TEXT NOT NULL,
    token_hash TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL DEFAULT '',
    created_by TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    last_used_at TEXT
);

CREATE TABLE IF NOT EXISTS subscriptions (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL UNIQUE,
    plan TEXT NOT NULL DEFAULT 'trial',
    status TEXT NOT NULL DEFAULT 'active',
    current_period_end TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Legacy table renames applied before the schema pass. Early deployments
/// used the `endpoint` vocabulary for what are now agents.
const LEGACY_TABLE_RENAMES: &[(&str, &str)] = &[
    ("endpoints", "agents"),
    ("endpoint_config_overrides", "agent_config_overrides"),
];

/// Legacy column renames: (table, old column, new column).
const LEGACY_COLUMN_RENAMES: &[(&str, &str, &str)] = &[
    ("sessions", "endpoint_id", "agent_id"),
    ("permissions", "endpoint_id", "agent_id"),
    ("agent_config_overrides", "endpoint_id", "agent_id"),
];

/// Database connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database at `path` and bring the
    /// schema up to date.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("creating database directory: {}", parent.display())
                })?;
            }
        }

        let database_url = format!("sqlite://{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .context("parsing database URL")?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("connecting to database")?;

        let db = Self { pool };
        db.migrate().await?;

        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory database URL")?;

        // A single connection keeps every query on the same in-memory db.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("connecting to in-memory database")?;

        let db = Self { pool };
        db.migrate().await?;

        Ok(db)
    }

    /// Run legacy renames, then the idempotent schema.
    async fn migrate(&self) -> Result<()> {
        self.migrate_legacy().await?;
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("initializing database schema")?;
        Ok(())
    }

    /// In-place renames of the legacy `endpoint` vocabulary. Each step checks
    /// current state first, so a fresh, current, or partially-upgraded
    /// database all pass through unchanged.
    async fn migrate_legacy(&self) -> Result<()> {
        for (old, new) in LEGACY_TABLE_RENAMES {
            if self.table_exists(old).await? && !self.table_exists(new).await? {
                let sql = format!("ALTER TABLE {old} RENAME TO {new}");
                sqlx::query(&sql)
                    .execute(&self.pool)
                    .await
                    .with_context(|| format!("renaming legacy table {old}"))?;
                tracing::info!(table = *old, renamed_to = *new, "migrated legacy table");
            }
        }
        for (table, old, new) in LEGACY_COLUMN_RENAMES {
            if self.table_exists(table).await?
                && self.column_exists(table, old).await?
                && !self.column_exists(table, new).await?
            {
                let sql = format!("ALTER TABLE {table} RENAME COLUMN {old} TO {new}");
                sqlx::query(&sql)
                    .execute(&self.pool)
                    .await
                    .with_context(|| format!("renaming legacy column {table}.{old}"))?;
                tracing::info!(table = *table, column = *old, renamed_to = *new, "migrated legacy column");
            }
        }
        Ok(())
    }

    async fn table_exists(&self, name: &str) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("checking table existence")?;
        Ok(row.is_some())
    }

    async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT name FROM pragma_table_info(?) WHERE name = ?")
                .bind(table)
                .bind(column)
                .fetch_optional(&self.pool)
                .await
                .context("checking column existence")?;
        Ok(row.is_some())
    }

    /// Liveness probe for readyz.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("pinging database")?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_schema_and_default_org() {
        let temp = tempfile::TempDir::new().unwrap();
        let db = Database::open(&temp.path().join("t.db")).await.unwrap();
        db.ping().await.unwrap();

        let row: (String,) = sqlx::query_as("SELECT name FROM orgs WHERE id = 'default'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(row.0, "Default");
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        // Second run must be a no-op, not an error.
        db.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn legacy_endpoint_tables_are_renamed() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("legacy.db");

        // Seed a legacy-shape database by hand.
        {
            let options = SqliteConnectOptions::from_str(&format!(
                "sqlite://{}?mode=rwc",
                path.display()
            ))
            .unwrap()
            .create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
                .unwrap();
            sqlx::raw_sql(
                r#"
                CREATE TABLE endpoints (id TEXT PRIMARY KEY, runtime_id TEXT NOT NULL);
                CREATE TABLE sessions (
                    id TEXT PRIMARY KEY,
                    org_id TEXT NOT NULL DEFAULT 'default',
                    user_id TEXT NOT NULL DEFAULT '',
                    endpoint_id TEXT NOT NULL,
                    runtime_id TEXT NOT NULL DEFAULT '',
                    profile TEXT NOT NULL DEFAULT '',
                    state TEXT NOT NULL DEFAULT 'closed',
                    native_handle TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );
                INSERT INTO endpoints (id, runtime_id) VALUES ('a1', 'r1');
                INSERT INTO sessions (id, endpoint_id) VALUES ('s1', 'a1');
                "#,
            )
            .execute(&pool)
            .await
            .unwrap();
            pool.close().await;
        }

        let db = Database::open(&path).await.unwrap();
        assert!(db.table_exists("agents").await.unwrap());
        assert!(!db.table_exists("endpoints").await.unwrap());
        assert!(db.column_exists("sessions", "agent_id").await.unwrap());

        let row: (String,) = sqlx::query_as("SELECT agent_id FROM sessions WHERE id = 's1'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(row.0, "a1");

        // Opening again must not re-run the renames.
        drop(db);
        Database::open(&path).await.unwrap();
    }
}
