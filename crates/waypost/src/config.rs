//! Server configuration.
//!
//! Settings are layered from an optional TOML file and `WAYPOST_`-prefixed
//! environment variables (`WAYPOST_SERVER__LISTEN_ADDR`, etc.). Every field
//! has a default so a bare `waypost serve` works against a local SQLite file.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub server: ServerSettings,
    pub auth: AuthSettings,
    pub runtime_auth: RuntimeAuthSettings,
    pub storage: StorageSettings,
    pub files: FileSettings,
    pub sessions: SessionSettings,
    pub ratelimit: RateLimitSettings,
    pub integrations: IntegrationSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            auth: AuthSettings::default(),
            runtime_auth: RuntimeAuthSettings::default(),
            storage: StorageSettings::default(),
            files: FileSettings::default(),
            sessions: SessionSettings::default(),
            ratelimit: RateLimitSettings::default(),
            integrations: IntegrationSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the HTTP/WebSocket listener binds to.
    pub listen_addr: String,
    /// Allowed CORS origins. Empty means allow any origin.
    pub allowed_origins: Vec<String>,
    /// Cap on HTTP request bodies, bytes.
    pub max_body_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8440".to_string(),
            allowed_origins: Vec::new(),
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Which identity provider validates user bearer tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProvider {
    /// Passwords in our own user table, HS256 tokens we mint ourselves.
    Builtin,
    /// Externally-issued tokens validated against a remote key set.
    External,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub provider: AuthProvider,
    /// HMAC secret for builtin-minted JWTs.
    pub jwt_secret: String,
    /// Lifetime of builtin-minted JWTs, seconds.
    pub jwt_expiry_secs: u64,
    /// JWKS endpoint for the external provider.
    pub external_jwks_url: Option<String>,
    /// Expected issuer for external tokens. Unchecked when empty.
    pub external_issuer: Option<String>,
    /// Admin account created at first startup when builtin.
    pub bootstrap_admin_user: Option<String>,
    pub bootstrap_admin_password: Option<String>,
    /// Default agent visibility when no per-user grants exist: "all" | "none".
    pub default_agent_access: AgentAccessMode,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            provider: AuthProvider::Builtin,
            jwt_secret: String::new(),
            jwt_expiry_secs: 24 * 60 * 60,
            external_jwks_url: None,
            external_issuer: None,
            bootstrap_admin_user: None,
            bootstrap_admin_password: None,
            default_agent_access: AgentAccessMode::All,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentAccessMode {
    All,
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeAuthSettings {
    /// Static `runtime_id -> token` credentials.
    pub static_tokens: HashMap<String, String>,
    /// Secret for minting time-limited runtime tokens. Rotation is off when
    /// unset.
    pub token_secret: Option<String>,
    /// Lifetime of minted time-limited tokens, seconds.
    pub token_lifetime_secs: u64,
}

impl Default for RuntimeAuthSettings {
    fn default() -> Self {
        Self {
            static_tokens: HashMap::new(),
            token_secret: None,
            token_lifetime_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub driver: StorageDriver,
    /// SQLite file path (or DSN for other drivers).
    pub dsn: String,
    /// Messages older than this many days are purged. 0 disables.
    pub message_retention_days: u32,
    /// Audit events older than this many days are purged. 0 disables.
    pub audit_retention_days: u32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            driver: StorageDriver::Sqlite,
            dsn: "waypost.db".to_string(),
            message_retention_days: 0,
            audit_retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    /// Root directory for session file storage.
    pub root: PathBuf,
    /// Cap on a single transferred file, bytes.
    pub max_file_bytes: usize,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("waypost-files"),
            max_file_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Cap on concurrently active sessions per user. 0 disables.
    pub max_per_user: usize,
    /// Idle timeout before the reaper closes a session, seconds. 0 disables.
    pub idle_timeout_secs: u64,
    /// Per-profile idle timeout overrides, seconds.
    pub idle_overrides: HashMap<String, u64>,
    /// When true, a new user message is rejected while a turn is running.
    pub turn_based: bool,
    /// Buffer size of each connection's outbound channel, frames.
    pub reply_buffer: usize,
    /// Cap on a single inbound WebSocket message, bytes.
    pub max_ws_message_bytes: usize,
    /// Cap on message content persisted to the transcript, bytes.
    pub max_content_bytes: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_per_user: 20,
            idle_timeout_secs: 30 * 60,
            idle_overrides: HashMap::new(),
            turn_based: false,
            reply_buffer: 64,
            max_ws_message_bytes: 1024 * 1024,
            max_content_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Sustained requests/second per authenticated user.
    pub user_rps: f64,
    /// Burst capacity per authenticated user.
    pub user_burst: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            user_rps: 10.0,
            user_burst: 20.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct IntegrationSettings {
    /// Upstream ASR service, surfaced to clients via the admin config view.
    pub asr_url: Option<String>,
}

impl Settings {
    /// Load settings from an optional TOML file plus environment overrides.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        } else {
            builder = builder
                .add_source(File::with_name("waypost").format(FileFormat::Toml).required(false));
        }
        let cfg = builder
            .add_source(Environment::with_prefix("WAYPOST").separator("__"))
            .build()
            .context("loading configuration")?;
        let settings: Settings = cfg.try_deserialize().context("parsing configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.storage.driver == StorageDriver::Postgres {
            anyhow::bail!(
                "storage.driver = \"postgres\" is recognized but not implemented; use \"sqlite\""
            );
        }
        if self.auth.provider == AuthProvider::Builtin && self.auth.jwt_secret.is_empty() {
            anyhow::bail!("auth.jwt_secret must be set when auth.provider = \"builtin\"");
        }
        if self.auth.provider == AuthProvider::External && self.auth.external_jwks_url.is_none() {
            anyhow::bail!("auth.external_jwks_url must be set when auth.provider = \"external\"");
        }
        Ok(())
    }

    /// Idle timeout applicable to a profile, seconds. `0` disables reaping.
    pub fn idle_timeout_for(&self, profile: &str) -> u64 {
        self.sessions
            .idle_overrides
            .get(profile)
            .copied()
            .unwrap_or(self.sessions.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let mut s = Settings::default();
        s.auth.jwt_secret = "secret".into();
        s.validate().unwrap();
        assert_eq!(s.sessions.reply_buffer, 64);
        assert_eq!(s.idle_timeout_for("anything"), 30 * 60);
    }

    #[test]
    fn postgres_driver_is_rejected() {
        let mut s = Settings::default();
        s.auth.jwt_secret = "secret".into();
        s.storage.driver = StorageDriver::Postgres;
        assert!(s.validate().is_err());
    }

    #[test]
    fn profile_override_beats_default() {
        let mut s = Settings::default();
        s.sessions.idle_timeout_secs = 600;
        s.sessions.idle_overrides.insert("batch".into(), 0);
        assert_eq!(s.idle_timeout_for("batch"), 0);
        assert_eq!(s.idle_timeout_for("chat"), 600);
    }
}
