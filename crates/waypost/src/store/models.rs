//! Durable entity models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// User role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Root tenancy boundary. The `default` org always exists.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Org {
    pub id: String,
    pub name: String,
    pub plan: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    pub org_id: String,
    /// Subject at the external identity provider, when identity is proxied.
    pub external_id: Option<String>,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    #[sqlx(try_from = "String")]
    pub role: Role,
    pub created_at: String,
}

/// A connected (or previously seen) agent host. `online` is derived state
/// maintained by the hub.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Runtime {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub online: bool,
    pub last_seen: Option<String>,
}

/// An executable target inside a runtime. Re-registered wholesale on every
/// runtime hello. JSON-valued columns are stored as TEXT.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: String,
    pub org_id: String,
    pub runtime_id: String,
    pub profile: String,
    pub name: String,
    pub tags: Option<String>,
    pub caps: Option<String>,
    pub security: Option<String>,
}

/// Admin-set overlay pushed to the owning runtime.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentConfigOverride {
    pub agent_id: String,
    pub org_id: String,
    pub security: Option<String>,
    pub limits: Option<String>,
    pub updated_by: String,
    pub updated_at: String,
}

/// Session lifecycle. `closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Creating,
    Active,
    Responding,
    Idle,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Creating => write!(f, "creating"),
            SessionState::Active => write!(f, "active"),
            SessionState::Responding => write!(f, "responding"),
            SessionState::Idle => write!(f, "idle"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(SessionState::Creating),
            "active" => Ok(SessionState::Active),
            "responding" => Ok(SessionState::Responding),
            "idle" => Ok(SessionState::Idle),
            "closed" => Ok(SessionState::Closed),
            _ => Err(format!("unknown session state: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A conversation between one user and one agent. `runtime_id` is fixed at
/// creation; `user_id` is the external identifier when identity is proxied.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: String,
    pub org_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub runtime_id: String,
    pub profile: String,
    #[sqlx(try_from = "String")]
    pub state: SessionState,
    pub native_handle: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Session {
    /// Counted against the per-user session cap and scanned by the reaper.
    pub fn is_live(&self) -> bool {
        self.state != SessionState::Closed
    }
}

/// Message direction within a session transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    User,
    Agent,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::User => write!(f, "user"),
            Direction::Agent => write!(f, "agent"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Direction::User),
            "agent" => Ok(Direction::Agent),
            _ => Err(format!("unknown message direction: {}", s)),
        }
    }
}

impl TryFrom<String> for Direction {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One transcript row. `(session_id, seq)` is unique and contiguous from 1.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoredMessage {
    pub session_id: String,
    pub id: String,
    pub seq: i64,
    #[sqlx(try_from = "String")]
    pub direction: Direction,
    pub channel: String,
    pub content: String,
    pub created_at: String,
}

/// Per-user agent access grant.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PermissionGrant {
    pub user_id: String,
    pub agent_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEvent {
    pub id: i64,
    pub org_id: String,
    pub action: String,
    pub user_id: Option<String>,
    pub runtime_id: Option<String>,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub detail: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceCodeStatus {
    Pending,
    Approved,
    Expired,
}

impl std::fmt::Display for DeviceCodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceCodeStatus::Pending => write!(f, "pending"),
            DeviceCodeStatus::Approved => write!(f, "approved"),
            DeviceCodeStatus::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for DeviceCodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeviceCodeStatus::Pending),
            "approved" => Ok(DeviceCodeStatus::Approved),
            "expired" => Ok(DeviceCodeStatus::Expired),
            _ => Err(format!("unknown device code status: {}", s)),
        }
    }
}

impl TryFrom<String> for DeviceCodeStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Device-code pairing state. `token` holds the minted plaintext only
/// between approval and the first successful poll.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeviceCode {
    pub id: String,
    pub user_code: String,
    pub polling_token: String,
    pub org_id: String,
    #[sqlx(try_from = "String")]
    pub status: DeviceCodeStatus,
    pub runtime_id: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub approved_by: Option<String>,
    pub created_at: String,
    pub expires_at: String,
}

/// A minted runtime credential. Only the SHA-256 hex of the plaintext is
/// ever stored.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RuntimeToken {
    pub id: String,
    pub org_id: String,
    pub runtime_id: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub name: String,
    pub created_by: String,
    pub created_at: String,
    pub last_used_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: String,
    pub org_id: String,
    pub plan: String,
    pub status: String,
    pub current_period_end: Option<String>,
    pub created_at: String,
}
