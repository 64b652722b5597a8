//! Payload schemas, one per [`MessageKind`](crate::MessageKind).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentDescriptor;

/// Output channels a message can arrive on.
pub const CHANNEL_STDIN: &str = "stdin";
pub const CHANNEL_STDOUT: &str = "stdout";
pub const CHANNEL_STDERR: &str = "stderr";
pub const CHANNEL_SYSTEM: &str = "system";
pub const CHANNEL_FILE: &str = "file";

/// `runtime.hello` — first frame on a runtime connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeHello {
    pub runtime_id: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
}

/// `hello.ack` — handshake verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAck {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `runtime.token_refresh` — rotated credential pushed to a connected runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRefresh {
    pub token: String,
    /// Unix milliseconds at which the pushed token expires.
    pub expires_at: i64,
}

/// `session.create` — control plane asks a runtime to open a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreate {
    pub session_id: String,
    pub agent_id: String,
    pub profile: String,
    pub user_id: String,
}

/// `session.created` — runtime's asynchronous reply to `session.create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `session.close` — control plane asks the runtime to tear a session down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClose {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `session.closed` — notification that a session reached its terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClosed {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `user.message` — a user turn, idempotent on `(session_id, message_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub session_id: String,
    pub message_id: String,
    pub content: String,
}

/// `agent.output` — one unit of agent output.
///
/// `seq` is authoritative only on server → client frames; on frames arriving
/// from a runtime it is ignored and reassigned. `message_id` exists for
/// runtimes that tag their output; the server does not echo it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub seq: i64,
    pub channel: String,
    pub content: String,
    #[serde(rename = "final", default)]
    pub is_final: bool,
}

/// `turn.started`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnStarted {
    pub session_id: String,
}

/// `turn.completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnCompleted {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

/// `stop.request` / `stop.ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopAck {
    pub session_id: String,
}

/// `permission.request` — runtime asks the user to approve a tool action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub session_id: String,
    pub request_id: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// `permission.response` — verdict, from the client or from the timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub session_id: String,
    pub request_id: String,
    pub approved: bool,
}

/// `agent.config_update` — admin override pushed to the owning runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigUpdate {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<Value>,
}

/// `agent.config_ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigAck {
    pub agent_id: String,
    pub ok: bool,
}

/// `file.upload` — control plane relays an uploaded file to a runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileUpload {
    pub session_id: String,
    pub file_id: String,
    pub name: String,
    pub content_base64: String,
}

/// `file.available` — runtime publishes a file produced inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAvailable {
    pub session_id: String,
    pub file_id: String,
    pub name: String,
    pub content_base64: String,
}

/// The JSON content envelope persisted for `file`-channel messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRef {
    pub file_id: String,
    pub name: String,
    pub size: u64,
}

/// `client.subscribe` — register for a session's fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSubscribe {
    pub session_id: String,
    /// When present, replay stored messages with seq greater than this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_seq: Option<i64>,
}

/// `client.unsubscribe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientUnsubscribe {
    pub session_id: String,
}

/// One stored message as replayed in `history.response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: String,
    pub seq: i64,
    pub direction: String,
    pub channel: String,
    pub content: String,
    pub created_at: String,
}

/// `history.response` — replay after `client.subscribe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub session_id: String,
    pub messages: Vec<HistoryMessage>,
}

/// `native_sessions.list` — client asks a runtime for its native sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeSessionsList {
    pub request_id: String,
    pub agent_id: String,
}

/// `native_sessions.response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeSessionsResponse {
    pub request_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub sessions: Value,
}

/// `error` — structured failure frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_output_final_keyword_renames() {
        let out = AgentOutput {
            session_id: "s1".into(),
            message_id: None,
            seq: 3,
            channel: CHANNEL_STDOUT.into(),
            content: "hi".into(),
            is_final: true,
        };
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["final"], true);
        assert!(json.get("message_id").is_none());
    }

    #[test]
    fn inbound_agent_output_defaults_seq_to_zero() {
        let out: AgentOutput = serde_json::from_str(
            r#"{"session_id": "s1", "channel": "stdout", "content": "x"}"#,
        )
        .unwrap();
        assert_eq!(out.seq, 0);
        assert!(!out.is_final);
    }

    #[test]
    fn hello_parses_with_agent_list() {
        let hello: RuntimeHello = serde_json::from_str(
            r#"{
                "runtime_id": "runtime-3f2a",
                "token": "t",
                "agents": [{"id": "a", "profile": "cli", "name": "CLI",
                            "caps": {"turn_completion": true, "exec_model": "interactive"}}]
            }"#,
        )
        .unwrap();
        assert_eq!(hello.agents.len(), 1);
        assert!(hello.org_id.is_none());
        assert!(hello.agents[0].caps.turn_completion);
    }
}
