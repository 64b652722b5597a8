//! The common frame envelope.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type discriminator. The wire value is the dotted string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "runtime.hello")]
    RuntimeHello,
    #[serde(rename = "hello.ack")]
    HelloAck,
    #[serde(rename = "runtime.token_refresh")]
    TokenRefresh,
    #[serde(rename = "session.create")]
    SessionCreate,
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.close")]
    SessionClose,
    #[serde(rename = "session.closed")]
    SessionClosed,
    #[serde(rename = "user.message")]
    UserMessage,
    #[serde(rename = "agent.output")]
    AgentOutput,
    #[serde(rename = "turn.started")]
    TurnStarted,
    #[serde(rename = "turn.completed")]
    TurnCompleted,
    #[serde(rename = "stop.request")]
    StopRequest,
    #[serde(rename = "stop.ack")]
    StopAck,
    #[serde(rename = "permission.request")]
    PermissionRequest,
    #[serde(rename = "permission.response")]
    PermissionResponse,
    #[serde(rename = "agent.config_update")]
    AgentConfigUpdate,
    #[serde(rename = "agent.config_ack")]
    AgentConfigAck,
    #[serde(rename = "file.upload")]
    FileUpload,
    #[serde(rename = "file.available")]
    FileAvailable,
    #[serde(rename = "client.subscribe")]
    ClientSubscribe,
    #[serde(rename = "client.unsubscribe")]
    ClientUnsubscribe,
    #[serde(rename = "history.response")]
    HistoryResponse,
    #[serde(rename = "native_sessions.list")]
    NativeSessionsList,
    #[serde(rename = "native_sessions.response")]
    NativeSessionsResponse,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

impl MessageKind {
    /// The dotted wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RuntimeHello => "runtime.hello",
            Self::HelloAck => "hello.ack",
            Self::TokenRefresh => "runtime.token_refresh",
            Self::SessionCreate => "session.create",
            Self::SessionCreated => "session.created",
            Self::SessionClose => "session.close",
            Self::SessionClosed => "session.closed",
            Self::UserMessage => "user.message",
            Self::AgentOutput => "agent.output",
            Self::TurnStarted => "turn.started",
            Self::TurnCompleted => "turn.completed",
            Self::StopRequest => "stop.request",
            Self::StopAck => "stop.ack",
            Self::PermissionRequest => "permission.request",
            Self::PermissionResponse => "permission.response",
            Self::AgentConfigUpdate => "agent.config_update",
            Self::AgentConfigAck => "agent.config_ack",
            Self::FileUpload => "file.upload",
            Self::FileAvailable => "file.available",
            Self::ClientSubscribe => "client.subscribe",
            Self::ClientUnsubscribe => "client.unsubscribe",
            Self::HistoryResponse => "history.response",
            Self::NativeSessionsList => "native_sessions.list",
            Self::NativeSessionsResponse => "native_sessions.response",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload decode failure.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("envelope has no payload")]
    MissingPayload,
    #[error("invalid payload: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// The JSON envelope shared by every frame on both sides of the bus.
///
/// `payload` stays raw JSON until the receiver knows, from `kind`, which
/// schema to decode it into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Sender-assigned frame id, used for request/response correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Session this frame belongs to, when it belongs to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Sender clock, Unix milliseconds.
    pub ts: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// New envelope stamped with the current time.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            id: None,
            session_id: None,
            ts: Utc::now().timestamp_millis(),
            payload: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach a serialized payload. Serialization of the payload types in
    /// this crate cannot fail; a failing foreign `Serialize` impl degrades
    /// to a `null` payload rather than an error.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        self.payload = Some(serde_json::to_value(payload).unwrap_or(Value::Null));
        self
    }

    /// Decode the payload into the schema selected by `kind`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        let payload = self.payload.as_ref().ok_or(DecodeError::MissingPayload)?;
        Ok(serde_json::from_value(payload.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::HelloAck;

    #[test]
    fn kind_round_trips_through_wire_name() {
        let json = serde_json::to_string(&MessageKind::TokenRefresh).unwrap();
        assert_eq!(json, "\"runtime.token_refresh\"");
        let back: MessageKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, MessageKind::TokenRefresh);
    }

    #[test]
    fn envelope_serializes_minimal_fields() {
        let env = Envelope::new(MessageKind::Ping);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "ping");
        assert!(json.get("id").is_none());
        assert!(json.get("session_id").is_none());
        assert!(json.get("payload").is_none());
        assert!(json["ts"].as_i64().unwrap() > 0);
    }

    #[test]
    fn envelope_decodes_typed_payload() {
        let env = Envelope::new(MessageKind::HelloAck).with_payload(&HelloAck {
            ok: false,
            error: Some("bad token".into()),
        });
        let text = serde_json::to_string(&env).unwrap();
        let parsed: Envelope = serde_json::from_str(&text).unwrap();
        let ack: HelloAck = parsed.decode().unwrap();
        assert!(!ack.ok);
        assert_eq!(ack.error.as_deref(), Some("bad token"));
    }

    #[test]
    fn decode_without_payload_is_an_error() {
        let env = Envelope::new(MessageKind::Pong);
        let err = env.decode::<HelloAck>().unwrap_err();
        assert!(matches!(err, DecodeError::MissingPayload));
    }
}
