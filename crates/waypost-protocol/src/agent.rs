//! Agent capability declarations advertised in `runtime.hello`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the control plane drives an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecModel {
    /// Long-lived conversational process; turns interleave freely.
    #[default]
    #[serde(rename = "interactive")]
    Interactive,
    /// One reply per message, no standing state between turns.
    #[serde(rename = "request-response")]
    RequestResponse,
    /// Each session is a single run that ends when the agent exits.
    #[serde(rename = "run-to-completion")]
    RunToCompletion,
}

impl std::fmt::Display for ExecModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interactive => write!(f, "interactive"),
            Self::RequestResponse => write!(f, "request-response"),
            Self::RunToCompletion => write!(f, "run-to-completion"),
        }
    }
}

/// Capability profile for one agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCaps {
    /// Agent supplies its own native correlation ids for sessions.
    #[serde(default)]
    pub native_session_ids: bool,
    /// Agent emits `turn.completed` when a turn ends.
    #[serde(default)]
    pub turn_completion: bool,
    /// Agent can re-attach to a native session after reconnect.
    #[serde(default)]
    pub resume_attach: bool,
    #[serde(default)]
    pub exec_model: ExecModel,
}

/// One executable agent advertised by a runtime in its hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    pub profile: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Value>,
    #[serde(default)]
    pub caps: AgentCaps,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_model_wire_names() {
        assert_eq!(
            serde_json::to_string(&ExecModel::RequestResponse).unwrap(),
            "\"request-response\""
        );
        let parsed: ExecModel = serde_json::from_str("\"run-to-completion\"").unwrap();
        assert_eq!(parsed, ExecModel::RunToCompletion);
    }

    #[test]
    fn descriptor_defaults_apply() {
        let agent: AgentDescriptor = serde_json::from_str(
            r#"{"id": "a1", "profile": "shell", "name": "Shell"}"#,
        )
        .unwrap();
        assert!(!agent.caps.turn_completion);
        assert_eq!(agent.caps.exec_model, ExecModel::Interactive);
        assert!(agent.tags.is_none());
    }
}
