//! Core data model (spec.md §3): session identity, inbox/outbox records,
//! and the tagged payload variants the dispatcher decodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque non-empty string, unique per interactive host session. All
/// orchestrator state is partitioned by this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Construct a `SessionId`, rejecting the empty string per the
    /// `start()` contract (spec.md §4.1: "Fails with ConfigError if
    /// SessionId is empty").
    pub fn new(raw: impl Into<String>) -> Result<Self, crate::error::OrchestratorError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(crate::error::OrchestratorError::Config(
                "session id must not be empty".into(),
            ));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an [`OrchestratorRecord`] (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Clearing,
    Injected,
    Crashed,
}

impl OrchestratorStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Clearing => "clearing",
            Self::Injected => "injected",
            Self::Crashed => "crashed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "starting" => Self::Starting,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "clearing" => Self::Clearing,
            "injected" => Self::Injected,
            "crashed" => Self::Crashed,
            _ => return None,
        })
    }

    /// `true` for terminal statuses the dispatcher should stop polling for.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

/// One row of `orchestrator_state` (spec.md §3, §6.2).
#[derive(Debug, Clone)]
pub struct OrchestratorRecord {
    pub session_id: SessionId,
    pub pid: i64,
    pub retriever_enabled: bool,
    pub learner_enabled: bool,
    pub status: OrchestratorStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retriever_session_id: Option<String>,
    pub learner_session_id: Option<String>,
}

/// Durable status of a [`CognitiveInboxMessage`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl InboxStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Payload of a `session_event` message (spec.md §6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEventPayload {
    pub event: String,
}

/// Payload of a `prompt_context` message (spec.md §6.4, bit-exact).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptContextPayload {
    pub prompt: String,
    pub prompt_hash: String,
    pub timestamp: i64,
}

/// Payload of a `tool_use` message (spec.md §6.4, bit-exact).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUsePayload {
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub tool_response: serde_json::Value,
}

/// Payload of a `session_reset` message (spec.md §6.4, bit-exact).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResetPayload {
    pub new_session_id: String,
    pub transcript_path: String,
}

/// Tagged-variant decoding of `message_type` (Design Notes §9:
/// "process-wide dynamic typing of payloads → tagged-variant decoding").
#[derive(Clone)]
pub enum MessagePayload {
    PromptContext(PromptContextPayload),
    ToolUse(ToolUsePayload),
    SessionEvent(SessionEventPayload),
    SessionReset(SessionResetPayload),
    CuratorTrigger,
    CompactorTrigger,
    /// Unknown message_type; the dispatcher logs and marks it failed.
    Unknown(String),
}

impl MessagePayload {
    /// Decode a `(message_type, payload)` pair from the inbox row.
    pub fn decode(message_type: &str, payload: &serde_json::Value) -> Self {
        match message_type {
            "prompt_context" => serde_json::from_value(payload.clone())
                .map(MessagePayload::PromptContext)
                .unwrap_or_else(|_| MessagePayload::Unknown(message_type.to_string())),
            "tool_use" => serde_json::from_value(payload.clone())
                .map(MessagePayload::ToolUse)
                .unwrap_or_else(|_| MessagePayload::Unknown(message_type.to_string())),
            "session_event" => serde_json::from_value(payload.clone())
                .map(MessagePayload::SessionEvent)
                .unwrap_or_else(|_| MessagePayload::Unknown(message_type.to_string())),
            "session_reset" => serde_json::from_value(payload.clone())
                .map(MessagePayload::SessionReset)
                .unwrap_or_else(|_| MessagePayload::Unknown(message_type.to_string())),
            "curator_trigger" => MessagePayload::CuratorTrigger,
            "compactor_trigger" => MessagePayload::CompactorTrigger,
            other => MessagePayload::Unknown(other.to_string()),
        }
    }
}

/// One claimed row of `cognitive_inbox` (spec.md §3, §6.2).
#[derive(Debug, Clone)]
pub struct CognitiveInboxMessage {
    pub id: i64,
    pub session_id: SessionId,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub status: InboxStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl CognitiveInboxMessage {
    pub fn decoded_payload(&self) -> MessagePayload {
        MessagePayload::decode(&self.message_type, &self.payload)
    }
}

/// Context type for a [`RetrievalOutboxRecord`] (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    MemoryResults,
    None,
}

impl ContextType {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::MemoryResults => "memory_results",
            Self::None => "none",
        }
    }
}

/// A result row written to `retrieval_inbox` for a specific prompt
/// (spec.md §3, §6.2).
#[derive(Debug, Clone)]
pub struct RetrievalOutboxRecord {
    pub session_id: SessionId,
    pub prompt_hash: String,
    pub context_type: ContextType,
    pub context_text: Option<String>,
    pub relevance_score: f64,
}

impl RetrievalOutboxRecord {
    /// The canonical "no context" response written on SKIP, too-short, or
    /// agent-error outcomes (spec.md §4.4 step 4, §7).
    pub fn none(session_id: SessionId, prompt_hash: impl Into<String>) -> Self {
        Self {
            session_id,
            prompt_hash: prompt_hash.into(),
            context_type: ContextType::None,
            context_text: None,
            relevance_score: 0.0,
        }
    }

    pub fn memory_results(
        session_id: SessionId,
        prompt_hash: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            prompt_hash: prompt_hash.into(),
            context_type: ContextType::MemoryResults,
            context_text: Some(text.into()),
            relevance_score: 0.8,
        }
    }
}

/// A versioned compactor output row (spec.md §3).
#[derive(Debug, Clone)]
pub struct SessionStateRecord {
    pub session_id: SessionId,
    pub project_slug: String,
    pub state_text: String,
    pub token_estimate: i32,
    pub version: i32,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_rejects_empty() {
        assert!(SessionId::new("").is_err());
        assert!(SessionId::new("   ").is_err());
        assert!(SessionId::new("abc").is_ok());
    }

    #[test]
    fn decode_prompt_context() {
        let payload = serde_json::json!({
            "prompt": "how do I X?",
            "prompt_hash": "abc0123456789def",
            "timestamp": 1700000000,
        });
        match MessagePayload::decode("prompt_context", &payload) {
            MessagePayload::PromptContext(p) => {
                assert_eq!(p.prompt, "how do I X?");
                assert_eq!(p.prompt_hash, "abc0123456789def");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn decode_unknown_message_type() {
        let payload = serde_json::json!({});
        match MessagePayload::decode("something_weird", &payload) {
            MessagePayload::Unknown(t) => assert_eq!(t, "something_weird"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn decode_malformed_known_type_is_unknown() {
        let payload = serde_json::json!({"not": "the right shape"});
        match MessagePayload::decode("prompt_context", &payload) {
            MessagePayload::Unknown(_) => {}
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn curator_and_compactor_triggers_are_opaque() {
        let payload = serde_json::json!({"anything": true});
        assert!(matches!(
            MessagePayload::decode("curator_trigger", &payload),
            MessagePayload::CuratorTrigger
        ));
        assert!(matches!(
            MessagePayload::decode("compactor_trigger", &payload),
            MessagePayload::CompactorTrigger
        ));
    }
}

impl std::fmt::Debug for MessagePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PromptContext(p) => f.debug_tuple("PromptContext").field(p).finish(),
            Self::ToolUse(p) => f.debug_tuple("ToolUse").field(p).finish(),
            Self::SessionEvent(p) => f.debug_tuple("SessionEvent").field(p).finish(),
            Self::SessionReset(p) => f.debug_tuple("SessionReset").field(p).finish(),
            Self::CuratorTrigger => write!(f, "CuratorTrigger"),
            Self::CompactorTrigger => write!(f, "CompactorTrigger"),
            Self::Unknown(t) => f.debug_tuple("Unknown").field(t).finish(),
        }
    }
}
