//! The LLM agent SDK boundary (spec.md §1: "out of scope ... the agent SDK
//! itself is a dependency").
//!
//! [`AgentBackend`] is the seam Design Notes §9 calls for: "Callback-driven
//! LLM streaming → an iterator abstraction over the agent SDK's message
//! stream; the routing task loops until a terminal-subtype element, then
//! returns a structured Result." The orchestrator never interprets prompt
//! content or tool results beyond routing them — it only drives the stream
//! to completion and accounts for cost.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use rust_decimal::Decimal;

use crate::agent::AgentKind;
use crate::error::AgentError;

/// One element of an agent subsession's streamed response.
#[derive(Debug, Clone)]
pub enum AgentStreamEvent {
    /// An intermediate assistant message or tool-use notification. The
    /// orchestrator only forwards these through the MCP gateway; it does
    /// not interpret them (spec.md §4.5: "the orchestrator does not
    /// interpret the saves, only forwards tool invocations").
    Message(String),
    /// The terminal element of the stream (spec.md §4.2 step 3).
    Result(AgentResult),
}

#[derive(Debug, Clone)]
pub struct AgentResult {
    pub subtype: ResultSubtype,
    pub text: String,
    pub cost_usd: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultSubtype {
    Success,
    /// Non-success terminal subtype; the routing task raises
    /// [`AgentError::Terminal`].
    Error(String),
}

pub type AgentMessageStream =
    Pin<Box<dyn Stream<Item = Result<AgentStreamEvent, AgentError>> + Send>>;

/// A long-lived conversational context inside the LLM backend, addressable
/// by the subsession identifier it returns (spec.md Glossary: "Agent
/// subsession").
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Send the priming prompt for a freshly created agent kind and return
    /// the subsession identifier to resume on every subsequent call
    /// (spec.md §4.2: "the manager sends a priming prompt that yields a
    /// subsession identifier; all subsequent calls resume that identifier").
    async fn start_subsession(
        &self,
        kind: AgentKind,
        system_prompt: &str,
        allowed_tools: &[String],
    ) -> Result<String, AgentError>;

    /// Resume `subsession_id` with `prompt`, streaming messages until a
    /// terminal [`AgentResult`]. `max_turns` and `max_budget_usd` are
    /// enforced by the SDK itself (spec.md §5: "every agent call carries a
    /// cap ... that the SDK enforces").
    async fn resume(
        &self,
        subsession_id: &str,
        prompt: &str,
        max_turns: u32,
        max_budget_usd: Decimal,
    ) -> Result<AgentMessageStream, AgentError>;
}
