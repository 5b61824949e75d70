//! Concrete [`AgentBackend`] over `rig-core` (already in the teacher's
//! dependency table as its multi-provider LLM stack, unused in the pieces of
//! `ironclaw` this crate draws from — this is where that dependency earns
//! its keep). One `rig::agent::Agent` is built per [`AgentKind`]; the
//! "subsession" the rest of this crate resumes by identifier is, under
//! this backend, an in-memory chat history keyed by a generated id — rig's
//! completion API is stateless per call, so persistence is owned here
//! rather than by the provider.

use std::collections::HashMap;

use async_trait::async_trait;
use rig::agent::Agent;
use rig::client::{CompletionClient, ProviderClient};
use rig::completion::Chat;
use rig::message::Message;
use rig::providers::openai;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::agent::backend::{AgentBackend, AgentMessageStream, AgentResult, AgentStreamEvent, ResultSubtype};
use crate::agent::AgentKind;
use crate::error::AgentError;

/// Rough USD-per-1k-token price, used only to produce a cost figure for the
/// budget tracker when the provider response doesn't break out billing
/// (mirrors `compactor::estimate_tokens`'s chars/4 heuristic rather than
/// depending on a live pricing table).
const USD_PER_1K_TOKENS: f64 = 0.01;

struct Subsession {
    kind: AgentKind,
    history: Vec<Message>,
}

/// Builds one chat-capable agent per [`AgentKind`] against a single OpenAI
/// client and tracks conversation history per subsession id in memory.
pub struct RigAgentBackend {
    agents: HashMap<AgentKind, Agent<openai::CompletionModel>>,
    sessions: Mutex<HashMap<String, Subsession>>,
}

impl RigAgentBackend {
    /// Build one agent per [`AgentKind`] up front, regardless of which
    /// kinds this run enables — building a `rig::agent::Agent` only
    /// configures a client/model pair, it makes no network call, so there's
    /// no cost to covering every kind and letting [`LifecycleController`]
    /// decide which ones actually get a `start_subsession` call.
    ///
    /// [`LifecycleController`]: crate::lifecycle::LifecycleController
    pub fn new(client: &openai::CompletionsClient, model: &str) -> Self {
        let agents = AgentKind::all()
            .into_iter()
            .map(|kind| (kind, client.agent(model).build()))
            .collect();

        Self {
            agents,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_env(model: &str) -> Result<Self, AgentError> {
        let client = openai::CompletionsClient::from_env();
        Ok(Self::new(&client, model))
    }
}

fn estimate_cost(prompt: &str, response: &str) -> Decimal {
    let chars = prompt.chars().count() + response.chars().count();
    let tokens = (chars / 4).max(1) as f64;
    Decimal::from_f64(tokens / 1000.0 * USD_PER_1K_TOKENS).unwrap_or(Decimal::ZERO)
}

#[async_trait]
impl AgentBackend for RigAgentBackend {
    async fn start_subsession(
        &self,
        kind: AgentKind,
        system_prompt: &str,
        _allowed_tools: &[String],
    ) -> Result<String, AgentError> {
        if !self.agents.contains_key(&kind) {
            return Err(AgentError::InitFailed {
                kind: kind.label().into(),
                reason: "no rig agent built for this kind".into(),
            });
        }

        let subsession_id = Uuid::new_v4().to_string();
        let history = if system_prompt.is_empty() {
            Vec::new()
        } else {
            vec![Message::assistant(system_prompt)]
        };

        self.sessions
            .lock()
            .await
            .insert(subsession_id.clone(), Subsession { kind, history });

        Ok(subsession_id)
    }

    async fn resume(
        &self,
        subsession_id: &str,
        prompt: &str,
        _max_turns: u32,
        max_budget_usd: Decimal,
    ) -> Result<AgentMessageStream, AgentError> {
        let kind = {
            let sessions = self.sessions.lock().await;
            let session = sessions
                .get(subsession_id)
                .ok_or_else(|| AgentError::InitFailed {
                    kind: subsession_id.into(),
                    reason: "unknown subsession id".into(),
                })?;
            session.kind
        };

        let agent = self.agents.get(&kind).ok_or_else(|| AgentError::InitFailed {
            kind: kind.label().into(),
            reason: "no rig agent built for this kind".into(),
        })?;

        let history = {
            let sessions = self.sessions.lock().await;
            sessions.get(subsession_id).map(|s| s.history.clone()).unwrap_or_default()
        };

        let response = agent
            .chat(prompt, history)
            .await
            .map_err(|e| AgentError::Terminal {
                kind: kind.label().into(),
                reason: e.to_string(),
            })?;

        let cost = estimate_cost(prompt, &response);
        let (subtype, text) = if cost > max_budget_usd {
            (ResultSubtype::Error("per-call budget exceeded".into()), response)
        } else {
            (ResultSubtype::Success, response)
        };

        {
            let mut sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get_mut(subsession_id) {
                session.history.push(Message::user(prompt));
                session.history.push(Message::assistant(text.clone()));
            }
        }

        let event = AgentStreamEvent::Result(AgentResult {
            subtype,
            text,
            cost_usd: cost,
        });
        Ok(Box::pin(futures::stream::iter(vec![Ok(event)])))
    }
}
