//! Retrieval coordinator (spec.md §4.4): runs the Keyword and Cascade
//! retrievers concurrently per prompt, merges outcomes, peer-notifies, and
//! writes the retrieval outbox.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::agent::{AgentKind, AgentSessionManager};
use crate::db::Database;
use crate::error::AgentError;
use crate::types::{PromptContextPayload, RetrievalOutboxRecord, SessionId};
use crate::window::SlidingWindow;

/// The literal "no context" marker an agent may return instead of text
/// (spec.md §4.4 step 4).
const SKIP_MARKER: &str = "SKIP";

pub struct RetrievalCoordinatorConfig {
    pub skip_threshold_chars: usize,
}

/// Coordinates both Retriever kinds for one orchestrator (spec.md §4.4).
pub struct RetrievalCoordinator<D: Database> {
    db: Arc<D>,
    agents: Arc<AgentSessionManager>,
    window: Arc<Mutex<SlidingWindow>>,
    config: RetrievalCoordinatorConfig,
}

/// One retriever's disposition of its own text (spec.md §4.4 step 4).
enum Disposition {
    None,
    MemoryResults(String),
}

fn classify(text: &str, skip_threshold_chars: usize) -> Disposition {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(SKIP_MARKER) || trimmed.len() < skip_threshold_chars {
        Disposition::None
    } else {
        Disposition::MemoryResults(trimmed.to_string())
    }
}

impl<D: Database> RetrievalCoordinator<D> {
    pub fn new(
        db: Arc<D>,
        agents: Arc<AgentSessionManager>,
        window: Arc<Mutex<SlidingWindow>>,
        config: RetrievalCoordinatorConfig,
    ) -> Self {
        Self {
            db,
            agents,
            window,
            config,
        }
    }

    /// Handle one claimed `prompt_context` message end to end (spec.md §4.4
    /// steps 1-6). Never returns `Err` for agent-level failures — those are
    /// converted to a safe `{none, null}` outbox record per spec.md §7
    /// ("AgentError ... Recovered per-message").
    pub async fn handle_prompt_context(
        &self,
        session_id: &SessionId,
        payload: &PromptContextPayload,
    ) {
        {
            let mut window = self.window.lock().await;
            window.push_user(&payload.prompt);
        }

        // Peer notification (spec.md §4.4 step 5) only has a prompt to land
        // in if retriever A settles *before* retriever B's own prompt is
        // composed and dispatched, so give A a brief head start instead of
        // composing one shared prompt and joining both calls at once — this
        // is still best-effort (spec.md doesn't guarantee ordering), just no
        // longer structurally impossible within a single round.
        let prompt_a = self.compose_prompt(&payload.prompt).await;
        let mut call_a = Box::pin(self.run_retriever(AgentKind::RetrieverA, &prompt_a));
        let early_a = tokio::select! {
            biased;
            result = &mut call_a => Some(result),
            _ = tokio::time::sleep(Duration::from_millis(50)) => None,
        };
        let early_a_hit = matches!(early_a, Some(Some(Disposition::MemoryResults(_))));
        if early_a_hit {
            self.window.lock().await.push_peer_marker(AgentKind::RetrieverA.label());
        }

        let prompt_b = self.compose_prompt(&payload.prompt).await;
        let (result_a, result_b) = tokio::join!(
            async move {
                match early_a {
                    Some(result) => result,
                    None => call_a.await,
                }
            },
            self.run_retriever(AgentKind::RetrieverB, &prompt_b),
        );

        // A's marker may not have been pushed yet if it settled only during
        // the join above (after B was already dispatched); push it now so
        // the window still reflects it for anything reading it afterward.
        if matches!(result_a, Some(Disposition::MemoryResults(_))) && !early_a_hit {
            self.window.lock().await.push_peer_marker(AgentKind::RetrieverA.label());
        }
        if matches!(result_b, Some(Disposition::MemoryResults(_))) {
            self.window.lock().await.push_peer_marker(AgentKind::RetrieverB.label());
        }

        self.write_outcome(session_id, &payload.prompt_hash, result_a).await;
        self.write_outcome(session_id, &payload.prompt_hash, result_b).await;
    }

    async fn compose_prompt(&self, new_prompt: &str) -> String {
        let snapshot = self.window.lock().await.format_snapshot();
        format!(
            "{snapshot}\n[NEW PROMPT]\n{new_prompt}\n\n\
             Respond with relevant prior context for this prompt, or the single \
             word SKIP if nothing is relevant."
        )
    }

    /// Run one retriever kind; `None` models "this retriever was not
    /// dispatched" (kept for symmetry even though both kinds are always
    /// invoked together today).
    async fn run_retriever(&self, kind: AgentKind, prompt: &str) -> Option<Disposition> {
        match self.agents.call(kind, prompt).await {
            Ok(text) => Some(classify(&text, self.config.skip_threshold_chars)),
            Err(AgentError::Busy { .. }) => {
                // Busy-queue policy for the Retriever path (spec.md §5
                // table): write a safe outbox record immediately.
                tracing::debug!(kind = %kind, "retriever busy, writing safe outbox");
                Some(Disposition::None)
            }
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "retriever call failed");
                Some(Disposition::None)
            }
        }
    }

    async fn write_outcome(
        &self,
        session_id: &SessionId,
        prompt_hash: &str,
        outcome: Option<Disposition>,
    ) {
        let Some(disposition) = outcome else {
            return;
        };
        let record = match disposition {
            Disposition::None => RetrievalOutboxRecord::none(session_id.clone(), prompt_hash),
            Disposition::MemoryResults(text) => {
                RetrievalOutboxRecord::memory_results(session_id.clone(), prompt_hash, text)
            }
        };
        if let Err(e) = self.db.write_outbox(&record).await {
            tracing::error!(error = %e, "failed to write retrieval outbox record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_none() {
        assert!(matches!(classify("", 20), Disposition::None));
    }

    #[test]
    fn skip_marker_is_none_case_insensitive() {
        assert!(matches!(classify("skip", 20), Disposition::None));
        assert!(matches!(classify("SKIP", 20), Disposition::None));
    }

    #[test]
    fn too_short_text_is_none() {
        assert!(matches!(classify("short", 20), Disposition::None));
    }

    #[test]
    fn long_enough_text_is_memory_results() {
        let text = "this is a sufficiently long retrieval result";
        match classify(text, 20) {
            Disposition::MemoryResults(t) => assert_eq!(t, text),
            Disposition::None => panic!("expected MemoryResults"),
        }
    }
}
