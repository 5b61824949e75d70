use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::agent::backend::{AgentBackend, AgentStreamEvent, ResultSubtype};
use crate::agent::AgentKind;
use crate::budget::BudgetTracker;
use crate::error::AgentError;

struct SubsessionState {
    subsession_id: Option<String>,
}

/// Per-kind subsession handle. The `tokio::sync::Mutex` doubles as the
/// non-reentrancy guard (spec.md §4.2): a held lock means the kind is busy,
/// and callers use `try_lock` rather than waiting so busy-queue policy
/// decisions (spec.md §5 table) can be made immediately.
pub struct AgentSubsessionHandle {
    kind: AgentKind,
    state: Mutex<SubsessionState>,
}

impl AgentSubsessionHandle {
    fn new(kind: AgentKind) -> Self {
        Self {
            kind,
            state: Mutex::new(SubsessionState {
                subsession_id: None,
            }),
        }
    }
}

/// Wraps the LLM SDK's streaming query primitive with a persistent
/// subsession handle per agent kind (spec.md §4.2).
pub struct AgentSessionManager {
    backend: Arc<dyn AgentBackend>,
    handles: HashMap<AgentKind, Arc<AgentSubsessionHandle>>,
    budget: Arc<BudgetTracker>,
    max_turns: u32,
}

impl AgentSessionManager {
    pub fn new(backend: Arc<dyn AgentBackend>, budget: Arc<BudgetTracker>, max_turns: u32) -> Self {
        Self {
            backend,
            handles: HashMap::new(),
            budget,
            max_turns,
        }
    }

    /// Initialize all `kinds` in parallel, sending each its priming prompt
    /// (spec.md §4.1: "initializes all enabled agent subsessions in
    /// parallel").
    pub async fn initialize(
        &mut self,
        kinds: &[AgentKind],
        system_prompts: &HashMap<AgentKind, String>,
    ) -> Result<(), AgentError> {
        let empty = String::new();
        let inits = kinds.iter().map(|&kind| {
            let backend = Arc::clone(&self.backend);
            let prompt = system_prompts.get(&kind).unwrap_or(&empty).clone();
            let tools = kind.allowed_tools();
            async move {
                let id = backend.start_subsession(kind, &prompt, &tools).await?;
                Ok::<_, AgentError>((kind, id))
            }
        });

        let results = futures::future::join_all(inits).await;

        for result in results {
            let (kind, subsession_id) = result?;
            let handle = Arc::new(AgentSubsessionHandle::new(kind));
            handle.state.lock().await.subsession_id = Some(subsession_id);
            self.handles.insert(kind, handle);
        }

        Ok(())
    }

    pub fn handle(&self, kind: AgentKind) -> Option<Arc<AgentSubsessionHandle>> {
        self.handles.get(&kind).cloned()
    }

    pub fn subsession_ids(&self) -> HashMap<AgentKind, Option<String>> {
        // Best-effort snapshot; only used for diagnostics/tests, so a
        // try_lock miss just reports None rather than blocking.
        self.handles
            .iter()
            .map(|(&kind, handle)| {
                let id = handle
                    .state
                    .try_lock()
                    .ok()
                    .and_then(|s| s.subsession_id.clone());
                (kind, id)
            })
            .collect()
    }

    /// Call an agent of `kind` with `prompt`, honoring budget and
    /// reentrancy guards (spec.md §4.2).
    ///
    /// Returns `Err(AgentError::Busy)` immediately if the kind is already
    /// in flight — the caller (dispatcher/coordinator) is responsible for
    /// applying the per-message-type busy-queue policy (spec.md §5 table).
    pub async fn call(&self, kind: AgentKind, prompt: &str) -> Result<String, AgentError> {
        let handle = self
            .handles
            .get(&kind)
            .ok_or_else(|| AgentError::InitFailed {
                kind: kind.label().into(),
                reason: "not initialized".into(),
            })?;

        let mut guard = handle.state.try_lock().map_err(|_| AgentError::Busy {
            kind: kind.label().into(),
        })?;

        self.budget.check(kind)?;

        let subsession_id = guard
            .subsession_id
            .clone()
            .ok_or_else(|| AgentError::InitFailed {
                kind: kind.label().into(),
                reason: "subsession id missing".into(),
            })?;

        let per_call_cap = self
            .budget
            .caps_for(kind)
            .map(|c| c.per_call_usd)
            .unwrap_or(Decimal::MAX);

        let mut stream = self
            .backend
            .resume(&subsession_id, prompt, self.max_turns, per_call_cap)
            .await?;

        let result = loop {
            match stream.next().await {
                Some(Ok(AgentStreamEvent::Message(_))) => continue,
                Some(Ok(AgentStreamEvent::Result(result))) => break result,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(AgentError::StreamEnded {
                        kind: kind.label().into(),
                    });
                }
            }
        };

        // Update the subsession id in case the SDK rotated it mid-call;
        // kept under the same guard the busy-check acquired.
        guard.subsession_id = Some(subsession_id);
        drop(guard);

        self.budget.record(kind, result.cost_usd);

        match result.subtype {
            ResultSubtype::Success => Ok(result.text),
            ResultSubtype::Error(reason) => Err(AgentError::Terminal {
                kind: kind.label().into(),
                reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::backend::{AgentMessageStream, AgentResult};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubBackend {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AgentBackend for StubBackend {
        async fn start_subsession(
            &self,
            kind: AgentKind,
            _system_prompt: &str,
            _allowed_tools: &[String],
        ) -> Result<String, AgentError> {
            Ok(format!("sub-{}", kind.label()))
        }

        async fn resume(
            &self,
            _subsession_id: &str,
            _prompt: &str,
            _max_turns: u32,
            _max_budget_usd: Decimal,
        ) -> Result<AgentMessageStream, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let subtype = if self.fail {
                ResultSubtype::Error("boom".into())
            } else {
                ResultSubtype::Success
            };
            let events = vec![Ok(AgentStreamEvent::Result(AgentResult {
                subtype,
                text: "some memory context".into(),
                cost_usd: dec!(0.01),
            }))];
            Ok(Box::pin(futures::stream::iter(events)))
        }
    }

    fn tracker() -> Arc<BudgetTracker> {
        Arc::new(BudgetTracker::new(HashMap::new(), dec!(10.00)))
    }

    #[tokio::test]
    async fn initializes_and_calls_successfully() {
        let backend = Arc::new(StubBackend {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let mut manager = AgentSessionManager::new(backend, tracker(), 10);
        manager
            .initialize(&[AgentKind::RetrieverA], &HashMap::new())
            .await
            .unwrap();

        let text = manager.call(AgentKind::RetrieverA, "hi").await.unwrap();
        assert_eq!(text, "some memory context");
    }

    #[tokio::test]
    async fn terminal_error_surfaces_as_agent_error() {
        let backend = Arc::new(StubBackend {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let mut manager = AgentSessionManager::new(backend, tracker(), 10);
        manager
            .initialize(&[AgentKind::Learner], &HashMap::new())
            .await
            .unwrap();

        let err = manager.call(AgentKind::Learner, "hi").await.unwrap_err();
        assert!(matches!(err, AgentError::Terminal { .. }));
    }

    #[tokio::test]
    async fn uninitialized_kind_fails() {
        let backend = Arc::new(StubBackend {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let manager = AgentSessionManager::new(backend, tracker(), 10);
        let err = manager.call(AgentKind::Curator, "hi").await.unwrap_err();
        assert!(matches!(err, AgentError::InitFailed { .. }));
    }

    #[tokio::test]
    async fn budget_exhaustion_blocks_calls() {
        let backend = Arc::new(StubBackend {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let mut caps = HashMap::new();
        caps.insert(
            AgentKind::RetrieverA,
            crate::budget::BudgetCaps::new(dec!(0.10), dec!(0.00)),
        );
        let budget = Arc::new(BudgetTracker::new(caps, dec!(10.00)));
        let mut manager = AgentSessionManager::new(backend, budget, 10);
        manager
            .initialize(&[AgentKind::RetrieverA], &HashMap::new())
            .await
            .unwrap();

        let err = manager.call(AgentKind::RetrieverA, "hi").await.unwrap_err();
        assert!(matches!(err, AgentError::Budget(_)));
    }
}
