//! Learner path (spec.md §4.5): formats `tool_use` payloads into a learner
//! prompt, optionally batching several observations into one call
//! (spec.md §4.10 / Design Notes §9 "Ad-hoc re-queue of busy-rejected
//! messages").

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::agent::{AgentKind, AgentSessionManager};
use crate::error::AgentError;
use crate::types::{SessionId, ToolUsePayload};

/// What the dispatcher should do with a claimed row after a learner call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnerOutcome {
    /// The call completed (successfully or with a recovered agent error);
    /// mark the row completed.
    Completed,
    /// The learner subsession was busy; re-queue policy applies
    /// (spec.md §4.5: "returned to pending").
    Requeue,
    /// Buffered into a not-yet-flushed batch; the row stays `processing`
    /// until a later flush completes it.
    Buffered,
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{truncated}…")
    }
}

fn format_single_prompt(payload: &ToolUsePayload, truncate_chars: usize) -> String {
    format!(
        "[TOOL USE]\nname: {}\ninput: {}\nresponse: {}\n\n\
         Extract any durable knowledge worth remembering from this tool use, \
         or respond with the single word SKIP.",
        payload.tool_name,
        truncate(&payload.tool_input.to_string(), truncate_chars),
        truncate(&payload.tool_response.to_string(), truncate_chars),
    )
}

fn format_batch_prompt(items: &[ToolUsePayload], truncate_chars: usize) -> String {
    let mut out = String::from("[TOOL USE BATCH]\n");
    for (i, payload) in items.iter().enumerate() {
        out.push_str(&format!(
            "-- observation {} --\nname: {}\ninput: {}\nresponse: {}\n\n",
            i + 1,
            payload.tool_name,
            truncate(&payload.tool_input.to_string(), truncate_chars),
            truncate(&payload.tool_response.to_string(), truncate_chars),
        ));
    }
    out.push_str(
        "Extract any durable knowledge worth remembering from these observations, \
         or respond with the single word SKIP.",
    );
    out
}

#[derive(Debug, Clone)]
pub struct LearnerBatchConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub max_window: Duration,
}

struct BatchItem {
    id: i64,
    payload: ToolUsePayload,
}

/// Bounded batch of pending `tool_use` observations (spec.md §4.5 "Optional
/// batching"). Ordering within a batch is preserved by FIFO push/drain.
struct LearnerBatcher {
    config: LearnerBatchConfig,
    buffer: Mutex<VecDeque<BatchItem>>,
    opened_at: Mutex<Option<Instant>>,
}

impl LearnerBatcher {
    fn new(config: LearnerBatchConfig) -> Self {
        Self {
            config,
            buffer: Mutex::new(VecDeque::new()),
            opened_at: Mutex::new(None),
        }
    }

    async fn push(&self, item: BatchItem) {
        let mut buffer = self.buffer.lock().await;
        if buffer.is_empty() {
            *self.opened_at.lock().await = Some(Instant::now());
        }
        buffer.push_back(item);
    }

    /// `true` once max-size is reached or max-window has elapsed since the
    /// first buffered item (spec.md §4.5: "Flush triggers: reaching
    /// max-size, elapsed max-window since first buffered item, or
    /// shutdown").
    async fn should_flush(&self) -> bool {
        let buffer = self.buffer.lock().await;
        if buffer.len() < self.config.min_size.max(1) {
            return false;
        }
        if buffer.len() >= self.config.max_size {
            return true;
        }
        match *self.opened_at.lock().await {
            Some(opened) => opened.elapsed() >= self.config.max_window,
            None => false,
        }
    }

    async fn drain(&self) -> Vec<BatchItem> {
        let mut buffer = self.buffer.lock().await;
        *self.opened_at.lock().await = None;
        buffer.drain(..).collect()
    }

    async fn is_empty(&self) -> bool {
        self.buffer.lock().await.is_empty()
    }
}

/// Learner path for one orchestrator (spec.md §4.5).
pub struct LearnerPath {
    agents: Arc<AgentSessionManager>,
    truncate_chars: usize,
    batcher: Option<LearnerBatcher>,
}

impl LearnerPath {
    pub fn new(agents: Arc<AgentSessionManager>, truncate_chars: usize) -> Self {
        Self {
            agents,
            truncate_chars,
            batcher: None,
        }
    }

    pub fn with_batching(mut self, config: LearnerBatchConfig) -> Self {
        self.batcher = Some(LearnerBatcher::new(config));
        self
    }

    /// Handle one claimed `tool_use` message (spec.md §4.5). `id` is the
    /// claimed row's id, threaded through so a batch flush can report back
    /// which rows to complete.
    pub async fn handle_tool_use(
        &self,
        id: i64,
        _session_id: &SessionId,
        payload: &ToolUsePayload,
    ) -> (LearnerOutcome, Vec<i64>) {
        let Some(batcher) = &self.batcher else {
            return (self.call_single(payload).await, vec![id]);
        };

        batcher.push(BatchItem { id, payload: payload.clone() }).await;
        if !batcher.should_flush().await {
            return (LearnerOutcome::Buffered, vec![]);
        }

        self.flush(batcher).await
    }

    /// Force-flush any buffered batch (spec.md §4.5 flush trigger:
    /// "shutdown", and Design Notes' bounded-batch reentrancy semantics).
    pub async fn flush_pending(&self) -> (LearnerOutcome, Vec<i64>) {
        match &self.batcher {
            Some(batcher) if !batcher.is_empty().await => self.flush(batcher).await,
            _ => (LearnerOutcome::Completed, vec![]),
        }
    }

    /// Check the max-window trigger on an otherwise-idle buffer (spec.md
    /// §4.5 flush trigger: "elapsed max-window since first buffered item").
    /// `handle_tool_use` only re-checks triggers when a new observation
    /// arrives, so a lone buffered item with no follow-up would otherwise
    /// sit in `processing` until shutdown; a periodic caller drives this
    /// instead.
    pub async fn poll_window_flush(&self) -> (LearnerOutcome, Vec<i64>) {
        match &self.batcher {
            Some(batcher) if batcher.should_flush().await => self.flush(batcher).await,
            _ => (LearnerOutcome::Buffered, vec![]),
        }
    }

    async fn flush(&self, batcher: &LearnerBatcher) -> (LearnerOutcome, Vec<i64>) {
        let items = batcher.drain().await;
        let ids: Vec<i64> = items.iter().map(|i| i.id).collect();
        let payloads: Vec<ToolUsePayload> = items.into_iter().map(|i| i.payload).collect();
        let prompt = format_batch_prompt(&payloads, self.truncate_chars);

        match self.agents.call(AgentKind::Learner, &prompt).await {
            Ok(_) => (LearnerOutcome::Completed, ids),
            Err(AgentError::Busy { .. }) => (LearnerOutcome::Requeue, ids),
            Err(e) => {
                tracing::warn!(error = %e, "learner batch call failed");
                (LearnerOutcome::Completed, ids)
            }
        }
    }

    async fn call_single(&self, payload: &ToolUsePayload) -> LearnerOutcome {
        let prompt = format_single_prompt(payload, self.truncate_chars);
        match self.agents.call(AgentKind::Learner, &prompt).await {
            Ok(_) => LearnerOutcome::Completed,
            Err(AgentError::Busy { .. }) => LearnerOutcome::Requeue,
            Err(e) => {
                tracing::warn!(error = %e, "learner call failed");
                LearnerOutcome::Completed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> ToolUsePayload {
        ToolUsePayload {
            tool_name: "memory_search".into(),
            tool_input: serde_json::json!({"query": "x"}),
            tool_response: serde_json::json!({"results": []}),
        }
    }

    #[test]
    fn truncate_respects_char_budget() {
        let long = "a".repeat(3000);
        let t = truncate(&long, 2000);
        assert_eq!(t.chars().count(), 2001); // + ellipsis
    }

    #[test]
    fn truncate_is_noop_under_budget() {
        assert_eq!(truncate("short", 2000), "short");
    }

    #[tokio::test]
    async fn batcher_does_not_flush_below_min_size() {
        let batcher = LearnerBatcher::new(LearnerBatchConfig {
            min_size: 2,
            max_size: 8,
            max_window: Duration::from_secs(30),
        });
        batcher.push(BatchItem { id: 1, payload: payload() }).await;
        assert!(!batcher.should_flush().await);
    }

    #[tokio::test]
    async fn batcher_flushes_at_max_size() {
        let batcher = LearnerBatcher::new(LearnerBatchConfig {
            min_size: 1,
            max_size: 2,
            max_window: Duration::from_secs(30),
        });
        batcher.push(BatchItem { id: 1, payload: payload() }).await;
        batcher.push(BatchItem { id: 2, payload: payload() }).await;
        assert!(batcher.should_flush().await);
        let drained = batcher.drain().await;
        assert_eq!(drained.len(), 2);
        assert!(batcher.is_empty().await);
    }

    #[tokio::test]
    async fn batcher_flushes_after_window_elapses() {
        let batcher = LearnerBatcher::new(LearnerBatchConfig {
            min_size: 1,
            max_size: 100,
            max_window: Duration::from_millis(10),
        });
        batcher.push(BatchItem { id: 1, payload: payload() }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(batcher.should_flush().await);
    }
}
