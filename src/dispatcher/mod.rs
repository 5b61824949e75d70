//! Inbox dispatcher (spec.md §4.3): polls, claims, and routes
//! `cognitive_inbox` rows to the retrieval coordinator, learner path, and
//! compactor/curator schedulers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::compactor::CompactorScheduler;
use crate::curator::CuratorScheduler;
use crate::db::Database;
use crate::error::OrchestratorError;
use crate::learner::{LearnerOutcome, LearnerPath};
use crate::lifecycle::{ControlSignal, ShutdownCause};
use crate::retrieval::RetrievalCoordinator;
use crate::types::{CognitiveInboxMessage, MessagePayload, OrchestratorStatus, SessionId};

pub struct InboxDispatcher<D: Database> {
    db: Arc<D>,
    session_id: SessionId,
    poll_interval: Duration,
    claim_batch_size: i64,
    retrieval: Option<RetrievalCoordinator<D>>,
    learner: Option<Arc<LearnerPath>>,
    compactor: Option<Arc<CompactorScheduler<D>>>,
    curator: Option<Arc<CuratorScheduler>>,
    control_tx: mpsc::Sender<ControlSignal>,
}

impl<D: Database> InboxDispatcher<D> {
    pub fn new(
        db: Arc<D>,
        session_id: SessionId,
        poll_interval: Duration,
        claim_batch_size: i64,
        retrieval: Option<RetrievalCoordinator<D>>,
        learner: Option<Arc<LearnerPath>>,
        compactor: Option<Arc<CompactorScheduler<D>>>,
        curator: Option<Arc<CuratorScheduler>>,
        control_tx: mpsc::Sender<ControlSignal>,
    ) -> Self {
        Self {
            db,
            session_id,
            poll_interval,
            claim_batch_size,
            retrieval,
            learner,
            compactor,
            curator,
            control_tx,
        }
    }

    /// Drive the polling loop until cancelled (spec.md §4.3: "Polling loop
    /// fires every poll interval"). Step 4's external-stop check happens
    /// after each tick's routing completes.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("dispatcher loop cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "dispatcher tick failed");
                    }
                    if self.external_stop_requested().await {
                        break;
                    }
                }
            }
        }
    }

    async fn external_stop_requested(&self) -> bool {
        match self.db.get_record(&self.session_id).await {
            Ok(Some(record)) if record.status == OrchestratorStatus::Stopping => {
                tracing::info!("external stopping status observed, signalling shutdown");
                let _ = self
                    .control_tx
                    .send(ControlSignal::Shutdown(ShutdownCause::ExternalStatusWrite))
                    .await;
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read own status row");
                false
            }
        }
    }

    /// One claim-route-complete cycle (spec.md §4.3 steps 1-3). Messages
    /// claimed together are routed in claim (creation) order.
    async fn tick(&self) -> Result<(), OrchestratorError> {
        let batch = self
            .db
            .claim_batch(&self.session_id, self.claim_batch_size)
            .await?;

        for message in batch {
            self.route(message).await;
        }

        Ok(())
    }

    async fn route(&self, message: CognitiveInboxMessage) {
        let id = message.id;
        let session_id = message.session_id.clone();

        match message.decoded_payload() {
            MessagePayload::PromptContext(payload) => {
                if let Some(retrieval) = &self.retrieval {
                    retrieval.handle_prompt_context(&session_id, &payload).await;
                }
                self.complete(id).await;
            }
            MessagePayload::ToolUse(payload) => {
                if let Some(learner) = &self.learner {
                    let (outcome, ids) = learner.handle_tool_use(id, &session_id, &payload).await;
                    self.apply_learner_outcome(outcome, ids).await;
                } else {
                    self.complete(id).await;
                }
            }
            MessagePayload::SessionEvent(event) => self.handle_session_event(id, &event.event).await,
            MessagePayload::SessionReset(payload) => {
                self.complete(id).await;
                let _ = self
                    .control_tx
                    .send(ControlSignal::SessionReset(payload))
                    .await;
            }
            MessagePayload::CuratorTrigger => {
                let Some(curator) = &self.curator else {
                    self.complete(id).await;
                    return;
                };
                match curator.run().await {
                    Ok(()) => self.complete(id).await,
                    Err(e) => {
                        tracing::error!(error = %e, "curator trigger failed");
                        self.fail(id).await;
                    }
                }
            }
            MessagePayload::CompactorTrigger => {
                let Some(compactor) = &self.compactor else {
                    self.complete(id).await;
                    return;
                };
                match compactor.force_tick().await {
                    Ok(()) => self.complete(id).await,
                    Err(e) => {
                        tracing::error!(error = %e, "compactor trigger failed");
                        self.fail(id).await;
                    }
                }
            }
            MessagePayload::Unknown(message_type) => {
                tracing::warn!(message_type = %message_type, "unknown inbox message type");
                self.fail(id).await;
            }
        }
    }

    /// `session_event` routing (spec.md §4.3 step 2): `session_end` marks
    /// completed then requests shutdown; any other event is logged and
    /// completed (forward-compatible with event values spec.md §6.4 leaves
    /// open-ended: `"session_end" | ...`).
    async fn handle_session_event(&self, id: i64, event: &str) {
        self.complete(id).await;
        if event == "session_end" {
            let _ = self
                .control_tx
                .send(ControlSignal::Shutdown(ShutdownCause::InboxSessionEnd))
                .await;
        } else {
            tracing::debug!(event, "unhandled session_event variant");
        }
    }

    async fn apply_learner_outcome(&self, outcome: LearnerOutcome, ids: Vec<i64>) {
        match outcome {
            LearnerOutcome::Completed => {
                for id in ids {
                    self.complete(id).await;
                }
            }
            LearnerOutcome::Requeue => {
                for id in ids {
                    self.requeue(id).await;
                }
            }
            LearnerOutcome::Buffered => {
                // Row stays `processing` until a later flush completes or
                // requeues it.
            }
        }
    }

    async fn complete(&self, id: i64) {
        if let Err(e) = self.db.mark_completed(id).await {
            tracing::error!(id, error = %e, "failed to mark message completed");
        }
    }

    async fn fail(&self, id: i64) {
        if let Err(e) = self.db.mark_failed(id).await {
            tracing::error!(id, error = %e, "failed to mark message failed");
        }
    }

    async fn requeue(&self, id: i64) {
        if let Err(e) = self.db.requeue(id).await {
            tracing::error!(id, error = %e, "failed to requeue message");
        }
    }
}
