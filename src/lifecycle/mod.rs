//! Lifecycle controller (spec.md §4.1): process start/stop/crash
//! transitions, shutdown signals, and session-reset handoff.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentBackend, AgentKind, AgentSessionManager};
use crate::budget::{BudgetCaps, BudgetTracker};
use crate::compactor::CompactorScheduler;
use crate::config::OrchestratorConfig;
use crate::curator::CuratorScheduler;
use crate::db::Database;
use crate::dispatcher::InboxDispatcher;
use crate::error::OrchestratorError;
use crate::learner::{LearnerBatchConfig, LearnerOutcome, LearnerPath};
use crate::mcp::McpToolserver;
use crate::retrieval::{RetrievalCoordinator, RetrievalCoordinatorConfig};
use crate::types::{OrchestratorStatus, SessionId, SessionResetPayload};
use crate::window::SlidingWindow;

/// Why the controller is shutting down (spec.md §4.1 `shutdown(cause)`).
#[derive(Debug, Clone)]
pub enum ShutdownCause {
    Signal(&'static str),
    InboxSessionEnd,
    BudgetExhausted,
    ParentGone,
    ExternalStatusWrite,
    Error(String),
}

impl std::fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal(s) => write!(f, "signal({s})"),
            Self::InboxSessionEnd => write!(f, "inbox session_end"),
            Self::BudgetExhausted => write!(f, "budget exhausted"),
            Self::ParentGone => write!(f, "parent process gone"),
            Self::ExternalStatusWrite => write!(f, "external status write"),
            Self::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// What a routing task or timer asks the controller to do next.
pub enum ControlSignal {
    Shutdown(ShutdownCause),
    SessionReset(SessionResetPayload),
}

fn enabled_kinds(config: &OrchestratorConfig) -> Vec<AgentKind> {
    let mut kinds = Vec::new();
    if config.retriever.is_on() {
        kinds.push(AgentKind::RetrieverA);
        kinds.push(AgentKind::RetrieverB);
    }
    if config.learner.is_on() {
        kinds.push(AgentKind::Learner);
    }
    if config.compactor.is_on() {
        kinds.push(AgentKind::Compactor);
    }
    if config.curator.is_on() {
        kinds.push(AgentKind::Curator);
    }
    kinds
}

fn budget_caps(config: &OrchestratorConfig) -> HashMap<AgentKind, BudgetCaps> {
    let mut caps = HashMap::new();
    caps.insert(
        AgentKind::RetrieverA,
        BudgetCaps::new(config.retriever_a_budget, config.session_budget),
    );
    caps.insert(
        AgentKind::RetrieverB,
        BudgetCaps::new(config.retriever_b_budget, config.session_budget),
    );
    caps.insert(
        AgentKind::Learner,
        BudgetCaps::new(config.learner_budget, config.session_budget),
    );
    caps.insert(
        AgentKind::Compactor,
        BudgetCaps::new(config.compactor_budget, config.session_budget),
    );
    caps.insert(
        AgentKind::Curator,
        BudgetCaps::new(config.curator_budget, config.session_budget),
    );
    caps
}

fn system_prompts(kinds: &[AgentKind]) -> HashMap<AgentKind, String> {
    kinds
        .iter()
        .map(|&kind| {
            let prompt = match kind {
                AgentKind::RetrieverA => {
                    "You are the keyword memory retriever. Given the conversation so \
                     far and a new prompt, search memory by keyword overlap and return \
                     relevant prior context, or SKIP."
                }
                AgentKind::RetrieverB => {
                    "You are the cascade memory retriever. Given the conversation so \
                     far and a new prompt, search memory by semantic cascade and return \
                     relevant prior context, or SKIP."
                }
                AgentKind::Learner => {
                    "You are the learner agent. Given a tool use observation, extract \
                     durable knowledge worth remembering and save it, or respond SKIP."
                }
                AgentKind::Compactor => {
                    "You are the compactor agent. Given previous state and new \
                     conversation, produce an updated state document preserving KEY \
                     DECISIONS and refreshing WORKING CONTEXT."
                }
                AgentKind::Curator => {
                    "You are the curator agent. Perform routine memory maintenance: \
                     merge duplicates, archive stale entries, resolve contradictions."
                }
            };
            (kind, prompt.to_string())
        })
        .collect()
}

/// Apply a learner flush's outcome to the inbox rows it covered — shared
/// between the periodic window-flush ticker and the shutdown-time forced
/// flush so both drive the same `mark_completed`/`requeue` policy
/// (spec.md §4.5: busy subsession re-queues, anything else completes).
async fn apply_learner_outcome<D: Database>(db: &D, outcome: LearnerOutcome, ids: Vec<i64>, trigger: &str) {
    if ids.is_empty() {
        return;
    }
    match outcome {
        LearnerOutcome::Requeue => {
            for id in ids {
                if let Err(e) = db.requeue(id).await {
                    tracing::warn!(id, trigger, error = %e, "failed to requeue learner batch row");
                }
            }
        }
        _ => {
            for id in ids {
                if let Err(e) = db.mark_completed(id).await {
                    tracing::warn!(id, trigger, error = %e, "failed to complete learner batch row");
                }
            }
        }
    }
}

/// One "session epoch" worth of spawned background tasks — the dispatcher
/// loop plus the compactor/curator timers — all bound to a single
/// [`SessionId`] and cancelled together on session_reset or shutdown.
struct SessionEpoch {
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    learner: Option<Arc<LearnerPath>>,
}

impl SessionEpoch {
    async fn cancel_and_join(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

pub struct LifecycleController<D: Database> {
    db: Arc<D>,
    config: OrchestratorConfig,
    agents: Arc<AgentSessionManager>,
    budget: Arc<BudgetTracker>,
    window: Arc<Mutex<SlidingWindow>>,
    mcp: Option<McpToolserver>,
    root_cancel: CancellationToken,
}

impl<D: Database + 'static> LifecycleController<D> {
    /// **start(config)** (spec.md §4.1): idempotently upserts the record,
    /// initializes all enabled agents in parallel, transitions to running.
    pub async fn start(
        db: Arc<D>,
        config: OrchestratorConfig,
        backend: Arc<dyn AgentBackend>,
    ) -> Result<(Self, SessionId), OrchestratorError> {
        let session_id = SessionId::new(config.session_id.clone())?;
        let pid = std::process::id() as i64;

        db.upsert_starting(
            &session_id,
            pid,
            config.retriever.is_on(),
            config.learner.is_on(),
        )
        .await?;

        let mcp = McpToolserver::spawn(&config.mcp_toolserver_path, &config.working_dir())
            .map_err(|e| OrchestratorError::Init(e.to_string()))
            .inspect_err(|_| {
                tracing::error!("failed to spawn MCP toolserver during start");
            })
            .ok();

        let budget = Arc::new(BudgetTracker::new(budget_caps(&config), config.session_budget));

        let kinds = enabled_kinds(&config);
        let mut agents = AgentSessionManager::new(backend, Arc::clone(&budget), config.max_turns);
        agents
            .initialize(&kinds, &system_prompts(&kinds))
            .await
            .map_err(|e| OrchestratorError::Init(format!("agent initialization failed: {e}")))?;
        let agents = Arc::new(agents);

        let retriever_ids = agents.subsession_ids();
        db.set_agent_subsession_ids(
            &session_id,
            retriever_ids.get(&AgentKind::RetrieverA).cloned().flatten().as_deref(),
            retriever_ids.get(&AgentKind::Learner).cloned().flatten().as_deref(),
        )
        .await?;

        db.set_status(&session_id, OrchestratorStatus::Running, None).await?;

        let window = Arc::new(Mutex::new(SlidingWindow::default()));

        Ok((
            Self {
                db,
                config,
                agents,
                budget,
                window,
                mcp,
                root_cancel: CancellationToken::new(),
            },
            session_id,
        ))
    }

    fn build_epoch(
        &self,
        session_id: SessionId,
        project_slug: String,
        transcript_path: PathBuf,
        last_compact_size: u64,
        control_tx: mpsc::Sender<ControlSignal>,
    ) -> SessionEpoch {
        let cancel = self.root_cancel.child_token();
        let mut tasks = Vec::new();

        let retrieval = self.config.retriever.is_on().then(|| {
            RetrievalCoordinator::new(
                Arc::clone(&self.db),
                Arc::clone(&self.agents),
                Arc::clone(&self.window),
                RetrievalCoordinatorConfig {
                    skip_threshold_chars: self.config.skip_threshold_chars,
                },
            )
        });

        let learner = self.config.learner.is_on().then(|| {
            let mut learner = LearnerPath::new(Arc::clone(&self.agents), self.config.learner_truncate_chars);
            if self.config.learner_batching {
                learner = learner.with_batching(LearnerBatchConfig {
                    min_size: self.config.learner_batch_min_size,
                    max_size: self.config.learner_batch_max_size,
                    max_window: Duration::from_secs(self.config.learner_batch_max_window_secs),
                });
            }
            Arc::new(learner)
        });

        let compactor = self.config.compactor.is_on().then(|| {
            Arc::new(CompactorScheduler::new(
                Arc::clone(&self.db),
                Arc::clone(&self.agents),
                session_id.clone(),
                project_slug.clone(),
                transcript_path.clone(),
                last_compact_size,
            ))
        });

        let curator = self
            .config
            .curator
            .is_on()
            .then(|| Arc::new(CuratorScheduler::new(Arc::clone(&self.agents))));

        let dispatcher = Arc::new(InboxDispatcher::new(
            Arc::clone(&self.db),
            session_id.clone(),
            Duration::from_secs(self.config.poll_interval_secs),
            self.config.claim_batch_size,
            retrieval,
            learner.clone(),
            compactor.clone(),
            curator.clone(),
            control_tx.clone(),
        ));

        {
            let dispatcher = Arc::clone(&dispatcher);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { dispatcher.run(cancel).await }));
        }

        if let Some(compactor) = compactor {
            let cancel = cancel.clone();
            let interval = Duration::from_secs(self.config.compactor_interval_secs);
            tasks.push(tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);
                timer.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = timer.tick() => {
                            if let Err(e) = compactor.maybe_tick().await {
                                tracing::error!(error = %e, "compactor tick failed");
                            }
                        }
                    }
                }
            }));
        }

        if let Some(curator) = curator {
            let cancel = cancel.clone();
            let interval = Duration::from_secs(self.config.curator_interval_secs);
            tasks.push(tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);
                timer.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = timer.tick() => {
                            if let Err(e) = curator.run().await {
                                tracing::error!(error = %e, "curator tick failed");
                            }
                        }
                    }
                }
            }));
        }

        // A lone buffered observation has no later `tool_use` arrival to
        // re-check `should_flush` against, so the max-window trigger needs
        // its own ticker rather than piggybacking on message routing
        // (spec.md §4.5 flush trigger: "elapsed max-window since first
        // buffered item").
        if self.config.learner_batching {
            if let Some(learner) = &learner {
                let learner = Arc::clone(learner);
                let db = Arc::clone(&self.db);
                let cancel = cancel.clone();
                tasks.push(tokio::spawn(async move {
                    let mut timer = tokio::time::interval(Duration::from_secs(1));
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = timer.tick() => {
                                let (outcome, ids) = learner.poll_window_flush().await;
                                apply_learner_outcome(db.as_ref(), outcome, ids, "max_window").await;
                            }
                        }
                    }
                }));
            }
        }

        SessionEpoch { cancel, tasks, learner }
    }

    fn spawn_heartbeat(&self, session_id: SessionId, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let db = Arc::clone(&self.db);
        let interval = Duration::from_secs(self.config.heartbeat_interval_secs);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        if let Err(e) = db.advance_heartbeat(&session_id).await {
                            tracing::warn!(error = %e, "failed to advance heartbeat");
                        }
                    }
                }
            }
        })
    }

    fn spawn_watchdog(&self, cancel: CancellationToken, control_tx: mpsc::Sender<ControlSignal>) -> Option<tokio::task::JoinHandle<()>> {
        let parent_pid = self.config.parent_pid?;
        Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        if !parent_is_alive(parent_pid) {
                            tracing::warn!(parent_pid, "parent process no longer alive");
                            let _ = control_tx
                                .send(ControlSignal::Shutdown(ShutdownCause::ParentGone))
                                .await;
                            break;
                        }
                    }
                }
            }
        }))
    }

    fn spawn_signal_listener(&self, control_tx: mpsc::Sender<ControlSignal>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to install SIGTERM handler");
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        let _ = control_tx.send(ControlSignal::Shutdown(ShutdownCause::Signal("SIGINT"))).await;
                    }
                    _ = sigterm.recv() => {
                        let _ = control_tx.send(ControlSignal::Shutdown(ShutdownCause::Signal("SIGTERM"))).await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = control_tx.send(ControlSignal::Shutdown(ShutdownCause::Signal("CTRL_C"))).await;
                }
            }
        })
    }

    /// Run the full supervised lifecycle to completion, returning the exit
    /// code to use (spec.md §6.1: "0 normal shutdown; 1 fatal").
    pub async fn run(mut self, mut session_id: SessionId) -> i32 {
        let (control_tx, mut control_rx) = mpsc::channel(32);

        let mut epoch = self.build_epoch(
            session_id.clone(),
            self.config.project_slug.clone(),
            self.config.transcript_path.clone(),
            self.config.last_compact_size,
            control_tx.clone(),
        );
        let mut heartbeat = self.spawn_heartbeat(session_id.clone(), epoch.cancel.clone());
        let watchdog = self.spawn_watchdog(self.root_cancel.clone(), control_tx.clone());
        let _signal_listener = self.spawn_signal_listener(control_tx.clone());

        // Nothing else feeds `control_tx` when the session budget crosses
        // its cap mid-call (spec.md §4.9), so this ticker is what actually
        // makes the exhausted check run instead of waiting on a signal that
        // never arrives.
        let mut budget_check = tokio::time::interval(Duration::from_secs(1));

        let cause = loop {
            if self.budget.session_exhausted() {
                break ShutdownCause::BudgetExhausted;
            }

            tokio::select! {
                _ = budget_check.tick() => continue,
                signal = control_rx.recv() => match signal {
                    Some(ControlSignal::Shutdown(cause)) => break cause,
                    Some(ControlSignal::SessionReset(payload)) => {
                        match self.handle_session_reset(&session_id, &payload).await {
                            Ok(new_id) => {
                                heartbeat.abort();
                                epoch.cancel_and_join().await;

                                session_id = new_id.clone();
                                epoch = self.build_epoch(
                                    new_id.clone(),
                                    self.config.project_slug.clone(),
                                    PathBuf::from(&payload.transcript_path),
                                    0,
                                    control_tx.clone(),
                                );
                                heartbeat = self.spawn_heartbeat(new_id, epoch.cancel.clone());
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "session_reset handoff failed");
                            }
                        }
                    }
                    None => break ShutdownCause::Error("control channel closed".into()),
                },
            }
        };

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        heartbeat.abort();

        self.shutdown(&session_id, epoch, cause.clone()).await;

        match cause {
            ShutdownCause::Signal(_) | ShutdownCause::InboxSessionEnd | ShutdownCause::ExternalStatusWrite => 0,
            _ => 1,
        }
    }

    /// **handleSessionReset(newSessionId, newTranscriptPath)** (spec.md
    /// §4.1): atomically renames ownership; the old record transitions
    /// clearing → injected.
    async fn handle_session_reset(
        &self,
        old_session_id: &SessionId,
        payload: &SessionResetPayload,
    ) -> Result<SessionId, OrchestratorError> {
        let new_session_id = SessionId::new(payload.new_session_id.clone())?;

        self.db.set_status(old_session_id, OrchestratorStatus::Clearing, None).await?;
        self.db.rebind_session(old_session_id, &new_session_id).await?;
        self.window.lock().await.clear();

        tracing::info!(
            old = %old_session_id,
            new = %new_session_id,
            "session reset handoff complete"
        );

        Ok(new_session_id)
    }

    /// Force-flush any batch the learner has buffered (spec.md §4.5 flush
    /// trigger: "shutdown"), applying the resulting outcome directly since
    /// the dispatcher loop that normally does this has already been
    /// cancelled by the time `shutdown` runs.
    async fn flush_learner(&self, learner: &LearnerPath) {
        let (outcome, ids) = learner.flush_pending().await;
        apply_learner_outcome(self.db.as_ref(), outcome, ids, "shutdown").await;
    }

    /// **shutdown(cause)** (spec.md §4.1): idempotent transition to
    /// stopping/stopped, drains in-flight routing, fails pending rows.
    async fn shutdown(&mut self, session_id: &SessionId, epoch: SessionEpoch, cause: ShutdownCause) {
        tracing::info!(cause = %cause, "shutting down");

        let _ = self.db.set_status(session_id, OrchestratorStatus::Stopping, None).await;

        let learner = epoch.learner.clone();
        epoch.cancel_and_join().await;

        if let Some(learner) = learner {
            self.flush_learner(&learner).await;
        }

        let error_message = match &cause {
            ShutdownCause::Error(e) => Some(e.clone()),
            _ => None,
        };

        if let Err(e) = self.db.fail_all_pending(session_id).await {
            tracing::warn!(error = %e, "failed to fail pending inbox rows during shutdown");
        }

        let final_status = if error_message.is_some() {
            OrchestratorStatus::Crashed
        } else {
            OrchestratorStatus::Stopped
        };
        let _ = self.db.set_status(session_id, final_status, error_message.as_deref()).await;

        if let Some(mcp) = self.mcp.take() {
            mcp.shutdown().await;
        }

        self.root_cancel.cancel();
    }
}

#[cfg(unix)]
fn parent_is_alive(pid: u32) -> bool {
    // `kill(pid, 0)` sends no signal; it only reports whether the process
    // exists and is signalable (spec.md §6.1 `--parent-pid` watchdog).
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn parent_is_alive(_pid: u32) -> bool {
    true
}
