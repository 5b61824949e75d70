//! Database gateway (spec.md §4.8): a thin wrapper around a connection pool
//! exposing exactly the operations the orchestrator needs — atomic batch
//! claim, complete/fail, idempotent upserts, heartbeat, and outbox/session
//! state writes. Schema details beyond these fields are external
//! (spec.md §6.2).

mod migrations;
mod postgres;

pub use postgres::PostgresGateway;

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::types::{
    CognitiveInboxMessage, OrchestratorRecord, RetrievalOutboxRecord, SessionId,
    SessionStateRecord,
};

/// Database gateway trait, mirroring the teacher's `Database` abstraction
/// in `src/db/mod.rs` (one trait, a Postgres implementation, parameterized
/// queries only).
#[async_trait]
pub trait Database: Send + Sync {
    // -- Orchestrator record --

    /// Idempotently upsert the `starting` record for `session_id`
    /// (spec.md §4.1: "idempotently upserts an OrchestratorRecord with
    /// status starting").
    async fn upsert_starting(
        &self,
        session_id: &SessionId,
        pid: i64,
        retriever_enabled: bool,
        learner_enabled: bool,
    ) -> Result<(), DatabaseError>;

    async fn set_status(
        &self,
        session_id: &SessionId,
        status: crate::types::OrchestratorStatus,
        error_message: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn set_agent_subsession_ids(
        &self,
        session_id: &SessionId,
        retriever_session_id: Option<&str>,
        learner_session_id: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn advance_heartbeat(&self, session_id: &SessionId) -> Result<(), DatabaseError>;

    async fn get_record(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<OrchestratorRecord>, DatabaseError>;

    /// Re-key the orchestrator record from `old_session_id` to
    /// `new_session_id`, transitioning the old row to `injected`
    /// (spec.md §4.1 `handleSessionReset`).
    async fn rebind_session(
        &self,
        old_session_id: &SessionId,
        new_session_id: &SessionId,
    ) -> Result<(), DatabaseError>;

    // -- Cognitive inbox --

    /// Atomically claim up to `limit` pending rows for `session_id` in FIFO
    /// order, transitioning them to `processing` (spec.md §4.3 step 1).
    async fn claim_batch(
        &self,
        session_id: &SessionId,
        limit: i64,
    ) -> Result<Vec<CognitiveInboxMessage>, DatabaseError>;

    async fn mark_completed(&self, id: i64) -> Result<(), DatabaseError>;

    async fn mark_failed(&self, id: i64) -> Result<(), DatabaseError>;

    /// Re-mark a busy-rejected row back to `pending` (spec.md §4.3 step 3,
    /// re-queue policy).
    async fn requeue(&self, id: i64) -> Result<(), DatabaseError>;

    /// Mark every pending/processing row for `session_id` as `failed`
    /// (spec.md §4.1 `shutdown`).
    async fn fail_all_pending(&self, session_id: &SessionId) -> Result<u64, DatabaseError>;

    // -- Retrieval outbox --

    async fn write_outbox(&self, record: &RetrievalOutboxRecord) -> Result<(), DatabaseError>;

    // -- Session state --

    async fn latest_session_state(
        &self,
        session_id: &SessionId,
        project_slug: &str,
    ) -> Result<Option<SessionStateRecord>, DatabaseError>;

    async fn insert_session_state(&self, record: &SessionStateRecord)
    -> Result<(), DatabaseError>;
}

/// Standalone zombie detector (spec.md §4.11/[EXPANDED]): marks rows whose
/// heartbeat has gone stale as `crashed`. Not spawned by the orchestrator
/// itself — it inherently must run from outside a process that may have
/// died — but its query shape is part of this crate's contract.
#[async_trait]
pub trait ZombieDetector: Send + Sync {
    async fn detect_and_mark_zombies(
        &self,
        staleness: chrono::Duration,
    ) -> Result<Vec<SessionId>, DatabaseError>;
}
