//! Error taxonomy for the orchestrator runtime.
//!
//! Mirrors the propagation policy: routing tasks recover [`AgentError`] and
//! [`DatabaseError`] locally (the dispatcher converts them into a safe
//! inbox/outbox transition), while [`OrchestratorError`]'s fatal variants
//! reach the lifecycle controller and become a `crashed` status.

use thiserror::Error;

/// Errors from the database gateway.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("pool error: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("row not found")]
    NotFound,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("migration error: {0}")]
    Migration(String),
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        DatabaseError::Pool(e.to_string())
    }
}

impl From<deadpool_postgres::CreatePoolError> for DatabaseError {
    fn from(e: deadpool_postgres::CreatePoolError) -> Self {
        DatabaseError::Pool(e.to_string())
    }
}

/// Errors from an agent subsession call (LLM backend, MCP tool dispatch).
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent {kind} is busy")]
    Busy { kind: String },

    #[error("agent {kind} returned a non-success terminal response: {reason}")]
    Terminal { kind: String, reason: String },

    #[error("agent {kind} stream ended unexpectedly")]
    StreamEnded { kind: String },

    #[error("failed to initialize agent {kind}: {reason}")]
    InitFailed { kind: String, reason: String },

    #[error(transparent)]
    Budget(#[from] BudgetExhausted),
}

/// Raised when a spending cap is hit. Per-call caps are recovered like any
/// other [`AgentError`]; per-session caps escalate to a lifecycle shutdown.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BudgetExhausted {
    #[error("per-call budget exhausted")]
    PerCall,
    #[error("per-session budget exhausted")]
    PerSession,
}

/// Top-level orchestrator error taxonomy (spec.md §7).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("initialization error: {0}")]
    Init(String),

    #[error("transient database error: {0}")]
    TransientDb(#[from] DatabaseError),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("budget exhausted: {0}")]
    BudgetExhausted(#[from] BudgetExhausted),

    #[error("cancellation requested: {0}")]
    Cancelled(String),
}
