//! PostgreSQL implementation of the [`Database`] gateway, modeled on the
//! teacher's `src/history/store.rs` (`deadpool-postgres` pool, parameterized
//! queries, `Store::new`/`Store::conn` shape).

use async_trait::async_trait;
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::NoTls;

use crate::db::{Database, ZombieDetector};
use crate::error::DatabaseError;
use crate::types::{
    CognitiveInboxMessage, InboxStatus, OrchestratorRecord, OrchestratorStatus,
    RetrievalOutboxRecord, SessionId, SessionStateRecord,
};

/// Thin wrapper around a single connection pool per orchestrator process
/// (spec.md §4.8).
pub struct PostgresGateway {
    pool: Pool,
}

impl PostgresGateway {
    /// Connect and verify the pool is reachable. Callers that cannot reach
    /// the database within a bounded window should treat this as
    /// [`crate::error::OrchestratorError::Init`] (spec.md §4.1).
    ///
    /// A per-session orchestrator process only ever needs a handful of
    /// concurrent connections (dispatcher tick, timers, routing tasks);
    /// `pool_size` defaults to a small fixed value rather than growing with
    /// CPU count.
    pub async fn connect(database_url: &str, pool_size: usize) -> Result<Self, DatabaseError> {
        let mut cfg = Config::new();
        cfg.url = Some(database_url.to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: pool_size,
            ..Default::default()
        });

        let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Construct from an already-built pool (used by tests wiring a
    /// testcontainers-backed database).
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    /// Apply embedded schema migrations (spec.md [EXPANDED]). Call once at
    /// startup before any other gateway method; safe to call on every
    /// process start since `refinery` tracks applied versions itself.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.conn().await?;
        super::migrations::run(&mut conn).await
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }

    /// Expose the pool for integration tests that need to set up rows or
    /// corrupt state outside the gateway's own API surface.
    #[doc(hidden)]
    pub fn pool_for_tests(&self) -> Pool {
        self.pool.clone()
    }
}

fn row_to_inbox_message(row: &tokio_postgres::Row) -> CognitiveInboxMessage {
    let status_str: String = row.get("status");
    CognitiveInboxMessage {
        id: row.get("id"),
        session_id: SessionId::new(row.get::<_, String>("session_id"))
            .expect("session_id stored in db is never empty"),
        message_type: row.get("message_type"),
        payload: row.get("payload"),
        status: match status_str.as_str() {
            "pending" => InboxStatus::Pending,
            "processing" => InboxStatus::Processing,
            "completed" => InboxStatus::Completed,
            _ => InboxStatus::Failed,
        },
        created_at: row.get("created_at"),
        processed_at: row.get("processed_at"),
    }
}

fn row_to_record(row: &tokio_postgres::Row) -> OrchestratorRecord {
    let status_str: String = row.get("status");
    OrchestratorRecord {
        session_id: SessionId::new(row.get::<_, String>("session_id"))
            .expect("session_id stored in db is never empty"),
        pid: row.get("pid"),
        retriever_enabled: row.get("retriever_enabled"),
        learner_enabled: row.get("learner_enabled"),
        status: OrchestratorStatus::from_db_str(&status_str).unwrap_or(OrchestratorStatus::Crashed),
        started_at: row.get("started_at"),
        last_heartbeat_at: row.get("last_heartbeat_at"),
        stopped_at: row.get("stopped_at"),
        error_message: row.get("error_message"),
        retriever_session_id: row.get("retriever_session_id"),
        learner_session_id: row.get("learner_session_id"),
    }
}

#[async_trait]
impl Database for PostgresGateway {
    async fn upsert_starting(
        &self,
        session_id: &SessionId,
        pid: i64,
        retriever_enabled: bool,
        learner_enabled: bool,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO orchestrator_state
                (session_id, pid, retriever_enabled, learner_enabled, status, started_at, last_heartbeat_at)
            VALUES ($1, $2, $3, $4, 'starting', NOW(), NOW())
            ON CONFLICT (session_id) DO UPDATE SET
                pid = EXCLUDED.pid,
                retriever_enabled = EXCLUDED.retriever_enabled,
                learner_enabled = EXCLUDED.learner_enabled,
                status = 'starting',
                started_at = NOW(),
                last_heartbeat_at = NOW(),
                stopped_at = NULL,
                error_message = NULL
            "#,
            &[&session_id.as_str(), &pid, &retriever_enabled, &learner_enabled],
        )
        .await?;
        Ok(())
    }

    async fn set_status(
        &self,
        session_id: &SessionId,
        status: OrchestratorStatus,
        error_message: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let status_str = status.as_db_str();
        let terminal = status.is_terminal();
        conn.execute(
            r#"
            UPDATE orchestrator_state
            SET status = $2,
                error_message = $3,
                stopped_at = CASE WHEN $4 THEN NOW() ELSE stopped_at END
            WHERE session_id = $1
            "#,
            &[&session_id.as_str(), &status_str, &error_message, &terminal],
        )
        .await?;
        Ok(())
    }

    async fn set_agent_subsession_ids(
        &self,
        session_id: &SessionId,
        retriever_session_id: Option<&str>,
        learner_session_id: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            UPDATE orchestrator_state
            SET retriever_session_id = COALESCE($2, retriever_session_id),
                learner_session_id = COALESCE($3, learner_session_id)
            WHERE session_id = $1
            "#,
            &[&session_id.as_str(), &retriever_session_id, &learner_session_id],
        )
        .await?;
        Ok(())
    }

    async fn advance_heartbeat(&self, session_id: &SessionId) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE orchestrator_state SET last_heartbeat_at = NOW() WHERE session_id = $1",
            &[&session_id.as_str()],
        )
        .await?;
        Ok(())
    }

    async fn get_record(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<OrchestratorRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM orchestrator_state WHERE session_id = $1",
                &[&session_id.as_str()],
            )
            .await?;
        Ok(row.as_ref().map(row_to_record))
    }

    async fn rebind_session(
        &self,
        old_session_id: &SessionId,
        new_session_id: &SessionId,
    ) -> Result<(), DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        tx.execute(
            r#"
            INSERT INTO orchestrator_state
                (session_id, pid, retriever_enabled, learner_enabled, status,
                 started_at, last_heartbeat_at, retriever_session_id, learner_session_id)
            SELECT $2, pid, retriever_enabled, learner_enabled, 'running',
                   started_at, NOW(), retriever_session_id, learner_session_id
            FROM orchestrator_state WHERE session_id = $1
            ON CONFLICT (session_id) DO UPDATE SET
                pid = EXCLUDED.pid,
                status = 'running',
                last_heartbeat_at = NOW(),
                retriever_session_id = EXCLUDED.retriever_session_id,
                learner_session_id = EXCLUDED.learner_session_id
            "#,
            &[&old_session_id.as_str(), &new_session_id.as_str()],
        )
        .await?;

        tx.execute(
            "UPDATE orchestrator_state SET status = 'injected', stopped_at = NOW() WHERE session_id = $1",
            &[&old_session_id.as_str()],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn claim_batch(
        &self,
        session_id: &SessionId,
        limit: i64,
    ) -> Result<Vec<CognitiveInboxMessage>, DatabaseError> {
        let conn = self.conn().await?;
        // SKIP LOCKED ensures the claim is exclusive across competing
        // dispatchers without blocking on other sessions' in-flight claims
        // (spec.md §4.3 step 1).
        let rows = conn
            .query(
                r#"
                UPDATE cognitive_inbox
                SET status = 'processing'
                WHERE id IN (
                    SELECT id FROM cognitive_inbox
                    WHERE session_id = $1 AND status = 'pending'
                    ORDER BY created_at ASC, id ASC
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, session_id, message_type, payload, status, created_at, processed_at
                "#,
                &[&session_id.as_str(), &limit],
            )
            .await?;

        Ok(rows.iter().map(row_to_inbox_message).collect())
    }

    async fn mark_completed(&self, id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE cognitive_inbox SET status = 'completed', processed_at = NOW() WHERE id = $1",
            &[&id],
        )
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE cognitive_inbox SET status = 'failed', processed_at = NOW() WHERE id = $1",
            &[&id],
        )
        .await?;
        Ok(())
    }

    async fn requeue(&self, id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE cognitive_inbox SET status = 'pending', processed_at = NULL WHERE id = $1",
            &[&id],
        )
        .await?;
        Ok(())
    }

    async fn fail_all_pending(&self, session_id: &SessionId) -> Result<u64, DatabaseError> {
        let conn = self.conn().await?;
        let affected = conn
            .execute(
                r#"
                UPDATE cognitive_inbox
                SET status = 'failed', processed_at = NOW()
                WHERE session_id = $1 AND status IN ('pending', 'processing')
                "#,
                &[&session_id.as_str()],
            )
            .await?;
        Ok(affected)
    }

    async fn write_outbox(&self, record: &RetrievalOutboxRecord) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO retrieval_inbox
                (session_id, prompt_hash, context_type, context_text, relevance_score, status, expires_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', NOW() + INTERVAL '1 hour')
            "#,
            &[
                &record.session_id.as_str(),
                &record.prompt_hash,
                &record.context_type.as_db_str(),
                &record.context_text,
                &record.relevance_score,
            ],
        )
        .await?;
        Ok(())
    }

    async fn latest_session_state(
        &self,
        session_id: &SessionId,
        project_slug: &str,
    ) -> Result<Option<SessionStateRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                r#"
                SELECT session_id, project_slug, state_text, token_estimate, version, updated_at
                FROM session_state
                WHERE session_id = $1 AND project_slug = $2
                ORDER BY version DESC
                LIMIT 1
                "#,
                &[&session_id.as_str(), &project_slug],
            )
            .await?;

        Ok(row.map(|row| SessionStateRecord {
            session_id: SessionId::new(row.get::<_, String>("session_id"))
                .expect("session_id stored in db is never empty"),
            project_slug: row.get("project_slug"),
            state_text: row.get("state_text"),
            token_estimate: row.get("token_estimate"),
            version: row.get("version"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn insert_session_state(
        &self,
        record: &SessionStateRecord,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO session_state
                (session_id, project_slug, state_text, token_estimate, version, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (session_id, project_slug, version) DO NOTHING
            "#,
            &[
                &record.session_id.as_str(),
                &record.project_slug,
                &record.state_text,
                &record.token_estimate,
                &record.version,
            ],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ZombieDetector for PostgresGateway {
    async fn detect_and_mark_zombies(
        &self,
        staleness: chrono::Duration,
    ) -> Result<Vec<SessionId>, DatabaseError> {
        let conn = self.conn().await?;
        let staleness_secs = staleness.num_seconds() as f64;
        let rows = conn
            .query(
                r#"
                UPDATE orchestrator_state
                SET status = 'crashed', error_message = 'heartbeat stale', stopped_at = NOW()
                WHERE status = 'running'
                  AND last_heartbeat_at < NOW() - make_interval(secs => $1)
                RETURNING session_id
                "#,
                &[&staleness_secs],
            )
            .await?;

        rows.iter()
            .map(|row| {
                SessionId::new(row.get::<_, String>("session_id"))
                    .map_err(|e| DatabaseError::Decode(e.to_string()))
            })
            .collect()
    }
}
