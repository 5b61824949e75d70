//! Entrypoint: parse configuration, connect to Postgres, run migrations,
//! start the lifecycle controller, and run it to completion.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cogd::agent::RigAgentBackend;
use cogd::config::OrchestratorConfig;
use cogd::db::PostgresGateway;
use cogd::lifecycle::LifecycleController;
use tracing_subscriber::EnvFilter;

/// Small fixed pool; a per-session orchestrator never needs more than a
/// handful of concurrent connections (dispatcher tick, timers, routing
/// tasks) (spec.md §4.8).
const DB_POOL_SIZE: usize = 5;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let exit_code = match run().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = ?e, "orchestrator failed to start");
            1
        }
    };

    std::process::exit(exit_code);
}

async fn run() -> anyhow::Result<i32> {
    let config = OrchestratorConfig::parse();
    let model = std::env::var("COGD_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

    let db = Arc::new(
        PostgresGateway::connect(&config.database_url, DB_POOL_SIZE)
            .await
            .context("connecting to postgres")?,
    );
    db.run_migrations().await.context("running schema migrations")?;

    let backend = Arc::new(RigAgentBackend::from_env(&model).context("initializing llm backend")?);

    let (controller, session_id) = LifecycleController::start(db, config, backend)
        .await
        .context("starting lifecycle controller")?;

    Ok(controller.run(session_id).await)
}
