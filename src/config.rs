//! CLI configuration surface (spec.md §6.1), loaded via `clap` derive with
//! environment fallback, matching the teacher's `src/cli/config.rs` precedent
//! of layering configuration sources rather than hand-rolling `env::var`
//! parsing at each call site.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use rust_decimal::Decimal;

/// Enables or disables an optional agent kind from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    pub fn is_on(&self) -> bool {
        matches!(self, Toggle::On)
    }
}

/// Per-session orchestrator configuration (spec.md §6.1, bit-exact flag set).
#[derive(Debug, Parser, Clone)]
#[command(name = "cogd", version, about = "Per-session cognitive-agent orchestrator")]
pub struct OrchestratorConfig {
    #[arg(long, env = "COGD_SESSION_ID")]
    pub session_id: String,

    #[arg(long, env = "COGD_CWD")]
    pub cwd: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "on")]
    pub retriever: Toggle,

    #[arg(long, value_enum, default_value = "on")]
    pub learner: Toggle,

    #[arg(long, value_enum, default_value = "on")]
    pub compactor: Toggle,

    #[arg(long, value_enum, default_value = "off")]
    pub curator: Toggle,

    #[arg(long, env = "COGD_PROJECT_SLUG")]
    pub project_slug: String,

    #[arg(long, env = "COGD_TRANSCRIPT_PATH")]
    pub transcript_path: PathBuf,

    #[arg(long, default_value_t = 0)]
    pub last_compact_size: u64,

    #[arg(long, default_value = "0.50")]
    pub retriever_a_budget: Decimal,

    #[arg(long, default_value = "0.50")]
    pub retriever_b_budget: Decimal,

    #[arg(long, default_value = "0.50")]
    pub learner_budget: Decimal,

    #[arg(long, default_value = "1.00")]
    pub compactor_budget: Decimal,

    #[arg(long, default_value = "1.00")]
    pub curator_budget: Decimal,

    #[arg(long, default_value = "20.00")]
    pub session_budget: Decimal,

    #[arg(long)]
    pub parent_pid: Option<u32>,

    /// Database connection string (not a spec.md flag; ambient stack
    /// configuration supplied via environment, matching the teacher's
    /// `dotenvy`-backed `DATABASE_URL` convention).
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    /// Inbox dispatcher poll interval in seconds (spec.md §4.3: "default two
    /// seconds").
    #[arg(long, default_value_t = 2)]
    pub poll_interval_secs: u64,

    /// Heartbeat advance interval in seconds.
    #[arg(long, default_value_t = 10)]
    pub heartbeat_interval_secs: u64,

    /// Compactor tick interval in seconds (spec.md §4.6: "default ~60s").
    #[arg(long, default_value_t = 60)]
    pub compactor_interval_secs: u64,

    /// Curator tick interval in seconds (spec.md §4.7: "default six hours").
    #[arg(long, default_value_t = 6 * 60 * 60)]
    pub curator_interval_secs: u64,

    /// Zombie-detector staleness window in seconds (spec.md §9 open
    /// question: "left configurable").
    #[arg(long, default_value_t = 30)]
    pub heartbeat_staleness_secs: i64,

    /// Max rows claimed per dispatcher tick (spec.md §4.3: "default 10").
    #[arg(long, default_value_t = 10)]
    pub claim_batch_size: i64,

    /// Minimum text length a retriever result must have to count as context
    /// rather than SKIP (spec.md §4.4: "default ~20 characters").
    #[arg(long, default_value_t = 20)]
    pub skip_threshold_chars: usize,

    /// Max characters of tool_use input/response forwarded to the learner
    /// prompt (spec.md §4.5: "default ~2,000 characters each").
    #[arg(long, default_value_t = 2000)]
    pub learner_truncate_chars: usize,

    /// Enable bounded learner batching (spec.md §4.5 "Optional batching").
    #[arg(long, default_value_t = false)]
    pub learner_batching: bool,

    #[arg(long, default_value_t = 1)]
    pub learner_batch_min_size: usize,

    #[arg(long, default_value_t = 8)]
    pub learner_batch_max_size: usize,

    #[arg(long, default_value_t = 30)]
    pub learner_batch_max_window_secs: u64,

    /// Max agent turns per call, enforced by the agent SDK (spec.md §5).
    #[arg(long, default_value_t = 12)]
    pub max_turns: u32,

    /// MCP memory toolserver executable (spec.md §6.3).
    #[arg(long, env = "COGD_MCP_TOOLSERVER_PATH")]
    pub mcp_toolserver_path: PathBuf,
}

impl OrchestratorConfig {
    pub fn working_dir(&self) -> PathBuf {
        self.cwd
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        OrchestratorConfig::command().debug_assert();
    }

    #[test]
    fn parses_minimal_required_flags() {
        let cfg = OrchestratorConfig::parse_from([
            "cogd",
            "--session-id=s1",
            "--project-slug=proj",
            "--transcript-path=/tmp/t.jsonl",
            "--database-url=postgres://localhost/cogd",
            "--mcp-toolserver-path=/usr/local/bin/mcp-memory",
        ]);
        assert_eq!(cfg.session_id, "s1");
        assert!(cfg.retriever.is_on());
        assert!(!cfg.curator.is_on());
    }
}
