//! Curator scheduler (spec.md §4.7): periodic maintenance runs plus
//! on-demand `curator_trigger`, singleton per kind.

use std::sync::Arc;

use crate::agent::{AgentKind, AgentSessionManager};
use crate::error::{AgentError, OrchestratorError};

const MAINTENANCE_PROMPT: &str = "\
Run routine memory maintenance: merge duplicate entries, archive stale ones, \
detect contradictions between stored facts, and consolidate repeated patterns. \
Use the available memory tools directly; report a brief summary of what changed.";

/// Fires the Curator agent on a timer or on demand (spec.md §4.7). The
/// Curator is a singleton per kind — [`crate::agent::AgentSessionManager`]'s
/// busy flag already enforces non-reentrancy, so this scheduler only decides
/// *when* to call, not whether a call is safe to start.
pub struct CuratorScheduler {
    agents: Arc<AgentSessionManager>,
}

impl CuratorScheduler {
    pub fn new(agents: Arc<AgentSessionManager>) -> Self {
        Self { agents }
    }

    /// Run one maintenance pass, whether fired by the interval timer or by
    /// an explicit `curator_trigger` message.
    pub async fn run(&self) -> Result<(), OrchestratorError> {
        match self.agents.call(AgentKind::Curator, MAINTENANCE_PROMPT).await {
            Ok(summary) => {
                tracing::info!(summary = %summary, "curator maintenance run complete");
                Ok(())
            }
            Err(AgentError::Busy { .. }) => {
                // Busy-queue policy (spec.md §5 table): skip, wait for next
                // interval.
                tracing::debug!("curator busy, skipping this tick");
                Ok(())
            }
            Err(e) => Err(OrchestratorError::Agent(e)),
        }
    }
}
