//! MCP memory toolserver process (spec.md §6.3): spawned as a child process
//! with stdio transport. The orchestrator only spawns it and advertises its
//! tools to agents — it never parses the MCP protocol itself, matching
//! spec.md §1's "out of scope" boundary for the toolserver's internals.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::OrchestratorError;

/// A running MCP toolserver child process, addressable over its stdio pipes.
pub struct McpToolserver {
    child: Child,
    executable: PathBuf,
}

impl McpToolserver {
    /// Spawn the toolserver, passing `working_dir` as its environment
    /// (spec.md §6.3: "the working directory of the toolserver's script").
    pub fn spawn(executable: &Path, working_dir: &Path) -> Result<Self, OrchestratorError> {
        let child = Command::new(executable)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                OrchestratorError::Init(format!(
                    "failed to spawn MCP toolserver {}: {e}",
                    executable.display()
                ))
            })?;

        tracing::info!(executable = %executable.display(), "spawned MCP toolserver");

        Ok(Self {
            child,
            executable: executable.to_path_buf(),
        })
    }

    /// `true` if the child process has exited on its own.
    pub async fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Terminate the toolserver (spec.md §4.1 shutdown: all subprocesses
    /// wind down with the orchestrator).
    pub async fn shutdown(mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::warn!(error = %e, "failed to signal MCP toolserver shutdown");
        }
        let _ = self.child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_fails_for_missing_executable() {
        let result = McpToolserver::spawn(
            Path::new("/nonexistent/mcp-memory-toolserver"),
            Path::new("/tmp"),
        );
        assert!(result.is_err());
    }
}
