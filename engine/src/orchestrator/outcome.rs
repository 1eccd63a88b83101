//! Phase and run outcomes

use sdk::AgentError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::OrchestrationState;

/// Result of dispatching one phase
///
/// A recoverable agent failure is a value here, not an error: the iteration
/// is wasted and the loop moves on. Broken invariants never reach this type,
/// they propagate as [`sdk::EngineError`].
#[derive(Debug)]
pub enum PhaseOutcome {
    /// The phase completed and the machine moves to the carried state
    Advanced(OrchestrationState),

    /// The agent failed in a way the next iteration may recover from
    TransientError(AgentError),
}

/// Final report of one orchestration run
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    pub task_id: String,
    pub success: bool,
    pub status: OrchestrationState,
    pub iterations: u32,
    pub code_files: BTreeMap<String, String>,
    pub workspace: PathBuf,
    pub message: String,
}
