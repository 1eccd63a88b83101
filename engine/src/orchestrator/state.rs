//! Orchestration states and their transitions

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::db::TaskStatus;

/// Current position in the orchestration state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationState {
    Init,
    Planning,
    Coding,
    Reviewing,
    Auditing,
    Testing,
    Reflecting,
    Success,
    Failed,
    Paused,
}

impl OrchestrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationState::Init => "init",
            OrchestrationState::Planning => "planning",
            OrchestrationState::Coding => "coding",
            OrchestrationState::Reviewing => "reviewing",
            OrchestrationState::Auditing => "auditing",
            OrchestrationState::Testing => "testing",
            OrchestrationState::Reflecting => "reflecting",
            OrchestrationState::Success => "success",
            OrchestrationState::Failed => "failed",
            OrchestrationState::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationState::Success | OrchestrationState::Failed | OrchestrationState::Paused
        )
    }

    /// Task row status for a terminal state
    pub fn task_status(&self) -> TaskStatus {
        match self {
            OrchestrationState::Success => TaskStatus::Success,
            OrchestrationState::Failed => TaskStatus::Failed,
            OrchestrationState::Paused => TaskStatus::Paused,
            OrchestrationState::Init => TaskStatus::Pending,
            _ => TaskStatus::Running,
        }
    }
}

impl fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which optional phases run between coding and testing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhasePlan {
    pub review: bool,
    pub audit: bool,
}

impl PhasePlan {
    /// State entered after `state` completes
    ///
    /// `tests_passed` only matters when leaving `Testing`. Terminal states
    /// map to themselves.
    pub fn next(&self, state: OrchestrationState, tests_passed: bool) -> OrchestrationState {
        use OrchestrationState::*;

        match state {
            Init => Planning,
            Planning => Coding,
            Coding if self.review => Reviewing,
            Coding if self.audit => Auditing,
            Coding => Testing,
            Reviewing if self.audit => Auditing,
            Reviewing => Testing,
            Auditing => Testing,
            Testing if tests_passed => Success,
            Testing => Reflecting,
            Reflecting => Coding,
            Success | Failed | Paused => state,
        }
    }
}
