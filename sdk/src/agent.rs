//! Agent trait and per-phase result types
//!
//! This module defines the [`Agent`] trait that every phase worker implements,
//! and the [`PhaseResult`] enum the orchestrator pattern-matches on. Agents are
//! stateless from the orchestrator's point of view: they read the [`Context`]
//! they are given and return new fields, never mutating shared state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::context::Context;
use crate::errors::AgentError;
use crate::types::{PatternMatch, SimilarFailure, TestOutcome};

/// Role an agent plays in the orchestration loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Planner,
    Coder,
    Reviewer,
    Auditor,
    Tester,
    Reflector,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Coder => "coder",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Auditor => "auditor",
            AgentRole::Tester => "tester",
            AgentRole::Reflector => "reflector",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Planner output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanOutcome {
    /// Plan text
    pub plan: String,

    /// Ordered subtasks parsed from the plan
    pub subtasks: Vec<String>,

    /// Third-party packages the solution needs
    pub dependencies: Vec<String>,

    /// Anticipated difficulties
    pub challenges: Vec<String>,

    /// Similar stored solutions consulted while planning
    pub pattern_matches: Vec<PatternMatch>,
}

/// Coder output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeOutcome {
    /// Generated files keyed by path relative to the workspace
    pub code_files: BTreeMap<String, String>,
}

/// Reviewer output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub approved: bool,
    pub critical_issues: Vec<String>,
    pub feedback: String,
}

/// Security auditor output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditOutcome {
    pub passed: bool,
    pub critical_findings: Vec<String>,
    pub report: String,
}

/// Tester output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    /// Test file path relative to the workspace
    pub test_file: String,

    /// Source of the generated test file
    pub test_code: String,

    /// Result of running it
    pub outcome: TestOutcome,
}

/// Reflector output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReflectionOutcome {
    pub error_type: String,
    pub error_signature: String,
    pub full_error: String,
    pub stack_trace: Option<String>,
    pub root_cause: String,
    pub hypothesis: String,
    pub reflection: String,
    pub code_changes: Vec<String>,
    /// Fixed failures with a similar signature, passed through to the context
    pub similar_failures: Vec<SimilarFailure>,
}

/// Typed result of one phase, one variant per phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseResult {
    Planned(PlanOutcome),
    Coded(CodeOutcome),
    Reviewed(ReviewOutcome),
    Audited(AuditOutcome),
    Tested(TestReport),
    Reflected(ReflectionOutcome),
}

impl PhaseResult {
    /// Short tag naming the variant, used in logs and contract errors
    pub fn kind(&self) -> &'static str {
        match self {
            PhaseResult::Planned(_) => "planned",
            PhaseResult::Coded(_) => "coded",
            PhaseResult::Reviewed(_) => "reviewed",
            PhaseResult::Audited(_) => "audited",
            PhaseResult::Tested(_) => "tested",
            PhaseResult::Reflected(_) => "reflected",
        }
    }
}

/// Trait that every phase worker implements
///
/// Each agent exposes one entry point. The orchestrator dispatches to the agent
/// registered for the current phase and expects the matching
/// [`PhaseResult`] variant back.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Role this agent fills
    fn role(&self) -> AgentRole;

    /// Execute one phase against a read-only view of the context
    async fn execute(&self, context: &Context) -> Result<PhaseResult, AgentError>;
}
