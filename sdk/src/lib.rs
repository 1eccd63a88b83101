//! Autocoder SDK
//!
//! Shared contract between the orchestration engine and the agents it drives.
//! Agent implementations depend only on this crate: the [`Context`] they read,
//! the [`Agent`] trait they implement and the typed [`PhaseResult`] they return.

/// Agent trait and per-phase result types
pub mod agent;

/// Shared orchestration context
pub mod context;

/// Error types and handling
pub mod errors;

/// Test outcomes and learning-store records
pub mod types;

// Re-export commonly used types
pub use agent::{
    Agent, AgentRole, AuditOutcome, CodeOutcome, PhaseResult, PlanOutcome, ReflectionOutcome,
    ReviewOutcome, TestReport,
};
pub use context::{fields, Context};
pub use errors::{AgentError, EngineError, ErrorExt};
pub use types::{PatternMatch, SimilarFailure, TestOutcome};
