//! Error types and handling
//!
//! This module provides the error types shared by the engine and by agent
//! implementations. Every error implements [`ErrorExt`], which gives a short
//! user-facing hint and tells the orchestrator whether the failure can be
//! absorbed (the iteration is wasted and the loop continues) or must propagate.
//!
//! # Taxonomy
//!
//! - [`AgentError`]: failures raised by an agent while executing a phase. All
//!   variants except [`AgentError::Internal`] are transient.
//! - [`EngineError`]: failures of the engine itself (configuration and file system)
//!   and broken phase contracts.

use std::path::PathBuf;
use thiserror::Error;

/// Extension trait for error hints and recoverability
pub trait ErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is a static string that never echoes the raw error payload, so
    /// it is safe to print even when the payload carries model output or paths.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors are absorbed at the phase boundary. Non-recoverable
    /// errors propagate out of the orchestrator.
    fn is_recoverable(&self) -> bool;
}

/// Error raised by an agent while executing one phase
///
/// # Examples
///
/// ```
/// use sdk::errors::{AgentError, ErrorExt};
///
/// let transient = AgentError::Llm("connection reset".to_string());
/// assert!(transient.is_recoverable());
///
/// let bug = AgentError::Internal("planner produced no plan".to_string());
/// assert!(!bug.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("LLM call failed: {0}")]
    Llm(String),

    #[error("LLM call timed out")]
    Timeout,

    #[error("Could not parse agent reply: {0}")]
    InvalidReply(String),

    #[error("Missing context field: {0}")]
    MissingContext(&'static str),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Operation blocked by safety hook: {0}")]
    Blocked(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    /// An agent invariant was broken. This is a bug, not a transient failure.
    #[error("Internal agent error: {0}")]
    Internal(String),
}

impl ErrorExt for AgentError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Llm(_) => "LLM provider unavailable. Check your API keys and network",
            Self::Timeout => "LLM provider took too long to respond. Try again",
            Self::InvalidReply(_) => "The model reply could not be understood. It will be retried",
            Self::MissingContext(_) => "A previous phase did not produce its result yet",
            Self::Sandbox(_) => "Sandboxed execution failed. Check the task workspace",
            Self::Blocked(_) => "A safety hook refused the operation",
            Self::Persistence(_) => "Learning store unavailable. Check the database file",
            Self::Internal(_) => "Internal agent error. Please report this",
        }
    }

    fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }
}

/// Main engine error type
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, ErrorExt};
/// use std::path::PathBuf;
///
/// let error = EngineError::PathCanonicalization(PathBuf::from("~/work"), "not found".into());
/// println!("Hint: {}", error.user_hint());
/// assert!(error.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // File system errors
    #[error("Path canonicalization failed for {0:?}: {1}")]
    PathCanonicalization(PathBuf, String),

    // Orchestration errors
    #[error("Agent for {phase} returned a {received} result")]
    PhaseContract {
        phase: String,
        received: &'static str,
    },

    #[error("Agent failure: {0}")]
    Agent(#[from] AgentError),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::PathCanonicalization(_, _) => "Invalid path specified",
            Self::PhaseContract { .. } => "Internal orchestration error. Please report this",
            Self::Agent(inner) => inner.user_hint(),
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::PhaseContract { .. } => false,
            Self::Agent(inner) => inner.is_recoverable(),
            _ => true,
        }
    }
}
