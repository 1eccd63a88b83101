//! Structured results exchanged between agents, the sandbox and the learning store

use serde::{Deserialize, Serialize};

/// Outcome of one sandboxed test run
///
/// Infrastructure failures (timeouts, missing interpreter, missing workspace)
/// are reported through this same shape with `passed == false`, so reflection
/// handles them exactly like a failing assertion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestOutcome {
    /// Whether every test passed
    pub passed: bool,

    /// Test file that was executed, relative to the workspace
    pub test_file: Option<String>,

    /// Number of tests collected
    pub total: u32,

    /// Number of passing tests
    pub passed_count: u32,

    /// Number of failing tests
    pub failed_count: u32,

    /// Names of failing tests, when the runner reports them
    pub failed_tests: Vec<String>,

    /// Primary error text
    pub error_message: Option<String>,

    /// Error type token, when known
    pub error_type: Option<String>,

    /// Stack trace or traceback text
    pub stack_trace: Option<String>,

    /// Captured standard output
    pub stdout: String,

    /// Captured standard error
    pub stderr: String,

    /// Combined raw runner output
    pub raw_output: String,

    /// Whether the run hit the execution timeout
    pub timed_out: bool,
}

impl TestOutcome {
    /// Build a failed outcome that never reached the test runner
    pub fn infrastructure_failure(test_file: Option<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            passed: false,
            test_file,
            stderr: message.clone(),
            raw_output: message.clone(),
            error_message: Some(message),
            ..Default::default()
        }
    }
}

/// A previously fixed failure similar to the current one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarFailure {
    pub id: i64,
    pub error_signature: String,
    pub error_type: String,
    pub root_cause: Option<String>,
    pub solution: Option<String>,
    /// Search rank, lower is closer
    pub rank: f64,
}

/// A stored successful solution similar to the current task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub id: i64,
    pub problem_type: String,
    pub description: String,
    pub code_template: String,
    pub test_template: Option<String>,
    pub dependencies: Vec<String>,
    pub usage_count: i64,
    pub success_rate: f64,
    /// Search rank, lower is closer
    pub rank: f64,
}
