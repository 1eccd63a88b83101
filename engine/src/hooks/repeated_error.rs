//! Repeated error guard
//!
//! Pre-hook for iteration starts. Normalizes the previous iteration's error and
//! warns when the same error keeps coming back, which usually means the repair
//! strategy needs to change.

use regex::Regex;
use serde_json::Value;
use std::collections::VecDeque;

use super::{ExecutionHook, HookContext, HookError, HookOperation, HookPhase, HookResponse};

/// Default number of prior occurrences that triggers a warning
pub const DEFAULT_MAX_SAME_ERROR: usize = 3;

/// Number of recent errors compared against
const HISTORY_WINDOW: usize = 5;

/// Characters of the normalized error kept for comparison
const NORMALIZED_LENGTH: usize = 200;

/// Warns when the same normalized error recurs across iterations
pub struct RepeatedErrorHook {
    max_same_error: usize,
    history: VecDeque<String>,
    line_numbers: Regex,
    quoted_files: Regex,
    path_locations: Regex,
}

impl RepeatedErrorHook {
    pub fn new(max_same_error: usize) -> Result<Self, HookError> {
        Ok(Self {
            max_same_error,
            history: VecDeque::with_capacity(HISTORY_WINDOW),
            line_numbers: Regex::new(r"line \d+")?,
            quoted_files: Regex::new(r#"File ".*?""#)?,
            path_locations: Regex::new(r"(?:[\w.~-]*/)+[\w.-]+:\d+(?::\d+)?")?,
        })
    }

    /// Strip line numbers and file locations so equivalent errors compare equal
    pub fn normalize(&self, error: &str) -> String {
        let normalized = self.line_numbers.replace_all(error, "line X");
        let normalized = self.quoted_files.replace_all(&normalized, "File \"X\"");
        let normalized = self.path_locations.replace_all(&normalized, "X");
        normalized.trim().chars().take(NORMALIZED_LENGTH).collect()
    }

    /// Normalized errors currently in the comparison window, oldest first
    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(String::as_str)
    }
}

impl ExecutionHook for RepeatedErrorHook {
    fn name(&self) -> &str {
        "repeated_error_guard"
    }

    fn phase(&self) -> HookPhase {
        HookPhase::Pre
    }

    fn priority(&self) -> i32 {
        15
    }

    fn should_run(&self, context: &HookContext) -> bool {
        context.operation == HookOperation::StartIteration
    }

    fn execute(&mut self, context: &HookContext) -> Result<HookResponse, HookError> {
        let error = context
            .metadata
            .get("previous_error")
            .and_then(Value::as_str)
            .unwrap_or("");
        if error.trim().is_empty() {
            return Ok(HookResponse::allow());
        }

        let normalized = self.normalize(error);
        let count = self.history.iter().filter(|e| **e == normalized).count();

        if self.history.len() == HISTORY_WINDOW {
            self.history.pop_front();
        }
        self.history.push_back(normalized);

        if count >= self.max_same_error {
            return Ok(HookResponse::warn(
                format!("Same error repeated {} times", count + 1),
                vec!["Consider a different approach - same error recurring".to_string()],
            ));
        }

        Ok(HookResponse::allow())
    }
}
