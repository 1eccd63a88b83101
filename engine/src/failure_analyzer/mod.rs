//! Failure analysis
//!
//! Turns raw test output into a comparable failure descriptor. Every
//! function here is pure and deterministic: identical input text always yields
//! a byte-identical [`FailureInfo`], which the learning store relies on to
//! deduplicate failures.
//!
//! - **Error type**: first known error token found in the text
//! - **Failure mode**: direct error type lookup, then keyword search
//! - **Signature**: the line naming the error type with file locations and
//!   quoted literals replaced, so the same bug in different runs compares equal

use regex::Regex;
use sdk::{SimilarFailure, TestOutcome};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod structured;

pub use structured::StructuredFailureLog;

/// Error type tokens, searched in this order
pub const KNOWN_ERROR_TYPES: &[&str] = &[
    "ImportError",
    "ModuleNotFoundError",
    "AttributeError",
    "TypeError",
    "ValueError",
    "KeyError",
    "IndexError",
    "NameError",
    "RuntimeError",
    "SyntaxError",
    "IndentationError",
    "FileNotFoundError",
    "AssertionError",
    "TimeoutError",
    "MemoryError",
    "RecursionError",
    "ReferenceError",
    "RangeError",
];

/// Reported when no known error type appears in the text
pub const UNKNOWN_ERROR_TYPE: &str = "UnknownError";

/// Characters of the first line used by a fallback signature
const FALLBACK_SIGNATURE_CHARS: usize = 100;

/// Failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    Syntax,
    /// Missing or unimportable module or dependency
    Import,
    Type,
    Runtime,
    Assertion,
    Timeout,
    ResourceLimit,
    Unknown,
}

impl FailureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureMode::Syntax => "syntax",
            FailureMode::Import => "import",
            FailureMode::Type => "type",
            FailureMode::Runtime => "runtime",
            FailureMode::Assertion => "assertion",
            FailureMode::Timeout => "timeout",
            FailureMode::ResourceLimit => "resource_limit",
            FailureMode::Unknown => "unknown",
        }
    }

    /// Direct error type lookup
    fn from_error_type(error_type: &str) -> Option<Self> {
        let mode = match error_type {
            "SyntaxError" | "IndentationError" => FailureMode::Syntax,
            "ImportError" | "ModuleNotFoundError" => FailureMode::Import,
            "TypeError" | "AttributeError" => FailureMode::Type,
            "ValueError" | "KeyError" | "IndexError" | "NameError" | "RuntimeError"
            | "FileNotFoundError" | "ReferenceError" | "RangeError" => FailureMode::Runtime,
            "AssertionError" => FailureMode::Assertion,
            "TimeoutError" => FailureMode::Timeout,
            "MemoryError" | "RecursionError" => FailureMode::ResourceLimit,
            _ => return None,
        };
        Some(mode)
    }

    /// Guidance shown to the coder on the next pass
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            FailureMode::Syntax => Some(
                "Syntax error detected. Check for missing colons, parentheses, or incorrect indentation.",
            ),
            FailureMode::Import => Some(
                "Import or dependency error. Verify the module exists, is spelled correctly and is listed as a dependency.",
            ),
            FailureMode::Type => Some("Type mismatch. Check argument types and return values."),
            FailureMode::Runtime => Some(
                "Runtime error. Check edge cases such as missing keys, empty inputs and out-of-range indexes.",
            ),
            FailureMode::Assertion => {
                Some("Test assertion failed. Review expected vs actual values.")
            }
            FailureMode::Timeout => Some(
                "Execution timed out. Check for infinite loops or inefficient algorithms.",
            ),
            FailureMode::ResourceLimit => Some(
                "Resource limit exceeded. Optimize memory usage or reduce recursion depth.",
            ),
            FailureMode::Unknown => None,
        }
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured descriptor of one failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub error_message: String,
    pub error_type: String,
    pub error_signature: String,
    pub stack_trace: String,
    pub failure_mode: FailureMode,
}

/// Extracts and classifies failures from test outcomes
pub struct FailureAnalyzer {
    quoted_file_location: Regex,
    path_location: Regex,
    quoted_literal: Regex,
}

const TIMEOUT_KEYWORDS: &[&str] = &["timeout", "timed out", "exceeded"];
const RESOURCE_KEYWORDS: &[&str] = &["memory", "oom", "killed", "limit"];
const DEPENDENCY_KEYWORDS: &[&str] = &["no module", "not found", "missing"];

impl FailureAnalyzer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            quoted_file_location: Regex::new(r#"File ".*?", line \d+,?"#)?,
            path_location: Regex::new(r"(?:[\w.~-]*/)+[\w.-]+:\d+(?::\d+)?")?,
            quoted_literal: Regex::new(r"'[^']*?'")?,
        })
    }

    /// Extract a failure descriptor, or `None` when the outcome carries no error text
    ///
    /// Error text is taken from the error message, then stderr, then the raw
    /// runner output.
    pub fn extract(&self, outcome: &TestOutcome) -> Option<FailureInfo> {
        let error_message = [
            outcome.error_message.as_deref(),
            Some(outcome.stderr.as_str()),
            Some(outcome.raw_output.as_str()),
        ]
        .into_iter()
        .flatten()
        .find(|text| !text.trim().is_empty())?
        .to_string();

        let stack_trace = outcome
            .stack_trace
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(outcome.stderr.as_str())
            .to_string();

        let error_type = Self::error_type(&error_message);
        let error_signature = self.signature(&error_message, error_type);
        let failure_mode = Self::classify(error_type, &error_message);

        Some(FailureInfo {
            error_type: error_type.to_string(),
            error_signature,
            stack_trace,
            failure_mode,
            error_message,
        })
    }

    /// First known error type mentioned in `text`
    pub fn error_type(text: &str) -> &'static str {
        KNOWN_ERROR_TYPES
            .iter()
            .find(|error_type| text.contains(*error_type))
            .copied()
            .unwrap_or(UNKNOWN_ERROR_TYPE)
    }

    /// Classify by error type, falling back to keywords in the message
    pub fn classify(error_type: &str, message: &str) -> FailureMode {
        if let Some(mode) = FailureMode::from_error_type(error_type) {
            return mode;
        }

        let lower = message.to_lowercase();
        let mentions = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

        if mentions(TIMEOUT_KEYWORDS) {
            FailureMode::Timeout
        } else if mentions(RESOURCE_KEYWORDS) {
            FailureMode::ResourceLimit
        } else if mentions(DEPENDENCY_KEYWORDS) {
            FailureMode::Import
        } else {
            FailureMode::Unknown
        }
    }

    /// Normalized fingerprint of the error
    pub fn signature(&self, text: &str, error_type: &str) -> String {
        if let Some(line) = text.lines().find(|line| line.contains(error_type)) {
            let normalized = self.quoted_file_location.replace_all(line, "");
            let normalized = self.path_location.replace_all(&normalized, "");
            let normalized = self.quoted_literal.replace_all(&normalized, "'X'");
            return normalized.trim().to_string();
        }

        match text.lines().map(str::trim).find(|line| !line.is_empty()) {
            Some(line) => format!(
                "{}: {}",
                error_type,
                line.chars().take(FALLBACK_SIGNATURE_CHARS).collect::<String>()
            ),
            None => format!("{}: Unknown error", error_type),
        }
    }

    /// Mode guidance plus the root causes of up to three similar past failures
    pub fn generate_diagnosis(&self, mode: FailureMode, similar: &[SimilarFailure]) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(guidance) = mode.guidance() {
            parts.push(guidance.to_string());
        }

        if !similar.is_empty() {
            parts.push(format!("Similar past failures ({} found):", similar.len()));
            for (i, failure) in similar.iter().take(3).enumerate() {
                if let Some(cause) = failure.root_cause.as_deref().filter(|c| !c.is_empty()) {
                    let cause: String = cause.chars().take(100).collect();
                    parts.push(format!("  {}. {}", i + 1, cause));
                }
            }
        }

        if parts.is_empty() {
            "No specific diagnosis available.".to_string()
        } else {
            parts.join("\n")
        }
    }
}
