//! Sensitive file protector
//!
//! Pre-execution hook for file writes, deletions and modifications. Targets
//! matching a sensitive path pattern require approval.

use regex::Regex;

use super::{ExecutionHook, HookContext, HookError, HookOperation, HookPhase, HookResponse};

/// Sensitive path patterns, matched case-insensitively against the target
const PROTECTED_PATTERNS: &[&str] = &[
    // Environment and secret files
    r"(?:^|/)\.env$",
    r"(?:^|/)\.env\.",
    r"credentials\.json$",
    r"secrets\.ya?ml$",
    r"(?:^|/)id_(?:rsa|ed25519|ecdsa)(?:\.pub)?$",
    r"\.pem$",
    r"(?:^|/)\.npmrc$",
    r"(?:^|/)\.pypirc$",
    // Credential directories
    r"(?:^|/)\.ssh/",
    r"(?:^|/)\.aws/",
    r"(?:^|/)\.gnupg/",
    r"(?:^|/)\.kube/config$",
    // Repository configuration
    r"(?:^|/)\.git/config$",
    // Generated and vendored content
    r"(?:^|/)__pycache__/",
    r"\.pyc$",
    r"(?:^|/)node_modules/",
];

/// Requires approval before touching sensitive paths
pub struct SensitiveFileHook {
    patterns: Vec<Regex>,
}

impl SensitiveFileHook {
    pub fn new() -> Result<Self, HookError> {
        let patterns = PROTECTED_PATTERNS
            .iter()
            .map(|p| Regex::new(&format!("(?i){}", p)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Whether `path` matches a protected pattern
    pub fn is_protected(&self, path: &str) -> bool {
        let normalized = path.replace('\\', "/");
        self.patterns.iter().any(|re| re.is_match(&normalized))
    }
}

impl ExecutionHook for SensitiveFileHook {
    fn name(&self) -> &str {
        "sensitive_file_protector"
    }

    fn phase(&self) -> HookPhase {
        HookPhase::Pre
    }

    fn priority(&self) -> i32 {
        10
    }

    fn should_run(&self, context: &HookContext) -> bool {
        matches!(
            context.operation,
            HookOperation::WriteFile | HookOperation::DeleteFile | HookOperation::ModifyFile
        )
    }

    fn execute(&mut self, context: &HookContext) -> Result<HookResponse, HookError> {
        let target = context.target.as_deref().unwrap_or("");
        if self.is_protected(target) {
            Ok(HookResponse::require_approval(format!(
                "Protected file requires approval: {}",
                target
            )))
        } else {
            Ok(HookResponse::allow())
        }
    }
}
