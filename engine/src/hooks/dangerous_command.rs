//! Dangerous command blocker
//!
//! Pre-execution hook for shell commands. The command text is matched against
//! a fixed list of destructive patterns; any match blocks the command before a
//! process is spawned.

use regex::Regex;

use super::{ExecutionHook, HookContext, HookError, HookOperation, HookPhase, HookResponse};

/// Destructive command patterns, matched case-insensitively
const DANGEROUS_PATTERNS: &[&str] = &[
    // Recursive force delete of root, home or everything
    r"\brm\s+-(?:rf|fr)\s+[/~]",
    r"\brm\s+-(?:rf|fr)\s+\*",
    // Raw disk writes and formatting
    r">\s*/dev/sd",
    r"\bdd\s+.*of=/dev/(?:sd|hd|nvme)",
    r"\bmkfs\.",
    // Fork bomb
    r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
    // Privilege escalation and permission changes
    r"\bsudo\s+",
    r"\bchmod\s+(?:-R\s+)?777",
    r"\bchown\s+.*:.*\s+/",
    // Remote code piped into a shell
    r"\bcurl\b.*\|\s*(?:ba)?sh\b",
    r"\bwget\b.*\|\s*(?:ba)?sh\b",
    // Listeners and exfiltration
    r"\bnc\s+-l",
    r"\bcurl\b.*--data.*password",
    // Reading credentials
    r"\bcat\s+.*/\.ssh/",
    r"\bcat\s+.*/\.aws/",
    r"\bcat\s+.*\.env\b",
];

/// Blocks shell commands matching destructive patterns
pub struct DangerousCommandHook {
    patterns: Vec<(String, Regex)>,
}

impl DangerousCommandHook {
    pub fn new() -> Result<Self, HookError> {
        let patterns = DANGEROUS_PATTERNS
            .iter()
            .map(|p| Ok((p.to_string(), Regex::new(&format!("(?i){}", p))?)))
            .collect::<Result<Vec<_>, HookError>>()?;
        Ok(Self { patterns })
    }

    /// First pattern matching `command`, if any
    pub fn matching_pattern(&self, command: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(command))
            .map(|(source, _)| source.as_str())
    }
}

impl ExecutionHook for DangerousCommandHook {
    fn name(&self) -> &str {
        "dangerous_command_blocker"
    }

    fn phase(&self) -> HookPhase {
        HookPhase::Pre
    }

    fn priority(&self) -> i32 {
        10
    }

    fn should_run(&self, context: &HookContext) -> bool {
        context.operation == HookOperation::ExecuteCommand
    }

    fn execute(&mut self, context: &HookContext) -> Result<HookResponse, HookError> {
        let command = context.content.as_deref().unwrap_or("");
        Ok(match self.matching_pattern(command) {
            Some(pattern) => HookResponse::block(format!(
                "Dangerous command pattern detected: {}",
                pattern
            )),
            None => HookResponse::allow(),
        })
    }
}
