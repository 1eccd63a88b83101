//! Safety hook pipeline
//!
//! Hooks intercept named operations (shell commands, file writes, LLM calls,
//! iteration starts) before and after they execute. Policy lives in the hooks,
//! not in the orchestrator or the agents that perform the operations.
//!
//! # Pipeline semantics
//!
//! [`HookRegistry::execute_pre_hooks`] and [`HookRegistry::execute_post_hooks`]
//! run the enabled hooks of the matching phase in ascending priority order.
//! Registration order breaks ties.
//!
//! - `Allow` / `Warn`: continue. Warnings are collected.
//! - `Modify`: the hook's content replaces the working content and the next
//!   hook observes the modified content.
//! - `Block` / `RequireApproval`: stop immediately. No later hook runs.
//! - A hook that returns an error or panics is logged and treated as `Allow`.
//!
//! The pipeline only reports. Callers enforce: a side-effecting operation must
//! check [`PipelineOutcome::is_blocked`] before it runs. Whether
//! `RequireApproval` stops the operation is decided by [`ApprovalPolicy`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::HooksConfig;
use crate::metrics::TokenMeter;

pub mod auto_format;
pub mod dangerous_command;
pub mod repeated_error;
pub mod sensitive_file;
pub mod token_budget;

pub use auto_format::AutoFormatHook;
pub use dangerous_command::DangerousCommandHook;
pub use repeated_error::RepeatedErrorHook;
pub use sensitive_file::SensitiveFileHook;
pub use token_budget::TokenBudgetHook;

/// Registry shared between the orchestrator, the sandbox and the LLM gateway
pub type SharedHookRegistry = Arc<Mutex<HookRegistry>>;

/// Default number of execution log entries kept in memory
pub const DEFAULT_EXECUTION_LOG_LIMIT: usize = 1000;

/// Errors raised by hooks and the registry
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Invalid hook pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Hook already registered: {0}")]
    DuplicateName(String),

    #[error("Hook {hook} failed: {message}")]
    Execution { hook: String, message: String },
}

/// When a hook runs relative to the operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    Pre,
    Post,
}

/// Verdict returned by a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookResult {
    Allow,
    Block,
    Modify,
    Warn,
    RequireApproval,
}

impl HookResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookResult::Allow => "allow",
            HookResult::Block => "block",
            HookResult::Modify => "modify",
            HookResult::Warn => "warn",
            HookResult::RequireApproval => "require_approval",
        }
    }
}

impl fmt::Display for HookResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named operations that pass through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookOperation {
    ExecuteCommand,
    CommandCompleted,
    WriteFile,
    DeleteFile,
    ModifyFile,
    CallLlm,
    StartIteration,
}

impl HookOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookOperation::ExecuteCommand => "execute_command",
            HookOperation::CommandCompleted => "command_completed",
            HookOperation::WriteFile => "write_file",
            HookOperation::DeleteFile => "delete_file",
            HookOperation::ModifyFile => "modify_file",
            HookOperation::CallLlm => "call_llm",
            HookOperation::StartIteration => "start_iteration",
        }
    }
}

impl fmt::Display for HookOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How callers treat a `RequireApproval` verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalPolicy {
    /// Refuse the operation, exactly like `Block`
    #[default]
    Deny,

    /// Log the request and let the operation proceed
    Allow,
}

/// Request passed through the pipeline for one operation
#[derive(Debug, Clone, PartialEq)]
pub struct HookContext {
    /// Operation being intercepted
    pub operation: HookOperation,

    /// Agent performing the operation
    pub agent: String,

    /// Orchestration iteration the operation belongs to
    pub iteration: u32,

    /// Operation target: a file path, a command name, a model name
    pub target: Option<String>,

    /// Operation payload: command text, file content, prompt text
    pub content: Option<String>,

    /// Extra operation data (for example `previous_error` or `estimated_tokens`)
    pub metadata: Map<String, Value>,
}

impl HookContext {
    pub fn new(operation: HookOperation, agent: impl Into<String>, iteration: u32) -> Self {
        Self {
            operation,
            agent: agent.into(),
            iteration,
            target: None,
            content: None,
            metadata: Map::new(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Verdict and payload returned by one hook
#[derive(Debug, Clone, PartialEq)]
pub struct HookResponse {
    pub result: HookResult,
    pub message: Option<String>,
    pub modified_content: Option<String>,
    pub blocked_reason: Option<String>,
    pub warnings: Vec<String>,
}

impl HookResponse {
    pub fn allow() -> Self {
        Self {
            result: HookResult::Allow,
            message: None,
            modified_content: None,
            blocked_reason: None,
            warnings: Vec::new(),
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            result: HookResult::Block,
            message: Some(reason.clone()),
            blocked_reason: Some(reason),
            ..Self::allow()
        }
    }

    pub fn modify(content: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            result: HookResult::Modify,
            message: Some(message.into()),
            modified_content: Some(content.into()),
            ..Self::allow()
        }
    }

    pub fn warn(message: impl Into<String>, warnings: Vec<String>) -> Self {
        Self {
            result: HookResult::Warn,
            message: Some(message.into()),
            warnings,
            ..Self::allow()
        }
    }

    pub fn require_approval(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            result: HookResult::RequireApproval,
            message: Some(reason.clone()),
            blocked_reason: Some(reason),
            ..Self::allow()
        }
    }
}

/// Interceptor around a named operation
pub trait ExecutionHook: Send {
    /// Unique hook name
    fn name(&self) -> &str;

    fn phase(&self) -> HookPhase;

    /// Lower runs first
    fn priority(&self) -> i32;

    /// Whether this hook applies to the operation at all
    fn should_run(&self, context: &HookContext) -> bool;

    fn execute(&mut self, context: &HookContext) -> Result<HookResponse, HookError>;
}

/// Result of running one pipeline phase
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    /// Final verdict: the stopping verdict, `Modify` if content changed, else `Allow`
    pub result: HookResult,

    /// Context after all `Modify` verdicts were applied
    pub context: HookContext,

    /// Warnings gathered from every hook that ran
    pub warnings: Vec<String>,

    /// Hook that stopped the pipeline, if any
    pub stopped_by: Option<String>,

    /// Reason given by the stopping hook
    pub reason: Option<String>,
}

impl PipelineOutcome {
    /// Whether the caller must refuse the operation under `policy`
    pub fn is_blocked(&self, policy: ApprovalPolicy) -> bool {
        match self.result {
            HookResult::Block => true,
            HookResult::RequireApproval => policy == ApprovalPolicy::Deny,
            _ => false,
        }
    }

    /// Content after modification, if the operation carried any
    pub fn content(&self) -> Option<&str> {
        self.context.content.as_deref()
    }
}

/// One entry of the in-memory execution log
#[derive(Debug, Clone, Serialize)]
pub struct HookExecution {
    pub timestamp: DateTime<Utc>,
    pub hook: String,
    pub phase: HookPhase,
    /// `None` when the hook failed and was skipped
    pub result: Option<HookResult>,
    pub operation: HookOperation,
}

/// Summary of a registered hook
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookInfo {
    pub name: String,
    pub phase: HookPhase,
    pub priority: i32,
    pub enabled: bool,
}

struct RegisteredHook {
    hook: Box<dyn ExecutionHook>,
    enabled: bool,
}

/// Ordered collection of hooks
pub struct HookRegistry {
    hooks: Vec<RegisteredHook>,
    execution_log: VecDeque<HookExecution>,
    log_limit: usize,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::with_log_limit(DEFAULT_EXECUTION_LOG_LIMIT)
    }

    pub fn with_log_limit(log_limit: usize) -> Self {
        Self {
            hooks: Vec::new(),
            execution_log: VecDeque::new(),
            log_limit,
        }
    }

    /// Wrap the registry for sharing across components
    pub fn into_shared(self) -> SharedHookRegistry {
        Arc::new(Mutex::new(self))
    }

    /// Register a hook, keeping the list sorted by priority
    ///
    /// The sort is stable, so hooks of equal priority run in registration order.
    pub fn register(&mut self, hook: Box<dyn ExecutionHook>) -> Result<(), HookError> {
        if self.hooks.iter().any(|h| h.hook.name() == hook.name()) {
            return Err(HookError::DuplicateName(hook.name().to_string()));
        }

        debug!(
            hook = hook.name(),
            priority = hook.priority(),
            "Registered hook"
        );
        self.hooks.push(RegisteredHook {
            hook,
            enabled: true,
        });
        self.hooks.sort_by_key(|h| h.hook.priority());
        Ok(())
    }

    /// Remove a hook by name. Returns whether it was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|h| h.hook.name() != name);
        before != self.hooks.len()
    }

    pub fn enable(&mut self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable(&mut self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.hooks.iter_mut().find(|h| h.hook.name() == name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Registered hooks in execution order
    pub fn hooks(&self) -> Vec<HookInfo> {
        self.hooks
            .iter()
            .map(|h| HookInfo {
                name: h.hook.name().to_string(),
                phase: h.hook.phase(),
                priority: h.hook.priority(),
                enabled: h.enabled,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn execute_pre_hooks(&mut self, context: HookContext) -> PipelineOutcome {
        self.execute_phase(HookPhase::Pre, context)
    }

    pub fn execute_post_hooks(&mut self, context: HookContext) -> PipelineOutcome {
        self.execute_phase(HookPhase::Post, context)
    }

    /// Most recent execution log entries, oldest first
    pub fn execution_log(&self, limit: usize) -> Vec<HookExecution> {
        let skip = self.execution_log.len().saturating_sub(limit);
        self.execution_log.iter().skip(skip).cloned().collect()
    }

    fn execute_phase(&mut self, phase: HookPhase, mut context: HookContext) -> PipelineOutcome {
        let mut warnings = Vec::new();
        let mut modified = false;
        let mut records = Vec::new();
        let mut stop: Option<(HookResult, String, Option<String>)> = None;

        for entry in self
            .hooks
            .iter_mut()
            .filter(|h| h.enabled && h.hook.phase() == phase)
        {
            if !entry.hook.should_run(&context) {
                continue;
            }

            let name = entry.hook.name().to_string();
            let outcome = catch_unwind(AssertUnwindSafe(|| entry.hook.execute(&context)));
            let response = match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    error!(hook = %name, operation = %context.operation, "Hook failed: {}", e);
                    records.push((name, None));
                    continue;
                }
                Err(_) => {
                    error!(hook = %name, operation = %context.operation, "Hook panicked");
                    records.push((name, None));
                    continue;
                }
            };

            records.push((name.clone(), Some(response.result)));

            warnings.extend(response.warnings.iter().cloned());
            if let Some(message) = response.message.as_deref().filter(|m| !m.is_empty()) {
                warnings.push(format!("[{}] {}", name, message));
            }

            match response.result {
                HookResult::Block | HookResult::RequireApproval => {
                    let reason = response.blocked_reason.or(response.message);
                    stop = Some((response.result, name, reason));
                    break;
                }
                HookResult::Modify => {
                    if let Some(content) = response.modified_content {
                        context.content = Some(content);
                        modified = true;
                    }
                }
                HookResult::Allow | HookResult::Warn => {}
            }
        }

        for (hook, result) in records {
            self.record(hook, phase, result, context.operation);
        }

        match stop {
            Some((result, hook, reason)) => {
                if result == HookResult::Block {
                    warn!(hook = %hook, operation = %context.operation, "Operation blocked: {}", reason.as_deref().unwrap_or(""));
                } else {
                    info!(hook = %hook, operation = %context.operation, "Operation requires approval: {}", reason.as_deref().unwrap_or(""));
                }
                PipelineOutcome {
                    result,
                    context,
                    warnings,
                    stopped_by: Some(hook),
                    reason,
                }
            }
            None => PipelineOutcome {
                result: if modified {
                    HookResult::Modify
                } else {
                    HookResult::Allow
                },
                context,
                warnings,
                stopped_by: None,
                reason: None,
            },
        }
    }

    fn record(
        &mut self,
        hook: String,
        phase: HookPhase,
        result: Option<HookResult>,
        operation: HookOperation,
    ) {
        if self.log_limit == 0 {
            return;
        }
        if self.execution_log.len() == self.log_limit {
            self.execution_log.pop_front();
        }
        self.execution_log.push_back(HookExecution {
            timestamp: Utc::now(),
            hook,
            phase,
            result,
            operation,
        });
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the registry with the five default hooks
///
/// Returns an empty registry when hooks are disabled in configuration.
pub fn create_default_registry(
    config: &HooksConfig,
    meter: TokenMeter,
) -> Result<HookRegistry, HookError> {
    let mut registry = HookRegistry::with_log_limit(config.execution_log_limit);
    if !config.enabled {
        warn!("Safety hooks are disabled by configuration");
        return Ok(registry);
    }

    registry.register(Box::new(DangerousCommandHook::new()?))?;
    registry.register(Box::new(SensitiveFileHook::new()?))?;
    registry.register(Box::new(RepeatedErrorHook::new(config.max_same_error)?))?;
    registry.register(Box::new(TokenBudgetHook::new(config.token_budget, meter)))?;
    registry.register(Box::new(AutoFormatHook::new()))?;

    info!("Registered {} default hooks", registry.len());
    Ok(registry)
}
