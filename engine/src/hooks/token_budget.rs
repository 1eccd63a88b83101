//! Token budget guard
//!
//! Advisory pre-hook for LLM calls. Compares tokens already consumed (read from
//! the shared [`TokenMeter`]) plus the call's estimated size against a ceiling.
//! It warns but never blocks.

use serde_json::Value;

use super::{ExecutionHook, HookContext, HookError, HookOperation, HookPhase, HookResponse};
use crate::metrics::TokenMeter;

/// Default token ceiling for one task
pub const DEFAULT_TOKEN_BUDGET: usize = 50_000;

/// Warns when an LLM call would exceed the token budget
pub struct TokenBudgetHook {
    max_tokens: usize,
    meter: TokenMeter,
}

impl TokenBudgetHook {
    pub fn new(max_tokens: usize, meter: TokenMeter) -> Self {
        Self { max_tokens, meter }
    }
}

impl ExecutionHook for TokenBudgetHook {
    fn name(&self) -> &str {
        "token_budget_guard"
    }

    fn phase(&self) -> HookPhase {
        HookPhase::Pre
    }

    fn priority(&self) -> i32 {
        20
    }

    fn should_run(&self, context: &HookContext) -> bool {
        context.operation == HookOperation::CallLlm
    }

    fn execute(&mut self, context: &HookContext) -> Result<HookResponse, HookError> {
        let estimated = context
            .metadata
            .get("estimated_tokens")
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0);
        let used = self.meter.total();
        let projected = used.saturating_add(estimated);

        if projected > self.max_tokens {
            return Ok(HookResponse::warn(
                format!("Token budget warning: {}/{}", used, self.max_tokens),
                vec![format!(
                    "Approaching token limit: {}/{}",
                    projected, self.max_tokens
                )],
            ));
        }

        Ok(HookResponse::allow())
    }
}
