//! Hook-aware access to an LLM provider
//!
//! Every model call made by the default agents passes through
//! [`LlmGateway::complete`]: the `call_llm` pre-hooks see the estimated size of
//! the request, and the tokens the provider reports are added to the shared
//! [`TokenMeter`] that the token-budget guard and the metrics collector read.

use std::sync::Arc;
use tracing::{debug, warn};

use super::{estimate_messages_tokens, Completion, LLMError, LLMProvider, Message, Result};
use crate::hooks::{ApprovalPolicy, HookContext, HookOperation, SharedHookRegistry};
use crate::metrics::TokenMeter;

#[derive(Clone)]
pub struct LlmGateway {
    provider: Arc<dyn LLMProvider>,
    hooks: SharedHookRegistry,
    meter: TokenMeter,
    approval_policy: ApprovalPolicy,
}

impl LlmGateway {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        hooks: SharedHookRegistry,
        meter: TokenMeter,
        approval_policy: ApprovalPolicy,
    ) -> Self {
        Self {
            provider,
            hooks,
            meter,
            approval_policy,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn meter(&self) -> &TokenMeter {
        &self.meter
    }

    pub async fn complete(
        &self,
        agent: &str,
        iteration: u32,
        messages: &[Message],
    ) -> Result<Completion> {
        let estimated = estimate_messages_tokens(messages);

        let outcome = self.hooks.lock().await.execute_pre_hooks(
            HookContext::new(HookOperation::CallLlm, agent, iteration)
                .with_target(self.provider.name())
                .with_metadata("estimated_tokens", estimated),
        );
        for warning in &outcome.warnings {
            warn!(agent, "Hook warning: {}", warning);
        }
        if outcome.is_blocked(self.approval_policy) {
            let reason = outcome
                .reason
                .unwrap_or_else(|| "LLM call refused".to_string());
            return Err(LLMError::Blocked(reason));
        }

        let completion = self.provider.complete(messages).await?;
        self.meter.add(completion.tokens_used);

        debug!(
            agent,
            provider = self.provider.name(),
            tokens = completion.tokens_used,
            total_tokens = self.meter.total(),
            "LLM call completed"
        );
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{
        ExecutionHook, HookError, HookPhase, HookRegistry, HookResponse, TokenBudgetHook,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProvider {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LLMProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn complete(&self, _messages: &[Message]) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Completion {
                content: "ok".to_string(),
                tokens_used: 30,
            })
        }
    }

    struct DenyLlm;

    impl ExecutionHook for DenyLlm {
        fn name(&self) -> &str {
            "deny_llm"
        }

        fn phase(&self) -> HookPhase {
            HookPhase::Pre
        }

        fn priority(&self) -> i32 {
            1
        }

        fn should_run(&self, context: &HookContext) -> bool {
            context.operation == HookOperation::CallLlm
        }

        fn execute(&mut self, _context: &HookContext) -> std::result::Result<HookResponse, HookError> {
            Ok(HookResponse::block("offline mode"))
        }
    }

    fn gateway(registry: HookRegistry, meter: TokenMeter) -> (LlmGateway, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(FixedProvider {
            calls: calls.clone(),
        });
        (
            LlmGateway::new(provider, registry.into_shared(), meter, ApprovalPolicy::Deny),
            calls,
        )
    }

    #[tokio::test]
    async fn test_tokens_are_metered() {
        let meter = TokenMeter::new();
        let mut registry = HookRegistry::new();
        registry
            .register(Box::new(TokenBudgetHook::new(50, meter.clone())))
            .unwrap();
        let (gateway, calls) = gateway(registry, meter.clone());

        gateway.complete("planner", 1, &[Message::user("hi")]).await.unwrap();
        gateway.complete("coder", 1, &[Message::user("hi")]).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(meter.total(), 60);
    }

    #[tokio::test]
    async fn test_blocked_call_never_reaches_provider() {
        let mut registry = HookRegistry::new();
        registry.register(Box::new(DenyLlm)).unwrap();
        let (gateway, calls) = gateway(registry, TokenMeter::new());

        let err = gateway
            .complete("planner", 1, &[Message::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, LLMError::Blocked(reason) if reason == "offline mode"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
