//! Code reviewer agent

use async_trait::async_trait;
use sdk::{Agent, AgentError, AgentRole, Context, PhaseResult, ReviewOutcome};
use serde_json::Value;
use tracing::{info, warn};

use super::{ask_json, combined_code, language, str_field, string_list};
use crate::llm::LlmGateway;

const SYSTEM_PROMPT: &str = "You are a strict code reviewer. Look for bugs, unhandled edge cases \
and code that does not meet the goal. Reply with a single JSON object: {\"approved\": bool, \
\"critical_issues\": [string], \"feedback\": string}. Only list issues that must be fixed \
as critical.";

pub struct ReviewerAgent {
    gateway: LlmGateway,
}

impl ReviewerAgent {
    pub fn new(gateway: LlmGateway) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Agent for ReviewerAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Reviewer
    }

    async fn execute(&self, context: &Context) -> Result<PhaseResult, AgentError> {
        let prompt = format!(
            "Goal: {}\nLanguage: {}\n\nCode:\n{}\n",
            context.goal().unwrap_or_default(),
            language(context),
            combined_code(&context.code_files()),
        );

        let (reply, _) = ask_json(
            &self.gateway,
            self.role(),
            context.iteration(),
            SYSTEM_PROMPT,
            prompt,
        )
        .await?;

        let critical_issues = string_list(&reply, "critical_issues");
        let approved = reply
            .get("approved")
            .and_then(Value::as_bool)
            .unwrap_or(critical_issues.is_empty());
        let feedback = str_field(&reply, "feedback").unwrap_or_default();

        if critical_issues.is_empty() {
            info!(approved, "Code review completed");
        } else {
            warn!(
                blocking_count = critical_issues.len(),
                "Code review found critical issues"
            );
        }

        Ok(PhaseResult::Reviewed(ReviewOutcome {
            approved,
            critical_issues,
            feedback,
        }))
    }
}
