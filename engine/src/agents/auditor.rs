//! Security auditor agent

use async_trait::async_trait;
use sdk::{Agent, AgentError, AgentRole, AuditOutcome, Context, PhaseResult};
use serde_json::Value;
use tracing::{info, warn};

use super::{ask_json, combined_code, language, str_field, string_list};
use crate::llm::LlmGateway;

const SYSTEM_PROMPT: &str = "You are an application security auditor. Check the code for \
injection, unsafe deserialization, hard-coded secrets, path traversal and unsafe shell use. \
Reply with a single JSON object: {\"passed\": bool, \"critical_findings\": [string], \
\"report\": string}.";

pub struct AuditorAgent {
    gateway: LlmGateway,
}

impl AuditorAgent {
    pub fn new(gateway: LlmGateway) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Agent for AuditorAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Auditor
    }

    async fn execute(&self, context: &Context) -> Result<PhaseResult, AgentError> {
        let prompt = format!(
            "Language: {}\n\nCode:\n{}\n",
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

        let critical_findings = string_list(&reply, "critical_findings");
        let passed = reply
            .get("passed")
            .and_then(Value::as_bool)
            .unwrap_or(critical_findings.is_empty());
        let report = str_field(&reply, "report").unwrap_or_default();

        if critical_findings.is_empty() {
            info!(passed, "Security audit completed");
        } else {
            warn!(
                vulnerability_count = critical_findings.len(),
                "Security audit found vulnerabilities"
            );
        }

        Ok(PhaseResult::Audited(AuditOutcome {
            passed,
            critical_findings,
            report,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::scripted_gateway;

    #[tokio::test]
    async fn test_clean_audit() {
        let (gateway, _) = scripted_gateway(&[r#"{"passed": true, "report": "no findings"}"#]);
        let result = AuditorAgent::new(gateway)
            .execute(&Context::new("t-1", "d", "g"))
            .await
            .unwrap();

        let PhaseResult::Audited(audit) = result else {
            panic!("expected an audit");
        };
        assert!(audit.passed);
        assert!(audit.critical_findings.is_empty());
    }

    #[tokio::test]
    async fn test_non_json_reply_is_invalid() {
        let (gateway, _) = scripted_gateway(&["Looks fine to me"]);
        let err = AuditorAgent::new(gateway)
            .execute(&Context::new("t-1", "d", "g"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidReply(_)));
    }
}
