//! Tester agent

use async_trait::async_trait;
use sdk::context::fields;
use sdk::{Agent, AgentError, AgentRole, Context, PhaseResult, TestReport};
use tracing::{info, warn};

use super::{ask_json, combined_code, language, str_field};
use crate::llm::LlmGateway;
use crate::sandbox::{resolve_in_workspace, Runtime, SandboxManager};

const SYSTEM_PROMPT: &str = "You are a test engineer. Write one test file that checks the code \
against the goal. Use pytest for Python and node:test with node:assert for JavaScript. \
Reply with a single JSON object: {\"test_file\": \"relative/path\", \"content\": \"test source\"}.";

pub struct TesterAgent {
    gateway: LlmGateway,
    sandbox: SandboxManager,
}

impl TesterAgent {
    pub fn new(gateway: LlmGateway, sandbox: SandboxManager) -> Self {
        Self { gateway, sandbox }
    }
}

/// Test file used when the reply names none, or names one outside the workspace
fn default_test_file(language: &str) -> &'static str {
    match Runtime::from_language(language) {
        Some(Runtime::Node) => "test/generated.test.js",
        _ => "test_generated.py",
    }
}

fn build_prompt(context: &Context, language: &str) -> String {
    format!(
        "Goal: {}\nLanguage: {}\n\nCode under test:\n{}\n",
        context.goal().unwrap_or_default(),
        language,
        combined_code(&context.code_files()),
    )
}

#[async_trait]
impl Agent for TesterAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Tester
    }

    async fn execute(&self, context: &Context) -> Result<PhaseResult, AgentError> {
        let workspace = context
            .workspace()
            .ok_or(AgentError::MissingContext(fields::WORKSPACE))?;
        if context.code_files().is_empty() {
            return Err(AgentError::MissingContext(fields::CODE_FILES));
        }
        let language = language(context);
        let iteration = context.iteration();

        let (reply, _) = ask_json(
            &self.gateway,
            self.role(),
            iteration,
            SYSTEM_PROMPT,
            build_prompt(context, &language),
        )
        .await?;

        let test_code = str_field(&reply, "content")
            .or_else(|| str_field(&reply, "test_code"))
            .ok_or_else(|| AgentError::InvalidReply("tester reply has no test content".to_string()))?;

        let test_file = match str_field(&reply, "test_file") {
            Some(path) if resolve_in_workspace(&workspace, &path).is_ok() => path,
            Some(path) => {
                warn!(path = %path, "Test file outside the workspace, using default");
                default_test_file(&language).to_string()
            }
            None => default_test_file(&language).to_string(),
        };

        self.sandbox
            .write_file(&workspace, &test_file, &test_code, self.role().as_str(), iteration)
            .await
            .map_err(|e| AgentError::Sandbox(e.to_string()))?;

        let outcome = self
            .sandbox
            .run_tests(&workspace, Some(&test_file), &language, iteration)
            .await;

        info!(
            passed = outcome.passed,
            total = outcome.total,
            failed = outcome.failed_count,
            "Tests executed"
        );

        Ok(PhaseResult::Tested(TestReport {
            test_file,
            test_code,
            outcome,
        }))
    }
}
