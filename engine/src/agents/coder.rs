//! Coder agent

use async_trait::async_trait;
use sdk::context::fields;
use sdk::{Agent, AgentError, AgentRole, CodeOutcome, Context, PhaseResult};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::{ask_json, combined_code, language, require_str};
use crate::llm::LlmGateway;
use crate::sandbox::{SandboxError, SandboxManager};

const SYSTEM_PROMPT: &str = "You are an expert programmer. Write complete, runnable source files \
for the task. Do not write test files. Reply with a single JSON object: \
{\"files\": {\"relative/path\": \"file content\"}}.";

/// Context fields that carry feedback for the next attempt
const FEEDBACK_FIELDS: &[(&str, &str)] = &[
    (fields::PREVIOUS_ERRORS, "Root cause of the previous failure"),
    (fields::FAILURE_DIAGNOSIS, "Diagnosis"),
    (fields::CODE_REVIEW_FEEDBACK, "Code review findings"),
    (fields::SECURITY_AUDIT_FEEDBACK, "Security audit findings"),
];

pub struct CoderAgent {
    gateway: LlmGateway,
    sandbox: SandboxManager,
}

impl CoderAgent {
    pub fn new(gateway: LlmGateway, sandbox: SandboxManager) -> Self {
        Self { gateway, sandbox }
    }
}

fn build_prompt(context: &Context, goal: &str) -> String {
    let mut prompt = format!(
        "Goal: {}\nLanguage: {}\n\nPlan:\n{}\n",
        goal,
        language(context),
        context.plan().unwrap_or("(no plan)"),
    );

    for (key, heading) in FEEDBACK_FIELDS {
        if let Some(text) = context.get_str(key).filter(|t| !t.trim().is_empty()) {
            prompt.push_str(&format!("\n{}:\n{}\n", heading, text));
        }
    }

    let existing = context.code_files();
    if !existing.is_empty() {
        prompt.push_str("\nCurrent code (rewrite the files that need fixing):\n");
        prompt.push_str(&combined_code(&existing));
        prompt.push('\n');
    }
    prompt
}

/// Files from a `{"files": {...}}` reply; a bare path map is accepted too
fn files_from_reply(reply: &Value) -> BTreeMap<String, String> {
    let map = reply
        .get("files")
        .or_else(|| reply.get("code_files"))
        .and_then(Value::as_object)
        .or_else(|| reply.as_object());

    map.map(|files| {
        files
            .iter()
            .filter_map(|(path, content)| {
                content
                    .as_str()
                    .filter(|c| !c.trim().is_empty())
                    .map(|c| (path.trim().to_string(), c.to_string()))
            })
            .filter(|(path, _)| !path.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

#[async_trait]
impl Agent for CoderAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Coder
    }

    async fn execute(&self, context: &Context) -> Result<PhaseResult, AgentError> {
        let goal = require_str(context, fields::GOAL)?;
        let workspace = context
            .workspace()
            .ok_or(AgentError::MissingContext(fields::WORKSPACE))?;
        let iteration = context.iteration();

        let (reply, _) = ask_json(
            &self.gateway,
            self.role(),
            iteration,
            SYSTEM_PROMPT,
            build_prompt(context, goal),
        )
        .await?;

        let files = files_from_reply(&reply);
        if files.is_empty() {
            return Err(AgentError::InvalidReply(
                "coder reply contained no files".to_string(),
            ));
        }

        let mut code_files = BTreeMap::new();
        let mut refused = Vec::new();
        for (path, content) in files {
            match self
                .sandbox
                .write_file(&workspace, &path, &content, self.role().as_str(), iteration)
                .await
            {
                Ok(written) => {
                    // Post-write hooks may have reformatted the file
                    let stored = tokio::fs::read_to_string(&written)
                        .await
                        .unwrap_or(content);
                    code_files.insert(path, stored);
                }
                Err(e @ (SandboxError::Blocked(_) | SandboxError::PathOutsideWorkspace(_))) => {
                    warn!(path = %path, "Skipping generated file: {}", e);
                    refused.push(e.to_string());
                }
                Err(e) => return Err(AgentError::Sandbox(e.to_string())),
            }
        }

        if code_files.is_empty() {
            return Err(AgentError::Blocked(refused.join("; ")));
        }

        info!(file_count = code_files.len(), "Code written");
        Ok(PhaseResult::Coded(CodeOutcome { code_files }))
    }
}
