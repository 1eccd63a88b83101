//! Reflector agent
//!
//! Analyzes the latest failed test outcome: the failure analyzer supplies the
//! error type and signature, the learning store supplies fixes for similar past
//! failures, and the model supplies a root cause and a hypothesis for the fix.

use async_trait::async_trait;
use sdk::{
    Agent, AgentError, AgentRole, Context, PhaseResult, ReflectionOutcome, SimilarFailure,
};
use std::sync::Arc;
use tracing::{info, warn};

use super::{ask, combined_code, str_field, string_list, SIMILAR_LIMIT};
use crate::db::LearningRepository;
use crate::failure_analyzer::FailureAnalyzer;
use crate::llm::{parse_json_reply, LlmGateway};

const SYSTEM_PROMPT: &str = "You are a debugging expert. Explain why the tests failed and how to \
fix the code. Reply with a single JSON object: {\"root_cause\": string, \"hypothesis\": string, \
\"code_changes\": [string]}.";

const MAX_ERROR_CHARS: usize = 2000;

pub struct ReflectorAgent {
    gateway: LlmGateway,
    learning: Option<LearningRepository>,
    analyzer: Arc<FailureAnalyzer>,
}

impl ReflectorAgent {
    pub fn new(
        gateway: LlmGateway,
        learning: Option<LearningRepository>,
        analyzer: Arc<FailureAnalyzer>,
    ) -> Self {
        Self {
            gateway,
            learning,
            analyzer,
        }
    }

    async fn similar_failures(&self, signature: &str) -> Vec<SimilarFailure> {
        let Some(learning) = &self.learning else {
            return Vec::new();
        };
        match learning.find_similar_failures(signature, SIMILAR_LIMIT).await {
            Ok(failures) => failures,
            Err(e) => {
                warn!("Failure lookup failed: {:#}", e);
                Vec::new()
            }
        }
    }
}

fn format_similar(failures: &[SimilarFailure]) -> String {
    if failures.is_empty() {
        return "No similar past failures found.".to_string();
    }
    failures
        .iter()
        .enumerate()
        .map(|(i, failure)| {
            format!(
                "{}. {}\n   Root cause: {}\n   Solution: {}",
                i + 1,
                failure.error_signature,
                failure.root_cause.as_deref().unwrap_or("unknown"),
                failure.solution.as_deref().unwrap_or("unknown"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Reflection text that is not JSON: the opening of the text is the root cause
fn fallback_reflection(text: &str) -> (String, String) {
    let root_cause: String = text.trim().chars().take(200).collect();
    (root_cause, "Fix the identified issue".to_string())
}

#[async_trait]
impl Agent for ReflectorAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Reflector
    }

    async fn execute(&self, context: &Context) -> Result<PhaseResult, AgentError> {
        let outcome = context.test_outcome().unwrap_or_default();

        let Some(info) = self.analyzer.extract(&outcome) else {
            warn!("No error found in test results");
            return Ok(PhaseResult::Reflected(ReflectionOutcome {
                error_type: "Unknown".to_string(),
                error_signature: "No error message found".to_string(),
                root_cause: "Unable to determine".to_string(),
                hypothesis: "Re-run tests to get error details".to_string(),
                ..Default::default()
            }));
        };

        let similar = self.similar_failures(&info.error_signature).await;
        let error_text: String = info.error_message.chars().take(MAX_ERROR_CHARS).collect();
        let prompt = format!(
            "Error type: {}\nFailure mode: {}\nError:\n{}\n\nStack trace:\n{}\n\nCode:\n{}\n\n\
             Similar past failures:\n{}\n",
            info.error_type,
            info.failure_mode,
            error_text,
            info.stack_trace,
            combined_code(&context.code_files()),
            format_similar(&similar),
        );

        let reflection = ask(
            &self.gateway,
            self.role(),
            context.iteration(),
            SYSTEM_PROMPT,
            prompt,
        )
        .await?;

        let (fallback_cause, fallback_fix) = fallback_reflection(&reflection);
        let (root_cause, hypothesis, code_changes) = match parse_json_reply(&reflection) {
            Some(reply) => (
                str_field(&reply, "root_cause").unwrap_or(fallback_cause),
                str_field(&reply, "hypothesis").unwrap_or(fallback_fix),
                string_list(&reply, "code_changes"),
            ),
            None => (fallback_cause, fallback_fix, Vec::new()),
        };

        info!(
            error_type = %info.error_type,
            similar_found = similar.len(),
            "Reflection completed"
        );

        Ok(PhaseResult::Reflected(ReflectionOutcome {
            error_type: info.error_type,
            error_signature: info.error_signature,
            full_error: info.error_message,
            stack_trace: Some(info.stack_trace).filter(|s| !s.is_empty()),
            root_cause,
            hypothesis,
            reflection,
            code_changes,
            similar_failures: similar,
        }))
    }
}
