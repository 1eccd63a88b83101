//! Structured failure log with full context
//!
//! Captures what the system looked like when a failure happened: the failure
//! itself, a sanitized slice of the context, the code under test and the
//! prompt that produced it. The XML rendering is what reflection prompts embed.

use chrono::{DateTime, Utc};
use sdk::context::fields;
use sdk::{Context, TestOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::{FailureAnalyzer, FailureMode};

/// Context fields copied into a failure log
const SAFE_CONTEXT_FIELDS: &[&str] = &[
    fields::TASK_ID,
    fields::TASK_DESCRIPTION,
    fields::GOAL,
    fields::PROBLEM_TYPE,
    fields::LANGUAGE,
    fields::ITERATION,
    fields::PLAN,
    fields::DEPENDENCIES,
    fields::SUBTASKS,
];

const MAX_CONTEXT_STRING_CHARS: usize = 500;
const MAX_PROMPT_CHARS: usize = 500;
const MAX_STACK_TRACE_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredFailureLog {
    pub error_message: String,
    pub error_type: String,
    pub error_signature: String,
    pub stack_trace: String,
    pub failure_mode: FailureMode,

    pub triggering_prompt: String,
    pub context_state: Map<String, Value>,
    pub iteration: u32,
    pub agent: String,
    pub task_id: String,

    pub code_files: BTreeMap<String, String>,
    pub test_file: Option<String>,

    pub diagnosis: String,
    pub root_cause_hypothesis: String,
    pub suggested_fix: String,
    pub similar_failures: Vec<String>,

    pub timestamp: DateTime<Utc>,
}

impl StructuredFailureLog {
    /// XML-tagged rendering; all text is escaped
    pub fn to_xml(&self) -> String {
        let prompt: String = self.triggering_prompt.chars().take(MAX_PROMPT_CHARS).collect();
        let trace: String = self.stack_trace.chars().take(MAX_STACK_TRACE_CHARS).collect();

        format!(
            "<failure_log>\n  <error>\n    <type>{}</type>\n    <message>{}</message>\n    \
             <signature>{}</signature>\n    <mode>{}</mode>\n  </error>\n  <context>\n    \
             <iteration>{}</iteration>\n    <agent>{}</agent>\n    \
             <triggering_prompt>{}</triggering_prompt>\n  </context>\n  <diagnosis>\n    \
             <root_cause>{}</root_cause>\n    <suggested_fix>{}</suggested_fix>\n  </diagnosis>\n  \
             <stack_trace>{}</stack_trace>\n</failure_log>",
            escape_xml(&self.error_type),
            escape_xml(&self.error_message),
            escape_xml(&self.error_signature),
            self.failure_mode,
            self.iteration,
            escape_xml(&self.agent),
            escape_xml(&prompt),
            escape_xml(&self.root_cause_hypothesis),
            escape_xml(&self.suggested_fix),
            escape_xml(&trace),
        )
    }
}

pub fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Keep small, useful context fields; long strings are cut to 500 characters
fn sanitize_context(context: &Context) -> Map<String, Value> {
    SAFE_CONTEXT_FIELDS
        .iter()
        .filter_map(|key| {
            let value = context.get(key)?;
            let value = match value {
                Value::String(text) if text.chars().count() > MAX_CONTEXT_STRING_CHARS => {
                    let mut short: String = text.chars().take(MAX_CONTEXT_STRING_CHARS).collect();
                    short.push_str("...");
                    Value::String(short)
                }
                other => other.clone(),
            };
            Some(((*key).to_string(), value))
        })
        .collect()
}

impl FailureAnalyzer {
    /// Extract a failure together with the context it happened in
    pub fn extract_structured(
        &self,
        outcome: &TestOutcome,
        context: &Context,
        triggering_prompt: &str,
    ) -> Option<StructuredFailureLog> {
        let info = self.extract(outcome)?;

        Some(StructuredFailureLog {
            error_message: info.error_message,
            error_type: info.error_type,
            error_signature: info.error_signature,
            stack_trace: info.stack_trace,
            failure_mode: info.failure_mode,
            triggering_prompt: triggering_prompt.to_string(),
            context_state: sanitize_context(context),
            iteration: context.iteration(),
            agent: context.current_agent().unwrap_or_default().to_string(),
            task_id: context.task_id().unwrap_or_default().to_string(),
            code_files: context.code_files(),
            test_file: outcome.test_file.clone(),
            diagnosis: String::new(),
            root_cause_hypothesis: String::new(),
            suggested_fix: String::new(),
            similar_failures: Vec::new(),
            timestamp: Utc::now(),
        })
    }
}
