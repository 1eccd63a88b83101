//! LLM-backed default agents
//!
//! One agent per phase. Each builds a prompt from the [`Context`] it is handed,
//! asks the model for a JSON reply through the [`LlmGateway`] and turns the
//! reply into its typed [`sdk::PhaseResult`]. Agents that touch the workspace
//! (coder, tester) do so only through the [`SandboxManager`].
//!
//! Replies are parsed leniently: missing optional fields fall back to empty
//! values, and only a reply with nothing usable is an [`AgentError::InvalidReply`].

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use sdk::{AgentError, AgentRole, Context};

use crate::db::LearningRepository;
use crate::failure_analyzer::FailureAnalyzer;
use crate::llm::{parse_json_reply, LLMError, LlmGateway, Message};
use crate::orchestrator::AgentSet;
use crate::sandbox::SandboxManager;

pub mod auditor;
pub mod coder;
pub mod planner;
pub mod reflector;
pub mod reviewer;
pub mod tester;

pub use auditor::AuditorAgent;
pub use coder::CoderAgent;
pub use planner::PlannerAgent;
pub use reflector::ReflectorAgent;
pub use reviewer::ReviewerAgent;
pub use tester::TesterAgent;

/// Number of similar past records pulled into prompts
pub(crate) const SIMILAR_LIMIT: i64 = 3;

impl From<LLMError> for AgentError {
    fn from(e: LLMError) -> Self {
        match e {
            LLMError::Timeout => AgentError::Timeout,
            LLMError::Blocked(reason) => AgentError::Blocked(reason),
            LLMError::ParseError(msg) => AgentError::InvalidReply(msg),
            other => AgentError::Llm(other.to_string()),
        }
    }
}

/// Send one system + user exchange and return the reply text
pub(crate) async fn ask(
    gateway: &LlmGateway,
    role: AgentRole,
    iteration: u32,
    system: &str,
    user: String,
) -> Result<String, AgentError> {
    let messages = [Message::system(system), Message::user(user)];
    let completion = gateway.complete(role.as_str(), iteration, &messages).await?;
    Ok(completion.content)
}

/// Like [`ask`], but the reply must contain a JSON object
pub(crate) async fn ask_json(
    gateway: &LlmGateway,
    role: AgentRole,
    iteration: u32,
    system: &str,
    user: String,
) -> Result<(Value, String), AgentError> {
    let content = ask(gateway, role, iteration, system, user).await?;

    let value = parse_json_reply(&content).ok_or_else(|| {
        let preview: String = content.chars().take(120).collect();
        AgentError::InvalidReply(format!("{} reply had no JSON object: {}", role, preview))
    })?;
    Ok((value, content))
}

/// All files as one text block, each headed by `# path`
pub fn combined_code(files: &BTreeMap<String, String>) -> String {
    files
        .iter()
        .map(|(path, content)| format!("# {}\n{}", path, content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub(crate) fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// A list of strings; a single string is accepted as a one-item list
pub(crate) fn string_list(value: &Value, key: &str) -> Vec<String> {
    match value.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

pub(crate) fn require_str<'a>(context: &'a Context, key: &'static str) -> Result<&'a str, AgentError> {
    context.get_str(key).ok_or(AgentError::MissingContext(key))
}

pub(crate) fn language(context: &Context) -> String {
    context
        .language()
        .unwrap_or("python")
        .trim()
        .to_ascii_lowercase()
}

/// Build the LLM-backed agent set
///
/// The reviewer and auditor are always constructed; the orchestrator only
/// dispatches to them when the matching phase is enabled.
pub fn default_agents(
    gateway: LlmGateway,
    sandbox: SandboxManager,
    learning: Option<LearningRepository>,
    analyzer: Arc<FailureAnalyzer>,
) -> AgentSet {
    AgentSet {
        planner: Arc::new(PlannerAgent::new(gateway.clone(), learning.clone())),
        coder: Arc::new(CoderAgent::new(gateway.clone(), sandbox.clone())),
        tester: Arc::new(TesterAgent::new(gateway.clone(), sandbox)),
        reflector: Arc::new(ReflectorAgent::new(gateway.clone(), learning, analyzer)),
        reviewer: Some(Arc::new(ReviewerAgent::new(gateway.clone()))),
        auditor: Some(Arc::new(AuditorAgent::new(gateway))),
    }
}
