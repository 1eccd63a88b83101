//! LLM Provider Abstraction Layer
//!
//! This module provides a common interface for the language models the default
//! agents talk to (Ollama and OpenAI-compatible endpoints). Agents never call a
//! provider directly: they go through [`gateway::LlmGateway`], which runs the
//! `call_llm` safety hooks and feeds the shared token meter.
//!
//! Agents ask for JSON replies. Models wrap JSON in prose or markdown fences
//! often enough that [`parse_json_reply`] extracts it leniently.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LLMConfig;
use crate::context_budget::estimate_tokens;

pub mod gateway;
pub mod ollama;
pub mod openai;

pub use gateway::LlmGateway;
pub use ollama::OllamaProvider;
pub use openai::OpenAIProvider;

/// Result type for LLM operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// Errors that can occur during LLM operations
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Call blocked by safety hook: {0}")]
    Blocked(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Message in a conversation history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Role of the message sender (user, assistant, system)
    pub role: MessageRole,

    /// Content of the message
    pub content: String,
}

impl Message {
    /// Create a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    /// Create a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// Text returned by a provider together with what it cost
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,

    /// Tokens billed for the call. Estimated from text length when the
    /// provider does not report usage.
    pub tokens_used: usize,
}

/// A chat-completion backend
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Returns the name of the provider (e.g., "ollama", "openai")
    fn name(&self) -> &str;

    /// Send the conversation and return the reply
    async fn complete(&self, messages: &[Message]) -> Result<Completion>;

    /// Whether the provider answers at all. Used by `setup` and before a run.
    async fn check_health(&self) -> bool {
        true
    }
}

/// Build the provider named by `config.default_provider`
pub fn create_provider(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
    let timeout = Duration::from_secs(config.request_timeout_secs);
    match config.default_provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaProvider::new(
            config.ollama.base_url.clone(),
            config.ollama.model.clone(),
            timeout,
        )?)),
        "openai" => Ok(Arc::new(OpenAIProvider::from_env(
            config.openai.clone(),
            timeout,
        )?)),
        other => Err(LLMError::InvalidRequest(format!(
            "Unknown provider: {}",
            other
        ))),
    }
}

/// Estimated token count of a whole conversation
pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

/// Map a transport error from `reqwest`
pub(crate) fn map_request_error(provider: &str, base_url: &str, e: reqwest::Error) -> LLMError {
    if e.is_timeout() {
        LLMError::Timeout
    } else if e.is_connect() {
        LLMError::ProviderUnavailable(format!(
            "Cannot connect to {} at {}",
            provider, base_url
        ))
    } else {
        LLMError::NetworkError(e.to_string())
    }
}

/// Extract a JSON object from a model reply.
///
/// Handles, in order:
/// 1. Raw JSON (the whole reply parses)
/// 2. Fenced JSON, with or without trailing prose
/// 3. The first balanced `{...}` embedded anywhere in prose
pub fn parse_json_reply(content: &str) -> Option<Value> {
    let trimmed = content.trim();

    if let Some(value) = parse_object(trimmed) {
        return Some(value);
    }

    if let Some(inner) = extract_fenced_json(trimmed) {
        if let Some(value) = parse_object(inner.trim()) {
            return Some(value);
        }
    }

    let mut search_from = 0;
    while let Some(pos) = trimmed[search_from..].find('{') {
        let start = search_from + pos;
        if let Some(json_str) = extract_balanced_json(&trimmed[start..]) {
            if let Some(value) = parse_object(json_str) {
                return Some(value);
            }
        }
        search_from = start + 1;
    }

    None
}

fn parse_object(s: &str) -> Option<Value> {
    serde_json::from_str::<Value>(s)
        .ok()
        .filter(Value::is_object)
}

/// Body of the first markdown fence, ignoring the language tag and any prose after it
fn extract_fenced_json(content: &str) -> Option<&str> {
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "json\n")
    let body_start_rel = after_opening.find('\n')? + 1;
    let body_start = fence_start + 3 + body_start_rel;

    let closing = content[body_start..].find("```")?;
    let body_end = body_start + closing;

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

/// The `{...}` object opening at the start of `s`, braces inside strings ignored
fn extract_balanced_json(s: &str) -> Option<&str> {
    if !s.starts_with('{') {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let user_msg = Message::user("Hello");
        assert_eq!(user_msg.role, MessageRole::User);
        assert_eq!(user_msg.content, "Hello");

        assert_eq!(Message::assistant("Hi").role, MessageRole::Assistant);
        assert_eq!(Message::system("Be terse").role, MessageRole::System);
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::user("test");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"test"}"#);
    }

    #[test]
    fn test_parse_raw_json() {
        let value = parse_json_reply(r#"  {"plan": "1. add", "subtasks": []} "#).unwrap();
        assert_eq!(value["plan"], "1. add");
    }

    #[test]
    fn test_parse_fenced_json_with_trailing_prose() {
        let reply = "Here you go:\n```json\n{\"files\": {\"app.py\": \"x = 1\"}}\n```\nLet me know!";
        let value = parse_json_reply(reply).unwrap();
        assert_eq!(value["files"]["app.py"], "x = 1");
    }

    #[test]
    fn test_parse_embedded_json() {
        let reply = "I think {this} is wrong. {\"root_cause\": \"off by one {i}\"} done";
        let value = parse_json_reply(reply).unwrap();
        assert_eq!(value, json!({"root_cause": "off by one {i}"}));
    }

    #[test]
    fn test_parse_rejects_non_objects() {
        assert!(parse_json_reply("[1, 2, 3]").is_none());
        assert!(parse_json_reply("no json here").is_none());
        assert!(parse_json_reply("{\"unterminated\": ").is_none());
    }

    #[test]
    fn test_balanced_json_respects_strings() {
        let s = r#"{"a": "}"} trailing"#;
        assert_eq!(extract_balanced_json(s), Some(r#"{"a": "}"}"#));
        assert_eq!(extract_balanced_json("x{}"), None);
    }

    #[test]
    fn test_estimate_messages_tokens() {
        let messages = vec![Message::system("abcd"), Message::user("abcdefgh")];
        assert_eq!(estimate_messages_tokens(&messages), 3);
    }

    #[test]
    fn test_unknown_provider() {
        let mut config = crate::config::Config::default().llm;
        config.default_provider = "mystery".to_string();
        assert!(matches!(
            create_provider(&config),
            Err(LLMError::InvalidRequest(_))
        ));
    }
}
