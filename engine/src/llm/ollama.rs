//! Ollama LLM Provider
//!
//! Ollama runs models locally on the user's machine, typically at
//! http://localhost:11434. No API key is required. Token usage comes from the
//! `prompt_eval_count` and `eval_count` fields of the chat response.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{
    estimate_messages_tokens, map_request_error, Completion, LLMError, LLMProvider, Message,
    Result,
};
use crate::context_budget::estimate_tokens;

/// Ollama provider configuration
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    /// Base URL for Ollama API (typically http://localhost:11434)
    base_url: String,

    /// Model name to use (e.g., "qwen2.5-coder:7b")
    model: String,

    client: Client,
}

impl OllamaProvider {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LLMError::Unknown(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<OllamaMessage> {
        messages
            .iter()
            .map(|msg| OllamaMessage {
                role: msg.role.to_string(),
                content: msg.content.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl LLMProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, messages: &[Message]) -> Result<Completion> {
        let ollama_messages = self.convert_messages(messages);

        let prompt_chars: usize = ollama_messages.iter().map(|m| m.content.len()).sum();
        tracing::debug!(
            model = %self.model,
            messages = ollama_messages.len(),
            prompt_chars,
            "Sending Ollama chat request"
        );

        let request = OllamaRequest {
            model: self.model.clone(),
            messages: ollama_messages,
            stream: false,
        };

        let url = format!("{}/api/chat", self.base_url);
        let start = std::time::Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| map_request_error("Ollama", &self.base_url, e))?;

        tracing::debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            status = %response.status(),
            "Ollama chat response"
        );

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::ProviderUnavailable(format!(
                "Ollama API error ({}): {}",
                status, error_text
            )));
        }

        let ollama_response: OllamaResponse = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(format!("Failed to parse Ollama response: {}", e)))?;

        let content = ollama_response.message.content;
        let tokens_used = match (ollama_response.prompt_eval_count, ollama_response.eval_count) {
            (None, None) => estimate_messages_tokens(messages) + estimate_tokens(&content),
            (prompt, reply) => prompt.unwrap_or(0) + reply.unwrap_or(0),
        };

        Ok(Completion {
            content,
            tokens_used,
        })
    }

    async fn check_health(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        matches!(self.client.get(&url).send().await, Ok(r) if r.status().is_success())
    }
}

/// Ollama API request format
#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

/// Ollama message format
#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

/// Ollama API response format
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: Option<usize>,
    #[serde(default)]
    eval_count: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base_url: &str) -> OllamaProvider {
        OllamaProvider::new(base_url, "qwen2.5-coder:7b", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_ollama_provider_properties() {
        let provider = provider("http://localhost:11434/");
        assert_eq!(provider.name(), "ollama");
        assert_eq!(provider.base_url, "http://localhost:11434");
    }

    #[test]
    fn test_message_conversion() {
        let provider = provider("http://localhost:11434");
        let messages = vec![
            Message::system("You are a planner"),
            Message::user("Hello"),
            Message::assistant("Hi there"),
        ];

        let converted = provider.convert_messages(&messages);
        assert_eq!(converted.len(), 3);
        assert_eq!(converted[0].role, "system");
        assert_eq!(converted[1].role, "user");
        assert_eq!(converted[2].role, "assistant");
    }

    #[tokio::test]
    async fn test_complete_reports_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({"model": "qwen2.5-coder:7b", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "{\"plan\": \"1. add\"}"},
                "done": true,
                "prompt_eval_count": 40,
                "eval_count": 12
            })))
            .expect(1)
            .mount(&server)
            .await;

        let completion = provider(&server.uri())
            .complete(&[Message::user("plan it")])
            .await
            .unwrap();
        assert_eq!(completion.content, "{\"plan\": \"1. add\"}");
        assert_eq!(completion.tokens_used, 52);
    }

    #[tokio::test]
    async fn test_complete_estimates_missing_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "abcdefgh"},
                "done": true
            })))
            .mount(&server)
            .await;

        let completion = provider(&server.uri())
            .complete(&[Message::user("abcd")])
            .await
            .unwrap();
        assert_eq!(completion.tokens_used, 3);
    }

    #[tokio::test]
    async fn test_server_error_maps_to_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
            .mount(&server)
            .await;

        let err = provider(&server.uri())
            .complete(&[Message::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, LLMError::ProviderUnavailable(msg) if msg.contains("model not loaded")));
    }
}
