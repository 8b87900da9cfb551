//! Chat-completion client.
//!
//! The engine talks to one OpenAI-compatible chat endpoint. The contract is
//! the `ChatApi` trait so tests and alternative providers can swap the
//! transport; the pipeline only ever sees a returned content string.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// One chat call: system + user message, optional JSON mode and temperature.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    /// `None` means the provider default is used.
    pub temperature: Option<f32>,
    /// Request `response_format = json_object`.
    pub json_mode: bool,
    pub timeout: Duration,
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Run the completion and return the assistant message content.
    async fn complete(&self, request: ChatRequest) -> Result<String>;
}

/// Temperature policy: some model families accept only their default.
/// Names starting with `o1` or containing `gpt-5` get `None`.
pub fn temperature_for(model: &str, configured: f32) -> Option<f32> {
    let lower = model.to_lowercase();
    if lower.starts_with("o1") || lower.contains("gpt-5") {
        None
    } else {
        Some(configured)
    }
}

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl OpenAiCompatClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| EngineError::Internal(format!("http client construction failed: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }

    /// Parse a response body as JSON, with a clear error when the server
    /// returned HTML (load balancer error pages and the like).
    fn parse_body(endpoint: &str, status: reqwest::StatusCode, body: &str) -> Result<String> {
        let trimmed = body.trim_start();
        if trimmed.starts_with('<') {
            let preview: String = trimmed.chars().take(200).collect();
            return Err(EngineError::Ai(format!(
                "endpoint {endpoint} returned HTML instead of JSON (HTTP {status}): {preview}"
            )));
        }
        if !status.is_success() {
            let preview: String = body.chars().take(300).collect();
            return Err(EngineError::Ai(format!(
                "chat completion failed (HTTP {status}): {preview}"
            )));
        }
        let parsed: ChatCompletionResponse = serde_json::from_str(body).map_err(|e| {
            let preview: String = body.chars().take(300).collect();
            EngineError::Ai(format!(
                "failed to parse chat response from {endpoint}: {e}. Body: {preview}"
            ))
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| EngineError::Ai("chat response contained no choices".to_string()))
    }
}

#[async_trait]
impl ChatApi for OpenAiCompatClient {
    async fn complete(&self, request: ChatRequest) -> Result<String> {
        let mut payload = json!({
            "model": request.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
        });
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if request.json_mode {
            payload["response_format"] = json!({"type": "json_object"});
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(request.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Ai(format!("chat completion timed out: {e}"))
                } else {
                    EngineError::Ai(format!("chat completion request failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::Ai(format!("failed to read chat response body: {e}")))?;

        Self::parse_body(&self.endpoint, status, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temperature_policy() {
        assert_eq!(temperature_for("gpt-4o", 0.0), Some(0.0));
        assert_eq!(temperature_for("o1-preview", 0.0), None);
        assert_eq!(temperature_for("azure-gpt-5.2", 0.0), None);
        assert_eq!(temperature_for("GPT-5-turbo", 0.7), None);
    }

    #[test]
    fn test_parse_body_rejects_html() {
        let err = OpenAiCompatClient::parse_body(
            "http://llm.internal",
            reqwest::StatusCode::BAD_GATEWAY,
            "<!DOCTYPE html><html>down</html>",
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Ai(_)));
        assert!(err.to_string().contains("HTML"));
    }

    #[test]
    fn test_parse_body_extracts_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hello"}}]}"#;
        let content =
            OpenAiCompatClient::parse_body("http://llm.internal", reqwest::StatusCode::OK, body)
                .unwrap();
        assert_eq!(content, "hello");
    }

    #[test]
    fn test_parse_body_no_choices() {
        let body = r#"{"choices":[]}"#;
        let err =
            OpenAiCompatClient::parse_body("http://llm.internal", reqwest::StatusCode::OK, body)
                .unwrap_err();
        assert!(err.to_string().contains("no choices"));
    }
}
