//! Chat-completions HTTP client
//!
//! One client per process; the per-call deadline comes from the selected
//! model's `timeout_ms`. The response body only needs
//! `choices[0].message.content`; anything else is the provider's business.

use pricewire_common::models::ModelConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("pricewire/", env!("CARGO_PKG_VERSION"));

/// Chat client errors
#[derive(Debug, Error)]
pub enum LlmError {
    /// Network communication error (includes deadline expiry)
    #[error("Network error: {0}")]
    Network(String),

    /// Endpoint returned a non-2xx status
    #[error("API error {0}: {1}")]
    Api(u16, String),

    /// 2xx response without usable content
    #[error("Empty model response")]
    Empty,

    /// Response body was not the expected shape
    #[error("Parse error: {0}")]
    Parse(String),
}

impl LlmError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LlmError::Api(429, _))
    }
}

/// One conversation message
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP client for the configured chat-completions endpoint
#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    completions_url: String,
    api_key: String,
}

impl ChatClient {
    pub fn new(base_url: &str, api_key: String) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| LlmError::Network(e.to_string()))?;

        Ok(Self {
            http,
            completions_url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    /// Run one chat completion against `model` with its configured deadline
    pub async fn chat(
        &self,
        model: &ModelConfig,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &model.id,
            messages,
            temperature,
            max_tokens,
            response_format: ResponseFormat { kind: "json_object" },
        };

        let response = self
            .http
            .post(&self.completions_url)
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_millis(model.timeout_ms))
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail: String = body.chars().take(300).collect();
            return Err(LlmError::Api(status.as_u16(), detail));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::Empty)
    }
}

/// Seam for tests and alternative backends; the validator only needs this
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(
        &self,
        model: &ModelConfig,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError>;
}

#[async_trait::async_trait]
impl ChatBackend for ChatClient {
    async fn chat(
        &self,
        model: &ModelConfig,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        ChatClient::chat(self, model, messages, temperature, max_tokens).await
    }
}
