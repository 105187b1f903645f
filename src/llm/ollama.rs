//! Ollama-backed capability model.
//!
//! Uses the non-streaming `/api/chat` endpoint in JSON mode, so the model's
//! message content is expected to be a single JSON document.

use super::{CapabilityModel, PromptTemplate};
use crate::error::CapabilityError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Configuration for the Ollama client.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub ollama_url: String,
    pub model_name: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model_name: "llama3.2:latest".to_string(),
            temperature: 0.1,
            timeout_seconds: 120,
        }
    }
}

/// Message in the chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    format: &'static str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
}

/// Capability model served by a local or remote Ollama instance.
pub struct OllamaModel {
    config: OllamaConfig,
    http_client: reqwest::Client,
}

impl OllamaModel {
    pub fn new(config: OllamaConfig) -> Result<Self, CapabilityError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| {
                CapabilityError::Unavailable(format!("failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            config,
            http_client,
        })
    }

    fn build_request(
        &self,
        template: &PromptTemplate,
        context: &BTreeMap<String, String>,
    ) -> OllamaChatRequest {
        OllamaChatRequest {
            model: self.config.model_name.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: template.system.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: template.render(context),
                },
            ],
            format: "json",
            stream: false,
            options: OllamaOptions {
                // A strict retry runs cold to minimise creative formatting.
                temperature: if template.strict { 0.0 } else { self.config.temperature },
            },
        }
    }
}

#[async_trait]
impl CapabilityModel for OllamaModel {
    async fn infer(
        &self,
        template: &PromptTemplate,
        context: &BTreeMap<String, String>,
    ) -> Result<Value, CapabilityError> {
        let url = format!("{}/api/chat", self.config.ollama_url.trim_end_matches('/'));
        let request = self.build_request(template, context);

        debug!(
            template = template.name,
            model = %self.config.model_name,
            "Sending inference request"
        );

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CapabilityError::Timeout
                } else if e.is_connect() {
                    CapabilityError::Unavailable(format!(
                        "cannot connect to Ollama at {}",
                        self.config.ollama_url
                    ))
                } else {
                    CapabilityError::Unavailable(format!("failed to send request: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let chat_response: OllamaChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                CapabilityError::Timeout
            } else {
                CapabilityError::InvalidResponse(format!("failed to parse Ollama response: {}", e))
            }
        })?;

        parse_content(&chat_response.message.content)
    }

    fn name(&self) -> &str {
        &self.config.model_name
    }
}

fn map_status(status: StatusCode, body: &str) -> CapabilityError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => CapabilityError::QuotaExceeded,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => CapabilityError::Timeout,
        s if s.is_server_error() => {
            CapabilityError::Unavailable(format!("Ollama API error {}: {}", s, body))
        }
        s => CapabilityError::InvalidResponse(format!("Ollama API error {}: {}", s, body)),
    }
}

/// Parse message content as JSON, tolerating a surrounding markdown fence.
fn parse_content(content: &str) -> Result<Value, CapabilityError> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(unfenced)
        .map_err(|e| CapabilityError::InvalidResponse(format!("content is not JSON: {}", e)))
}
