use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::client::{GenerationClient, GenerationError, GenerationRequest, GenerationResponse, GenerationUsage};

/// Configuration for the bundled chat-completions client.
#[derive(Debug, Clone)]
pub struct HttpGenerationClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Transport-level request timeout, independent of the engine's
    /// per-attempt timeout.
    pub request_timeout: Duration,
}

/// OpenRouter-style chat-completions client. The engine depends only on the
/// `GenerationClient` trait; this implementation is provided for hosts that
/// do not bring their own.
pub struct HttpGenerationClient {
    http: reqwest::Client,
    config: HttpGenerationClientConfig,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

impl HttpGenerationClient {
    pub fn new(config: HttpGenerationClientConfig) -> Result<Self, GenerationError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GenerationError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    /// Map an API HTTP status code and response body to a generation error.
    fn map_status_error(status_code: u16, response_text: &str) -> GenerationError {
        // Prefer the structured error message when the body is JSON.
        let message = serde_json::from_str::<Value>(response_text)
            .ok()
            .and_then(|json| {
                json["error"]["message"]
                    .as_str()
                    .or_else(|| json["error"].as_str())
                    .map(|s| s.to_string())
            })
            .unwrap_or_else(|| response_text.to_string());

        match status_code {
            400 => GenerationError::BadRequest(message),
            401 | 403 => GenerationError::Auth(message),
            404 => GenerationError::BadRequest(format!("Not found: {}", message)),
            422 => GenerationError::PolicyRejection(message),
            429 => GenerationError::RateLimited(message),
            500..=599 => GenerationError::Server(message),
            _ => GenerationError::Server(format!("Unexpected status {}: {}", status_code, message)),
        }
    }
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn invoke(&self, request: GenerationRequest) -> Result<GenerationResponse, GenerationError> {
        let body = ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
        };

        debug!("Sending generation request [{}]", request.request_tag);

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::Timeout(format!("Request timed out: {}", e))
                } else {
                    GenerationError::Network(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            warn!(
                "Generation request [{}] failed with status {}",
                request.request_tag, status
            );
            return Err(Self::map_status_error(status, &text));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Server(format!("Malformed API response: {}", e)))?;

        let content = parsed
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| GenerationError::Server("Response contained no content".to_string()))?;

        let usage = parsed
            .usage
            .map(|u| GenerationUsage {
                prompt_tokens: u.prompt_tokens.unwrap_or(0),
                completion_tokens: u.completion_tokens.unwrap_or(0),
            })
            .unwrap_or_default();

        Ok(GenerationResponse { content, usage })
    }
}
