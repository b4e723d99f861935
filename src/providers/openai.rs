use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LlmProvider, ProviderRequest};
use crate::embedder::DEFAULT_OPENAI_BASE_URL;
use crate::error::{RagError, RagResult};

/// Default chat model for the OpenAI backend.
pub const DEFAULT_OPENAI_CHAT_MODEL: &str = "gpt-3.5-turbo";

/// OpenAI chat completions client.
pub struct OpenAiProvider {
    model: String,
    endpoint: String,
    client: Client,
}

impl OpenAiProvider {
    /// Builds a client for `model`; `base_url` defaults to the public API.
    pub fn new(
        api_key: &str,
        model: String,
        base_url: Option<&str>,
        timeout: Duration,
    ) -> RagResult<Self> {
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| RagError::Configuration("invalid OpenAI API key".to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| RagError::provider("failed to build OpenAI HTTP client", err))?;
        let base_url = base_url.unwrap_or(DEFAULT_OPENAI_BASE_URL);
        Ok(Self {
            model,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            client,
        })
    }
}

impl LlmProvider for OpenAiProvider {
    fn answer(&self, request: &ProviderRequest) -> RagResult<String> {
        let body = ChatRequest {
            model: &self.model,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            messages: vec![ChatMessage {
                role: "user",
                content: request.prompt,
            }],
        };
        debug!(model = %self.model, prompt_chars = request.prompt.len(), "calling OpenAI chat completions");
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|err| RagError::provider("failed to call OpenAI chat completions", err))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(RagError::Provider(format!("OpenAI returned {status}: {text}")));
        }
        let parsed: ChatResponse = resp
            .json()
            .map_err(|err| RagError::provider("failed to parse OpenAI response", err))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| RagError::Provider("OpenAI response missing message content".to_string()))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: usize,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}
