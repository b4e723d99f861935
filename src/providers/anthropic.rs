use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LlmProvider, ProviderRequest};
use crate::error::{RagError, RagResult};

/// Default model for the Anthropic backend.
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-haiku-20240307";
/// Default API root for Anthropic.
pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Anthropic messages API client.
pub struct AnthropicProvider {
    model: String,
    endpoint: String,
    client: Client,
}

impl AnthropicProvider {
    /// Builds a client for `model`; `base_url` defaults to the public API.
    pub fn new(
        api_key: &str,
        model: String,
        base_url: Option<&str>,
        timeout: Duration,
    ) -> RagResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key.trim())
                .map_err(|_| RagError::Configuration("invalid Anthropic API key".to_string()))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| RagError::provider("failed to build Anthropic HTTP client", err))?;
        let base_url = base_url.unwrap_or(DEFAULT_ANTHROPIC_BASE_URL);
        Ok(Self {
            model,
            endpoint: format!("{}/messages", base_url.trim_end_matches('/')),
            client,
        })
    }
}

impl LlmProvider for AnthropicProvider {
    fn answer(&self, request: &ProviderRequest) -> RagResult<String> {
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: vec![AnthropicMessage {
                role: "user",
                content: vec![AnthropicContentBlock {
                    kind: "text",
                    text: request.prompt,
                }],
            }],
        };
        debug!(model = %self.model, prompt_chars = request.prompt.len(), "calling Anthropic messages API");
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|err| RagError::provider("failed to call Anthropic messages API", err))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(RagError::Provider(format!(
                "Anthropic returned {status}: {text}"
            )));
        }
        let parsed: AnthropicResponse = resp
            .json()
            .map_err(|err| RagError::provider("failed to parse Anthropic response", err))?;
        let answer = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicResponseBlock::Text { text } => Some(text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        if answer.is_empty() {
            return Err(RagError::Provider(
                "Anthropic response missing text content".to_string(),
            ));
        }
        Ok(answer)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    temperature: f32,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: Vec<AnthropicContentBlock<'a>>,
}

#[derive(Serialize)]
struct AnthropicContentBlock<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn request() -> ProviderRequest<'static> {
        ProviderRequest {
            prompt: "Question: what?",
            temperature: 0.7,
            max_tokens: 128,
        }
    }

    #[test]
    fn joins_text_blocks_and_skips_others() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/messages")
            .match_header("x-api-key", "ak-test")
            .match_header("anthropic-version", "2023-06-01")
            .match_body(Matcher::PartialJson(json!({"model": DEFAULT_ANTHROPIC_MODEL})))
            .with_status(200)
            .with_body(
                json!({"content": [
                    {"type": "text", "text": "first"},
                    {"type": "tool_use", "id": "x"},
                    {"type": "text", "text": "second"}
                ]})
                .to_string(),
            )
            .create();
        let provider = AnthropicProvider::new(
            "ak-test",
            DEFAULT_ANTHROPIC_MODEL.into(),
            Some(&server.url()),
            Duration::from_secs(5),
        )
        .expect("provider");
        let answer = provider.answer(&request()).expect("answer");
        mock.assert();
        assert_eq!(answer, "first\nsecond");
    }

    #[test]
    fn empty_content_is_an_error() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/messages")
            .with_status(200)
            .with_body(json!({"content": []}).to_string())
            .create();
        let provider = AnthropicProvider::new(
            "ak-test",
            DEFAULT_ANTHROPIC_MODEL.into(),
            Some(&server.url()),
            Duration::from_secs(5),
        )
        .expect("provider");
        let err = provider.answer(&request()).expect_err("empty");
        assert!(err.to_string().contains("missing text"), "{err}");
    }
}
