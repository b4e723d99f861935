//! Hosted generation models behind a single blocking trait.

mod anthropic;
mod openai;

use std::fmt;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::RagResult;

pub use anthropic::{AnthropicProvider, DEFAULT_ANTHROPIC_BASE_URL, DEFAULT_ANTHROPIC_MODEL};
pub use openai::{OpenAiProvider, DEFAULT_OPENAI_CHAT_MODEL};

/// Trait implemented by concrete LLM providers.
pub trait LlmProvider: Send + Sync {
    /// Sends one prompt and returns the model's text answer.
    fn answer(&self, request: &ProviderRequest) -> RagResult<String>;

    /// Model name used for requests.
    fn model(&self) -> &str;
}

/// Request envelope shared by the various providers.
#[derive(Debug, Clone, Copy)]
pub struct ProviderRequest<'a> {
    /// Fully rendered prompt.
    pub prompt: &'a str,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token ceiling.
    pub max_tokens: usize,
}

/// Generation backend selected at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationBackend {
    /// OpenAI chat completions.
    #[value(name = "openai")]
    #[serde(rename = "openai")]
    OpenAi,
    /// Anthropic messages API.
    Anthropic,
}

impl GenerationBackend {
    /// Model used when none is configured.
    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => DEFAULT_OPENAI_CHAT_MODEL,
            Self::Anthropic => DEFAULT_ANTHROPIC_MODEL,
        }
    }

    /// Environment variable holding this backend's credential.
    pub fn key_var(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

impl fmt::Display for GenerationBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenAi => f.write_str("openai"),
            Self::Anthropic => f.write_str("anthropic"),
        }
    }
}

/// Everything needed to build an [`LlmProvider`].
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Which hosted API to call.
    pub backend: GenerationBackend,
    /// Model override; falls back to [`GenerationBackend::default_model`].
    pub model: Option<String>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token ceiling.
    pub max_tokens: usize,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Credential for the selected backend.
    pub api_key: Option<String>,
    /// API root override for the selected backend.
    pub base_url: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            backend: GenerationBackend::OpenAi,
            model: None,
            temperature: 0.7,
            max_tokens: 1000,
            timeout: Duration::from_secs(60),
            api_key: None,
            base_url: None,
        }
    }
}

impl GenerationConfig {
    /// Effective model name.
    pub fn model_name(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.backend.default_model())
    }
}

/// Builds the configured provider, or `None` when its credential is missing.
pub fn build_provider(config: &GenerationConfig) -> RagResult<Option<Box<dyn LlmProvider>>> {
    let Some(api_key) = config
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
    else {
        warn!(
            backend = %config.backend,
            "{} is not set; answer generation is disabled",
            config.backend.key_var()
        );
        return Ok(None);
    };
    let model = config.model_name().to_string();
    let provider: Box<dyn LlmProvider> = match config.backend {
        GenerationBackend::OpenAi => Box::new(OpenAiProvider::new(
            api_key,
            model,
            config.base_url.as_deref(),
            config.timeout,
        )?),
        GenerationBackend::Anthropic => Box::new(AnthropicProvider::new(
            api_key,
            model,
            config.base_url.as_deref(),
            config.timeout,
        )?),
    };
    info!(backend = %config.backend, model = provider.model(), "generation provider ready");
    Ok(Some(provider))
}
