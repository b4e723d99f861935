//! Embedding providers: a local feature-hashing model and hosted OpenAI embeddings.

mod local;
mod openai;

use std::fmt;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RagError, RagResult};

pub use local::{HashingEmbedder, DEFAULT_LOCAL_DIMENSION, LOCAL_MODEL_NAME};
pub use openai::{known_dimension, OpenAiEmbedder, DEFAULT_OPENAI_BASE_URL, DEFAULT_OPENAI_MODEL};

/// Embedding backend selected at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// In-process feature hashing, no credentials needed.
    Local,
    /// OpenAI-compatible `/embeddings` endpoint.
    #[value(name = "openai")]
    #[serde(rename = "openai")]
    OpenAi,
}

impl fmt::Display for EmbeddingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::OpenAi => f.write_str("openai"),
        }
    }
}

/// Everything needed to construct an [`Embedder`].
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Which backend to build.
    pub backend: EmbeddingBackend,
    /// Hosted model name; ignored by the local backend.
    pub model: Option<String>,
    /// Explicit vector length (local dimension or hosted `dimensions` override).
    pub dimensions: Option<usize>,
    /// API root of the hosted service.
    pub base_url: String,
    /// Hosted API credential.
    pub api_key: Option<String>,
    /// Maximum inputs per hosted request.
    pub batch_size: usize,
    /// Hosted request timeout.
    pub timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Local,
            model: None,
            dimensions: None,
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            api_key: None,
            batch_size: 32,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Embedding provider resolved once at construction.
#[derive(Debug, Clone)]
pub enum Embedder {
    /// Deterministic local embedder.
    Local(HashingEmbedder),
    /// Hosted OpenAI embeddings.
    OpenAi(OpenAiEmbedder),
}

impl Embedder {
    /// Builds the configured backend; the hosted one requires a credential.
    pub fn from_config(config: &EmbeddingConfig) -> RagResult<Self> {
        let embedder = match config.backend {
            EmbeddingBackend::Local => {
                let dimension = config.dimensions.unwrap_or(DEFAULT_LOCAL_DIMENSION);
                if dimension == 0 {
                    return Err(RagError::Configuration(
                        "embedding dimensions must be greater than zero".to_string(),
                    ));
                }
                Self::Local(HashingEmbedder::new(dimension))
            }
            EmbeddingBackend::OpenAi => {
                let api_key = config
                    .api_key
                    .as_deref()
                    .filter(|key| !key.trim().is_empty())
                    .ok_or_else(|| {
                        RagError::Configuration(
                            "OPENAI_API_KEY is required for the openai embedding backend"
                                .to_string(),
                        )
                    })?;
                let model = config.model.as_deref().unwrap_or(DEFAULT_OPENAI_MODEL);
                Self::OpenAi(OpenAiEmbedder::new(
                    api_key,
                    &config.base_url,
                    model,
                    config.dimensions,
                    config.timeout,
                    config.batch_size,
                )?)
            }
        };
        info!(
            backend = %embedder.kind(),
            model = embedder.model_name(),
            dimension = embedder.dimension(),
            "embedding provider ready"
        );
        Ok(embedder)
    }

    /// Embeds every text, preserving order.
    pub fn embed_batch(&self, texts: &[&str]) -> RagResult<Vec<Vec<f32>>> {
        match self {
            Self::Local(embedder) => Ok(texts.iter().map(|text| embedder.embed(text)).collect()),
            Self::OpenAi(embedder) => embedder.embed_batch(texts),
        }
    }

    /// Embeds a single text.
    pub fn embed_one(&self, text: &str) -> RagResult<Vec<f32>> {
        match self {
            Self::Local(embedder) => Ok(embedder.embed(text)),
            Self::OpenAi(embedder) => embedder
                .embed_batch(&[text])?
                .pop()
                .ok_or_else(|| RagError::Provider("OpenAI returned no embedding".to_string())),
        }
    }

    /// Vector length this provider produces.
    pub fn dimension(&self) -> usize {
        match self {
            Self::Local(embedder) => embedder.dimension(),
            Self::OpenAi(embedder) => embedder.dimension(),
        }
    }

    /// Model name reported to clients.
    pub fn model_name(&self) -> &str {
        match self {
            Self::Local(_) => LOCAL_MODEL_NAME,
            Self::OpenAi(embedder) => embedder.model(),
        }
    }

    /// Backend variant in use.
    pub fn kind(&self) -> EmbeddingBackend {
        match self {
            Self::Local(_) => EmbeddingBackend::Local,
            Self::OpenAi(_) => EmbeddingBackend::OpenAi,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn local_backend_is_the_default() {
        let embedder = Embedder::from_config(&EmbeddingConfig::default()).expect("embedder");
        assert_eq!(embedder.kind(), EmbeddingBackend::Local);
        assert_eq!(embedder.dimension(), DEFAULT_LOCAL_DIMENSION);
        assert_eq!(embedder.model_name(), LOCAL_MODEL_NAME);
    }

    #[test]
    fn batch_and_single_embeddings_agree() {
        let embedder = Embedder::from_config(&EmbeddingConfig {
            dimensions: Some(32),
            ..EmbeddingConfig::default()
        })
        .expect("embedder");
        let batch = embedder.embed_batch(&["alpha beta", "gamma"]).expect("batch");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1], embedder.embed_one("gamma").expect("one"));
        assert!(batch.iter().all(|vector| vector.len() == 32));
    }

    #[test]
    fn hosted_backend_without_key_is_a_configuration_error() {
        let err = Embedder::from_config(&EmbeddingConfig {
            backend: EmbeddingBackend::OpenAi,
            api_key: Some(String::new()),
            ..EmbeddingConfig::default()
        })
        .expect_err("missing key");
        assert!(matches!(err, RagError::Configuration(_)));
    }

    #[test]
    fn hosted_backend_reports_model_dimension() {
        let embedder = Embedder::from_config(&EmbeddingConfig {
            backend: EmbeddingBackend::OpenAi,
            api_key: Some("sk-test".into()),
            model: Some("text-embedding-3-large".into()),
            ..EmbeddingConfig::default()
        })
        .expect("embedder");
        assert_eq!(embedder.dimension(), 3072);
        assert_eq!(embedder.model_name(), "text-embedding-3-large");
    }
}
