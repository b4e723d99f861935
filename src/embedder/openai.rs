//! OpenAI-compatible embeddings client.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RagError, RagResult};

/// Default embeddings model for the hosted backend.
pub const DEFAULT_OPENAI_MODEL: &str = "text-embedding-ada-002";
/// Default API root for OpenAI-compatible services.
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Vector length of the known OpenAI embedding models.
pub fn known_dimension(model: &str) -> Option<usize> {
    match model {
        "text-embedding-ada-002" | "text-embedding-3-small" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        _ => None,
    }
}

/// Blocking embeddings client that talks to OpenAI-compatible endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimension: usize,
    dimensions_override: Option<usize>,
    batch_size: usize,
}

impl OpenAiEmbedder {
    /// Builds a new OpenAI embeddings client.
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        dimensions: Option<usize>,
        timeout: Duration,
        batch_size: usize,
    ) -> RagResult<Self> {
        if api_key.trim().is_empty() {
            return Err(RagError::Configuration(
                "OPENAI_API_KEY is required for the openai embedding backend".to_string(),
            ));
        }
        if model.trim().is_empty() {
            return Err(RagError::Configuration(
                "missing OpenAI embedding model name".to_string(),
            ));
        }
        let dimension = match dimensions.or_else(|| known_dimension(model)) {
            Some(0) => {
                return Err(RagError::Configuration(
                    "embedding dimensions must be greater than zero".to_string(),
                ))
            }
            Some(dimension) => dimension,
            None => {
                return Err(RagError::Configuration(format!(
                    "unknown embedding dimension for model `{model}`; pass --embedding-dimensions"
                )))
            }
        };

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
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model: model.to_string(),
            dimension,
            dimensions_override: dimensions,
            batch_size: batch_size.max(1),
        })
    }

    /// Vector length produced by the configured model.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Configured model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Maximum inputs sent per request.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Embeds every input, splitting the work into `batch_size` requests.
    pub fn embed_batch(&self, inputs: &[&str]) -> RagResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(inputs.len());
        for batch in inputs.chunks(self.batch_size) {
            vectors.extend(self.request(batch)?);
        }
        Ok(vectors)
    }

    fn request(&self, inputs: &[&str]) -> RagResult<Vec<Vec<f32>>> {
        debug!(model = %self.model, inputs = inputs.len(), "requesting embeddings");
        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
            dimensions: self.dimensions_override,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|err| RagError::provider("OpenAI embeddings request", err))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(RagError::Provider(format!(
                "OpenAI embeddings request failed ({status}): {body}"
            )));
        }

        let mut parsed: EmbeddingResponse = resp
            .json()
            .map_err(|err| RagError::provider("failed to parse OpenAI embedding response", err))?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != inputs.len() {
            return Err(RagError::Provider(format!(
                "OpenAI returned {} embeddings for {} inputs",
                parsed.data.len(),
                inputs.len()
            )));
        }
        parsed
            .data
            .into_iter()
            .map(|entry| {
                if entry.embedding.len() == self.dimension {
                    Ok(entry.embedding)
                } else {
                    Err(RagError::Provider(format!(
                        "OpenAI returned a {}-dimensional embedding, expected {}",
                        entry.embedding.len(),
                        self.dimension
                    )))
                }
            })
            .collect()
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    #[serde(borrow)]
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}
