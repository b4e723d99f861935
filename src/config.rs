//! Command-line and environment configuration shared by both binaries.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::chunker::{ChunkerConfig, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::context::{ContextSettings, DEFAULT_EMBEDDING_CACHE_SIZE};
use crate::document::DEFAULT_MAX_FILE_SIZE;
use crate::embedder::{EmbeddingBackend, EmbeddingConfig, DEFAULT_OPENAI_BASE_URL};
use crate::error::RagResult;
use crate::index::{IndexBackend, DEFAULT_PERSIST_DIR};
use crate::providers::{GenerationBackend, GenerationConfig};

/// Chunking and upload limits.
#[derive(Args, Debug, Clone)]
pub struct ChunkingArgs {
    /// Maximum characters per chunk
    #[arg(long, env = "PDFRAG_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Characters shared between adjacent chunks
    #[arg(long, env = "PDFRAG_CHUNK_OVERLAP", default_value_t = DEFAULT_CHUNK_OVERLAP)]
    pub chunk_overlap: usize,

    /// Largest accepted upload in bytes
    #[arg(long, env = "PDFRAG_MAX_FILE_SIZE", default_value_t = DEFAULT_MAX_FILE_SIZE)]
    pub max_file_size: usize,
}

/// Embedding backend selection.
#[derive(Args, Debug, Clone)]
pub struct EmbeddingArgs {
    /// Embedding backend
    #[arg(long, env = "PDFRAG_EMBEDDING_BACKEND", value_enum, default_value_t = EmbeddingBackend::Local)]
    pub embedding_backend: EmbeddingBackend,

    /// Hosted embedding model (openai backend)
    #[arg(long, env = "PDFRAG_EMBEDDING_MODEL")]
    pub embedding_model: Option<String>,

    /// Vector length override (local dimension or hosted `dimensions`)
    #[arg(long, env = "PDFRAG_EMBEDDING_DIMENSIONS")]
    pub embedding_dimensions: Option<usize>,

    /// Base URL for OpenAI-compatible endpoints
    #[arg(long, env = "PDFRAG_OPENAI_BASE_URL", default_value = DEFAULT_OPENAI_BASE_URL)]
    pub openai_base_url: String,

    /// Max inputs per embedding request
    #[arg(long, env = "PDFRAG_EMBEDDING_BATCH_SIZE", default_value_t = 32)]
    pub embedding_batch_size: usize,

    /// Seconds before embedding requests time out
    #[arg(long, env = "PDFRAG_EMBEDDING_TIMEOUT_SECS", default_value_t = 30)]
    pub embedding_timeout_secs: u64,

    /// Max cached question embeddings (0 disables caching)
    #[arg(long, env = "PDFRAG_EMBEDDING_CACHE_SIZE", default_value_t = DEFAULT_EMBEDDING_CACHE_SIZE)]
    pub embedding_cache_size: usize,

    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,
}

/// Vector index selection.
#[derive(Args, Debug, Clone)]
pub struct IndexArgs {
    /// Vector index backend
    #[arg(long, env = "PDFRAG_VECTOR_STORE", value_enum, default_value_t = IndexBackend::Flat)]
    pub vector_store: IndexBackend,

    /// Directory the index persists under
    #[arg(long, env = "PDFRAG_PERSIST_DIR", default_value = DEFAULT_PERSIST_DIR)]
    pub persist_dir: PathBuf,
}

/// Answer generation settings.
#[derive(Args, Debug, Clone)]
pub struct GenerationArgs {
    /// Generation provider
    #[arg(long, env = "PDFRAG_LLM_PROVIDER", value_enum, default_value_t = GenerationBackend::OpenAi)]
    pub llm_provider: GenerationBackend,

    /// Generation model (defaults per provider)
    #[arg(long, env = "PDFRAG_LLM_MODEL")]
    pub llm_model: Option<String>,

    /// Sampling temperature
    #[arg(long, env = "PDFRAG_TEMPERATURE", default_value_t = 0.7)]
    pub temperature: f32,

    /// Completion token ceiling
    #[arg(long, env = "PDFRAG_MAX_TOKENS", default_value_t = 1000)]
    pub max_tokens: usize,

    /// Seconds before generation requests time out
    #[arg(long, env = "PDFRAG_LLM_TIMEOUT_SECS", default_value_t = 60)]
    pub llm_timeout_secs: u64,

    /// API root override for the generation provider
    #[arg(long, env = "PDFRAG_LLM_BASE_URL")]
    pub llm_base_url: Option<String>,

    /// Anthropic API key
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,
}

/// Every pipeline knob, flattened into each binary's CLI.
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    #[command(flatten)]
    #[allow(missing_docs)]
    pub chunking: ChunkingArgs,

    #[command(flatten)]
    #[allow(missing_docs)]
    pub embedding: EmbeddingArgs,

    #[command(flatten)]
    #[allow(missing_docs)]
    pub index: IndexArgs,

    #[command(flatten)]
    #[allow(missing_docs)]
    pub generation: GenerationArgs,
}

impl PipelineArgs {
    /// Converts the parsed arguments into [`ContextSettings`].
    pub fn build_settings(&self) -> RagResult<ContextSettings> {
        let chunker = ChunkerConfig::new(self.chunking.chunk_size, self.chunking.chunk_overlap)?;
        let embedding = EmbeddingConfig {
            backend: self.embedding.embedding_backend,
            model: self.embedding.embedding_model.clone(),
            dimensions: self.embedding.embedding_dimensions,
            base_url: self.embedding.openai_base_url.clone(),
            api_key: self.embedding.openai_api_key.clone(),
            batch_size: self.embedding.embedding_batch_size.max(1),
            timeout: Duration::from_secs(self.embedding.embedding_timeout_secs.max(1)),
        };
        let generation = GenerationConfig {
            backend: self.generation.llm_provider,
            model: self.generation.llm_model.clone(),
            temperature: self.generation.temperature,
            max_tokens: self.generation.max_tokens.max(1),
            timeout: Duration::from_secs(self.generation.llm_timeout_secs.max(1)),
            api_key: match self.generation.llm_provider {
                GenerationBackend::OpenAi => self.embedding.openai_api_key.clone(),
                GenerationBackend::Anthropic => self.generation.anthropic_api_key.clone(),
            },
            base_url: self.generation.llm_base_url.clone().or_else(|| {
                (self.generation.llm_provider == GenerationBackend::OpenAi
                    && self.embedding.openai_base_url != DEFAULT_OPENAI_BASE_URL)
                    .then(|| self.embedding.openai_base_url.clone())
            }),
        };
        Ok(ContextSettings {
            chunker,
            max_file_size: self.chunking.max_file_size,
            embedding,
            index_backend: self.index.vector_store,
            persist_dir: self.index.persist_dir.clone(),
            generation,
            embedding_cache_size: self.embedding.embedding_cache_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        pipeline: PipelineArgs,
    }

    #[test]
    fn defaults_resolve_to_local_flat_pipeline() {
        let cli = TestCli::try_parse_from(["pdfrag"]).expect("parse");
        let settings = cli.pipeline.build_settings().expect("settings");
        assert_eq!(settings.chunker, ChunkerConfig::new(1000, 200).expect("config"));
        assert_eq!(settings.max_file_size, 10 * 1024 * 1024);
        assert_eq!(settings.embedding.backend, EmbeddingBackend::Local);
        assert_eq!(settings.index_backend, IndexBackend::Flat);
        assert_eq!(settings.persist_dir, PathBuf::from("./data/vector_db"));
        assert_eq!(settings.generation.backend, GenerationBackend::OpenAi);
        assert_eq!(settings.embedding_cache_size, 256);
    }

    #[test]
    fn backend_names_parse_into_enums() {
        let cli = TestCli::try_parse_from([
            "pdfrag",
            "--vector-store",
            "sqlite",
            "--llm-provider",
            "anthropic",
            "--anthropic-api-key",
            "ak-test",
            "--chunk-size",
            "500",
            "--chunk-overlap",
            "50",
        ])
        .expect("parse");
        let settings = cli.pipeline.build_settings().expect("settings");
        assert_eq!(settings.index_backend, IndexBackend::Sqlite);
        assert_eq!(settings.generation.backend, GenerationBackend::Anthropic);
        assert_eq!(settings.generation.api_key.as_deref(), Some("ak-test"));
        assert_eq!(settings.chunker.chunk_size, 500);
    }

    #[test]
    fn unknown_backend_is_rejected_at_parse_time() {
        assert!(TestCli::try_parse_from(["pdfrag", "--vector-store", "faiss"]).is_err());
        assert!(TestCli::try_parse_from(["pdfrag", "--embedding-backend", "huggingface"]).is_err());
    }

    #[test]
    fn overlap_not_smaller_than_chunk_size_is_rejected() {
        let cli = TestCli::try_parse_from(["pdfrag", "--chunk-size", "100", "--chunk-overlap", "100"])
            .expect("parse");
        assert!(cli.pipeline.build_settings().is_err());
    }
}
