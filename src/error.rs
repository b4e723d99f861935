//! Error taxonomy shared by every pipeline stage.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result alias used throughout the library.
pub type RagResult<T> = Result<T, RagError>;

/// Flat set of failures surfaced by the pipeline.
#[derive(Debug, Error)]
pub enum RagError {
    /// Missing credential or unusable backend configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Caller supplied something the pipeline refuses to process.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The vector index was queried before anything was inserted.
    #[error("vector index has not been initialized")]
    NotInitialized,
    /// A vector does not match the dimension pinned by the index or embedder.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension pinned by the index or provider.
        expected: usize,
        /// Dimension that was offered.
        actual: usize,
    },
    /// An external model or service call failed.
    #[error("provider error: {0}")]
    Provider(String),
    /// Embedding the question failed; wraps the originating error.
    #[error("embedding failed: {0}")]
    EmbeddingFailure(#[source] Box<RagError>),
    /// The generation call failed; wraps the originating error.
    #[error("generation failed: {0}")]
    GenerationFailure(#[source] Box<RagError>),
    /// Reading or writing persisted state failed.
    #[error("storage error: {0}")]
    Storage(String),
    /// Persisted index state exists but cannot be trusted.
    #[error("corrupt index at {}: {reason}", path.display())]
    CorruptIndex {
        /// Location of the offending snapshot.
        path: PathBuf,
        /// What failed validation.
        reason: String,
    },
}

impl RagError {
    /// Wraps an external failure with a short description of the call that failed.
    pub fn provider(context: impl Display, err: impl Display) -> Self {
        Self::Provider(format!("{context}: {err}"))
    }

    /// Wraps an I/O or database failure with the action and path involved.
    pub fn storage(action: &str, path: &Path, err: impl Display) -> Self {
        Self::Storage(format!("failed to {action} {}: {err}", path.display()))
    }

    /// Builds a [`RagError::CorruptIndex`] for `path`.
    pub fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::CorruptIndex {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// True when the error was caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }
}
