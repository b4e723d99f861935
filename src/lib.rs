#![warn(missing_docs)]
//! Question answering over uploaded PDFs.
//!
//! Uploads are chunked ([`chunker`]), embedded ([`embedder`]) and stored in a
//! vector index ([`index`]). Questions are answered by retrieving the nearest
//! segments and conditioning a hosted model on them ([`rag`]). [`context`] wires
//! the components together once per process and [`api`] exposes them over HTTP.

pub mod api;
pub mod chunker;
pub mod config;
pub mod context;
pub mod document;
pub mod embedder;
pub mod error;
pub mod history;
pub mod index;
pub mod providers;
pub mod rag;
pub mod telemetry;

pub use chunker::{chunk, Chunker, ChunkerConfig, Segment};
pub use context::{AppContext, ContextSettings};
pub use embedder::{Embedder, EmbeddingBackend};
pub use error::{RagError, RagResult};
pub use index::{IndexBackend, IndexEntry, MetadataFilter, QueryResult, ScoredSegment, VectorIndex};
pub use providers::{GenerationBackend, LlmProvider, ProviderRequest};
pub use rag::{Answer, ConversationTurn, RagGenerator};
