//! Application context: every pipeline component, built once at start-up.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use lru::LruCache;
use serde::Serialize;
use tracing::{info, warn};

use crate::chunker::{Chunker, ChunkerConfig};
use crate::document::{DocumentLoader, LoadedDocument, DEFAULT_MAX_FILE_SIZE};
use crate::embedder::{Embedder, EmbeddingConfig};
use crate::error::{RagError, RagResult};
use crate::index::{
    IndexBackend, IndexEntry, QueryResult, StoreInfo, VectorIndex, DEFAULT_PERSIST_DIR,
};
use crate::providers::{build_provider, GenerationConfig, LlmProvider};
use crate::rag::{
    Answer, ConversationTurn, PreparedPrompt, QuestionEmbedder, RagGenerator, SamplingParams,
    DEFAULT_TOP_K,
};

/// Default number of cached question embeddings.
pub const DEFAULT_EMBEDDING_CACHE_SIZE: usize = 256;

/// Resolved settings used to build an [`AppContext`].
#[derive(Debug, Clone)]
pub struct ContextSettings {
    /// Chunk size and overlap.
    pub chunker: ChunkerConfig,
    /// Upload size ceiling in bytes.
    pub max_file_size: usize,
    /// Embedding backend settings.
    pub embedding: EmbeddingConfig,
    /// Vector index backend.
    pub index_backend: IndexBackend,
    /// Root directory for persisted index state.
    pub persist_dir: PathBuf,
    /// Generation backend settings.
    pub generation: GenerationConfig,
    /// Cached question embeddings (0 disables the cache).
    pub embedding_cache_size: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            embedding: EmbeddingConfig::default(),
            index_backend: IndexBackend::Flat,
            persist_dir: PathBuf::from(DEFAULT_PERSIST_DIR),
            generation: GenerationConfig::default(),
            embedding_cache_size: DEFAULT_EMBEDDING_CACHE_SIZE,
        }
    }
}

/// Outcome of one successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Uploaded file name.
    pub filename: String,
    /// Segments added to the index.
    pub chunk_count: usize,
    /// Raw upload size.
    pub byte_size: usize,
    /// CRC32 of the upload.
    pub checksum: u32,
}

/// File left out of a batch ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    /// File name.
    pub filename: String,
    /// Why it was skipped.
    pub reason: String,
}

/// Outcome of a multi-file ingest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Files that made it into the index.
    pub ingested: Vec<IngestReport>,
    /// Files that failed and were skipped.
    pub skipped: Vec<SkippedFile>,
}

/// Snapshot served by `/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    /// Always `"ready"` once the context exists.
    pub status: String,
    /// Segments in the index.
    pub documents_count: usize,
    /// Embedding model in use.
    pub embedding_model: String,
    /// Vector index backend in use.
    pub vector_store_type: String,
    /// Whether `/query` and `/chat` can call a model.
    pub generation_enabled: bool,
}

/// Question embedder with an optional LRU cache in front of it.
struct CachedEmbedder {
    embedder: Embedder,
    cache: Option<Mutex<LruCache<String, Vec<f32>>>>,
}

impl QuestionEmbedder for CachedEmbedder {
    fn embed_question(&self, question: &str) -> RagResult<Vec<f32>> {
        if let Some(cache) = &self.cache {
            let hit = cache
                .lock()
                .ok()
                .and_then(|mut guard| guard.get(question).cloned());
            if let Some(hit) = hit {
                return Ok(hit);
            }
        }
        let vector = self.embedder.embed_one(question)?;
        if let Some(cache) = &self.cache {
            if let Ok(mut guard) = cache.lock() {
                guard.put(question.to_string(), vector.clone());
            }
        }
        Ok(vector)
    }
}

fn build_cache(size: usize) -> Option<Mutex<LruCache<String, Vec<f32>>>> {
    NonZeroUsize::new(size).map(|cap| Mutex::new(LruCache::new(cap)))
}

/// Explicit application context shared by every request handler.
pub struct AppContext {
    loader: DocumentLoader,
    embedder: CachedEmbedder,
    index: RwLock<VectorIndex>,
    provider: Option<Box<dyn LlmProvider>>,
    sampling: SamplingParams,
}

impl AppContext {
    /// Builds every component and restores any persisted index.
    pub fn initialize(settings: &ContextSettings) -> RagResult<Self> {
        let chunker = Chunker::new(settings.chunker)?;
        let embedder = Embedder::from_config(&settings.embedding)?;
        let provider = build_provider(&settings.generation)?;

        let mut index = VectorIndex::new(settings.index_backend, settings.persist_dir.clone());
        index.restore_default()?;
        if let Some(dimension) = index.dimension() {
            if dimension != embedder.dimension() {
                return Err(RagError::DimensionMismatch {
                    expected: dimension,
                    actual: embedder.dimension(),
                });
            }
        }
        info!(
            backend = %index.kind(),
            persist_dir = %settings.persist_dir.display(),
            documents = index.count(),
            "application context ready"
        );

        Ok(Self {
            loader: DocumentLoader::new(chunker, settings.max_file_size),
            embedder: CachedEmbedder {
                embedder,
                cache: build_cache(settings.embedding_cache_size),
            },
            index: RwLock::new(index),
            provider,
            sampling: SamplingParams {
                temperature: settings.generation.temperature,
                max_tokens: settings.generation.max_tokens,
            },
        })
    }

    /// Replaces the generation provider.
    pub fn with_provider(mut self, provider: Option<Box<dyn LlmProvider>>) -> Self {
        self.provider = provider;
        self
    }

    /// True when a generation model is configured.
    pub fn generation_enabled(&self) -> bool {
        self.provider.is_some()
    }

    /// Upload size ceiling in bytes.
    pub fn max_file_size(&self) -> usize {
        self.loader.max_file_size()
    }

    /// Validates, chunks, embeds and indexes one PDF upload.
    pub fn ingest(&self, filename: &str, bytes: &[u8]) -> RagResult<IngestReport> {
        let document = self.loader.load(filename, bytes)?;
        self.index_document(document)
    }

    /// Indexes already-extracted text under `source`.
    pub fn ingest_text(&self, source: &str, text: &str) -> RagResult<IngestReport> {
        let document = self.loader.load_text(source, text);
        self.index_document(document)
    }

    /// Ingests every file independently; failures are logged and skipped.
    pub fn ingest_batch<'a>(
        &self,
        files: impl IntoIterator<Item = (&'a str, &'a [u8])>,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for (filename, bytes) in files {
            match self.ingest(filename, bytes) {
                Ok(ingested) => report.ingested.push(ingested),
                Err(err) => {
                    warn!(filename, error = %err, "skipping file");
                    report.skipped.push(SkippedFile {
                        filename: filename.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Embeds outside the index lock; only insert and snapshot hold the write lock.
    fn index_document(&self, document: LoadedDocument) -> RagResult<IngestReport> {
        let report = IngestReport {
            filename: document.filename.clone(),
            chunk_count: document.segments.len(),
            byte_size: document.byte_size,
            checksum: document.checksum,
        };
        if document.segments.is_empty() {
            warn!(filename = %document.filename, "document produced no text segments");
            return Ok(report);
        }
        let texts: Vec<&str> = document
            .segments
            .iter()
            .map(|segment| segment.text.as_str())
            .collect();
        let vectors = self.embedder.embedder.embed_batch(&texts)?;
        let entries = vectors
            .into_iter()
            .zip(document.segments)
            .map(|(vector, segment)| IndexEntry { vector, segment })
            .collect();
        self.write_index()?.insert_committed(entries)?;
        Ok(report)
    }

    /// Renders the prompt for `question` without calling the generation model.
    pub fn prepare(
        &self,
        question: &str,
        history: &[ConversationTurn],
        k: usize,
    ) -> RagResult<PreparedPrompt> {
        let index = self.read_index()?;
        self.generator(&index).prepare(question, history, k)
    }

    /// Answers a standalone question from the `k` nearest segments.
    pub fn ask(&self, question: &str, k: usize) -> RagResult<Answer> {
        let index = self.read_index()?;
        self.generator(&index).answer(question, &[], k)
    }

    /// Answers a follow-up question, folding in the caller's prior turns.
    pub fn chat(&self, question: &str, history: &[ConversationTurn]) -> RagResult<Answer> {
        let index = self.read_index()?;
        self.generator(&index).answer(question, history, DEFAULT_TOP_K)
    }

    /// Nearest segments for `query`; no generation involved.
    pub fn similar(&self, query: &str, k: usize) -> RagResult<QueryResult> {
        if query.trim().is_empty() {
            return Err(RagError::InvalidInput("query must not be empty".to_string()));
        }
        let vector = self.embedder.embed_question(query)?;
        let index = self.read_index()?;
        index.query(&vector, k, None)
    }

    /// Counts and names for `/status`.
    pub fn status(&self) -> RagResult<Status> {
        let index = self.read_index()?;
        Ok(Status {
            status: "ready".to_string(),
            documents_count: index.count(),
            embedding_model: self.embedder.embedder.model_name().to_string(),
            vector_store_type: index.kind().to_string(),
            generation_enabled: self.generation_enabled(),
        })
    }

    /// Index summary for `/documents`.
    pub fn store_info(&self) -> RagResult<StoreInfo> {
        let index = self.read_index()?;
        Ok(index.store_info(self.embedder.embedder.model_name()))
    }

    /// Discards the whole index and its persisted files.
    pub fn clear(&self) -> RagResult<()> {
        self.write_index()?.clear()
    }

    /// Writes the index to its default location.
    pub fn persist(&self) -> RagResult<()> {
        self.read_index()?.persist_default()
    }

    fn generator<'a>(&'a self, index: &'a VectorIndex) -> RagGenerator<'a> {
        RagGenerator::new(&self.embedder, index)
            .with_provider(self.provider.as_deref())
            .with_sampling(self.sampling)
    }

    fn read_index(&self) -> RagResult<RwLockReadGuard<'_, VectorIndex>> {
        self.index
            .read()
            .map_err(|_| RagError::Storage("vector index lock poisoned".to_string()))
    }

    fn write_index(&self) -> RagResult<RwLockWriteGuard<'_, VectorIndex>> {
        self.index
            .write()
            .map_err(|_| RagError::Storage("vector index lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn settings(dir: &std::path::Path) -> ContextSettings {
        ContextSettings {
            chunker: ChunkerConfig::new(50, 10).expect("config"),
            persist_dir: dir.to_path_buf(),
            ..ContextSettings::default()
        }
    }

    #[test]
    fn ingest_text_updates_status_and_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = AppContext::initialize(&settings(dir.path())).expect("context");
        let report = context
            .ingest_text(
                "notes.pdf",
                "AI is intelligence. ML is a subset of AI. DL is a subset of ML.",
            )
            .expect("ingest");
        assert_eq!(report.chunk_count, 2);

        let status = context.status().expect("status");
        assert_eq!(status.documents_count, 2);
        assert_eq!(status.vector_store_type, "flat");
        assert!(!status.generation_enabled);

        let reopened = AppContext::initialize(&settings(dir.path())).expect("reopen");
        assert_eq!(reopened.status().expect("status").documents_count, 2);
    }

    #[test]
    fn failed_snapshot_leaves_no_partial_upload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = AppContext::initialize(&settings(dir.path())).expect("context");
        let blocker = dir.path().join("flat");
        std::fs::write(&blocker, b"not a directory").expect("block");
        let text = "AI is intelligence. ML is a subset of AI. DL is a subset of ML.";

        for _ in 0..2 {
            let err = context.ingest_text("ai.pdf", text).expect_err("blocked");
            assert!(matches!(err, RagError::Storage(_)), "{err}");
            assert_eq!(context.status().expect("status").documents_count, 0);
        }

        std::fs::remove_file(&blocker).expect("unblock");
        context.ingest_text("ai.pdf", text).expect("ingest");
        assert_eq!(context.status().expect("status").documents_count, 2);
    }

    #[test]
    fn upload_validation_runs_without_the_index_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = AppContext::initialize(&settings(dir.path())).expect("context");
        let reader = context.read_index().expect("read lock");
        let err = context
            .ingest("fake.pdf", b"not a pdf at all")
            .expect_err("rejected");
        assert!(matches!(err, RagError::InvalidInput(_)), "{err}");
        assert_eq!(reader.count(), 0);
    }

    #[test]
    fn batch_ingest_skips_bad_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = AppContext::initialize(&settings(dir.path())).expect("context");
        let files: Vec<(&str, &[u8])> = vec![
            ("notes.txt", &b"plain text"[..]),
            ("fake.pdf", &b"not a pdf at all"[..]),
        ];
        let report = context.ingest_batch(files);
        assert!(report.ingested.is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(report.skipped[0].filename, "notes.txt");
    }

    #[test]
    fn similar_requires_an_initialised_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = AppContext::initialize(&settings(dir.path())).expect("context");
        assert!(matches!(
            context.similar("anything", 3),
            Err(RagError::NotInitialized)
        ));
        assert!(matches!(
            context.similar("  ", 3),
            Err(RagError::InvalidInput(_))
        ));
    }

    #[test]
    fn generation_without_key_is_a_configuration_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = AppContext::initialize(&settings(dir.path())).expect("context");
        let err = context.ask("What is ML?", 1).expect_err("disabled");
        assert!(matches!(err, RagError::Configuration(_)));
        let prepared = context.prepare("What is ML?", &[], 1).expect("dry run");
        assert!(prepared.prompt.contains("Question: What is ML?"));
    }

    #[test]
    fn persisted_dimension_must_match_embedder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = AppContext::initialize(&settings(dir.path())).expect("context");
        context.ingest_text("a.pdf", "some words here").expect("ingest");
        drop(context);

        let mut other = settings(dir.path());
        other.embedding.dimensions = Some(64);
        let err = AppContext::initialize(&other).err().expect("mismatch");
        assert!(matches!(err, RagError::DimensionMismatch { .. }));
    }

    #[test]
    fn clear_empties_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = AppContext::initialize(&settings(dir.path())).expect("context");
        context.ingest_text("a.pdf", "some words here").expect("ingest");
        context.clear().expect("clear");
        assert_eq!(context.status().expect("status").documents_count, 0);
        assert_eq!(context.store_info().expect("info").dimension, None);
    }
}
