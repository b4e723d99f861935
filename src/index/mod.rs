//! Vector index over embedded segments with two interchangeable backends.
//!
//! `flat` keeps every vector in memory, ranks by squared L2 distance and writes an
//! explicit binary snapshot. `sqlite` writes every insert straight to a database file
//! and ranks by cosine distance. Both lay their files out under
//! `<persist_dir>/<backend>/`.

pub mod distance;
mod flat;
mod sqlite;

use std::fmt;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::chunker::Segment;
use crate::error::{RagError, RagResult};

pub use flat::FlatIndex;
pub use sqlite::SqliteIndex;

/// Default root directory for persisted index state.
pub const DEFAULT_PERSIST_DIR: &str = "./data/vector_db";

/// Vector index backend selected at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    /// In-memory exact search with a binary snapshot.
    Flat,
    /// Persistent SQLite document store.
    Sqlite,
}

impl IndexBackend {
    /// Subdirectory of the persist root owned by this backend.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for IndexBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Vector plus the segment it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Embedding of `segment.text`.
    pub vector: Vec<f32>,
    /// Segment the vector belongs to.
    pub segment: Segment,
}

/// Segment returned by a query together with its distance to the query vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredSegment {
    /// Matched segment.
    pub segment: Segment,
    /// Backend-specific distance; smaller is closer.
    pub distance: f32,
}

/// Nearest-first query hits, at most `k` long.
pub type QueryResult = Vec<ScoredSegment>;

/// Equality predicate over segment metadata keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    conditions: Vec<(String, Value)>,
}

impl MetadataFilter {
    /// Filter that matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `key == value` condition.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((key.into(), value.into()));
        self
    }

    /// True when every condition holds for `segment`.
    pub fn matches(&self, segment: &Segment) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        let metadata = segment.metadata();
        self.conditions
            .iter()
            .all(|(key, expected)| metadata.get(key) == Some(expected))
    }
}

/// Summary of the index exposed over the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreInfo {
    /// Backend name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Root directory the index persists under.
    pub persist_directory: String,
    /// Number of stored segments.
    pub document_count: usize,
    /// Pinned vector dimension, once initialised.
    pub dimension: Option<usize>,
    /// Embedding model feeding the index.
    pub embedding_model: String,
}

#[derive(Debug)]
enum Backend {
    Flat(FlatIndex),
    Sqlite(SqliteIndex),
}

/// Append-only vector index; the backend is fixed at construction.
#[derive(Debug)]
pub struct VectorIndex {
    persist_dir: PathBuf,
    backend: Backend,
}

impl VectorIndex {
    /// Builds an empty, uninitialised index rooted at `persist_dir`.
    pub fn new(kind: IndexBackend, persist_dir: impl Into<PathBuf>) -> Self {
        let persist_dir = persist_dir.into();
        let backend = match kind {
            IndexBackend::Flat => Backend::Flat(FlatIndex::new()),
            IndexBackend::Sqlite => {
                Backend::Sqlite(SqliteIndex::new(Self::location_for(kind, &persist_dir)))
            }
        };
        Self {
            persist_dir,
            backend,
        }
    }

    /// Directory holding `kind`'s files under the persist root `root`.
    pub fn location_for(kind: IndexBackend, root: &Path) -> PathBuf {
        root.join(kind.dir_name())
    }

    /// Backend variant in use.
    pub fn kind(&self) -> IndexBackend {
        match self.backend {
            Backend::Flat(_) => IndexBackend::Flat,
            Backend::Sqlite(_) => IndexBackend::Sqlite,
        }
    }

    /// Root directory this index persists under by default.
    pub fn default_location(&self) -> &Path {
        &self.persist_dir
    }

    /// Number of stored entries.
    pub fn count(&self) -> usize {
        match &self.backend {
            Backend::Flat(index) => index.count(),
            Backend::Sqlite(index) => index.count(),
        }
    }

    /// Pinned dimension; `None` until the first insert or restore.
    pub fn dimension(&self) -> Option<usize> {
        match &self.backend {
            Backend::Flat(index) => index.dimension(),
            Backend::Sqlite(index) => index.dimension(),
        }
    }

    /// True once the index has been created by an insert or restore.
    pub fn is_initialized(&self) -> bool {
        self.dimension().is_some()
    }

    /// Appends entries, creating the index on first use.
    pub fn insert(&mut self, entries: Vec<IndexEntry>) -> RagResult<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let expected = self.dimension().unwrap_or(first.vector.len());
        if expected == 0 {
            return Err(RagError::InvalidInput(
                "cannot index empty embedding vectors".to_string(),
            ));
        }
        if let Some(bad) = entries.iter().find(|entry| entry.vector.len() != expected) {
            return Err(RagError::DimensionMismatch {
                expected,
                actual: bad.vector.len(),
            });
        }
        let added = entries.len();
        match &mut self.backend {
            Backend::Flat(index) => index.insert(expected, entries)?,
            Backend::Sqlite(index) => index.insert(expected, entries)?,
        }
        info!(
            backend = %self.kind(),
            added,
            total = self.count(),
            "inserted index entries"
        );
        Ok(())
    }

    /// Inserts `entries` and writes the default snapshot as one step.
    ///
    /// When the snapshot cannot be written the in-memory index is rolled back to
    /// its previous state, so a failed upload leaves nothing behind.
    pub fn insert_committed(&mut self, entries: Vec<IndexEntry>) -> RagResult<()> {
        let count = self.count();
        let dimension = self.dimension();
        self.insert(entries)?;
        if let Err(err) = self.persist_default() {
            warn!(backend = %self.kind(), error = %err, "snapshot failed; rolling back insert");
            match &mut self.backend {
                Backend::Flat(index) => index.truncate(count, dimension),
                // rows are committed by insert; the working file is the snapshot
                Backend::Sqlite(_) => {}
            }
            return Err(err);
        }
        Ok(())
    }

    /// Returns the `k` nearest entries that pass `filter`, nearest first.
    pub fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> RagResult<QueryResult> {
        let Some(dimension) = self.dimension() else {
            return Err(RagError::NotInitialized);
        };
        if vector.len() != dimension {
            return Err(RagError::DimensionMismatch {
                expected: dimension,
                actual: vector.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        match &self.backend {
            Backend::Flat(index) => Ok(index.query(vector, k, filter)),
            Backend::Sqlite(index) => index.query(vector, k, filter),
        }
    }

    /// Writes the full entry set under `location/<backend>/`.
    pub fn persist(&self, location: &Path) -> RagResult<()> {
        let dir = Self::location_for(self.kind(), location);
        match &self.backend {
            Backend::Flat(index) => index.persist(&dir)?,
            Backend::Sqlite(index) => index.persist(&dir)?,
        }
        info!(backend = %self.kind(), location = %dir.display(), entries = self.count(), "persisted index");
        Ok(())
    }

    /// Writes the index to its default location.
    pub fn persist_default(&self) -> RagResult<()> {
        self.persist(&self.persist_dir)
    }

    /// Replaces the current state with what is stored under `location/<backend>/`.
    ///
    /// Missing state is not an error; the index is left untouched. Returns whether
    /// anything was loaded.
    pub fn restore(&mut self, location: &Path) -> RagResult<bool> {
        let dir = Self::location_for(self.kind(), location);
        let loaded = match &mut self.backend {
            Backend::Flat(index) => index.restore(&dir)?,
            Backend::Sqlite(index) => index.restore(&dir)?,
        };
        if loaded {
            info!(
                backend = %self.kind(),
                location = %dir.display(),
                entries = self.count(),
                "restored index"
            );
        }
        Ok(loaded)
    }

    /// Restores from the default location.
    pub fn restore_default(&mut self) -> RagResult<bool> {
        let root = self.persist_dir.clone();
        self.restore(&root)
    }

    /// Drops every entry and deletes this backend's files under the default location.
    pub fn clear(&mut self) -> RagResult<()> {
        let dir = Self::location_for(self.kind(), &self.persist_dir);
        match &mut self.backend {
            Backend::Flat(index) => index.clear(&dir)?,
            Backend::Sqlite(index) => index.clear()?,
        }
        info!(backend = %self.kind(), "cleared index");
        Ok(())
    }

    /// Summary for status endpoints.
    pub fn store_info(&self, embedding_model: &str) -> StoreInfo {
        StoreInfo {
            kind: self.kind().to_string(),
            persist_directory: self.persist_dir.display().to_string(),
            document_count: self.count(),
            dimension: self.dimension(),
            embedding_model: embedding_model.to_string(),
        }
    }
}

/// Applies `filter` and ranking to `(segment, distance)` candidates in insertion order.
fn select<'a>(
    candidates: impl Iterator<Item = (&'a Segment, f32)>,
    k: usize,
    filter: Option<&MetadataFilter>,
) -> QueryResult {
    let kept: Vec<(&Segment, f32)> = candidates
        .filter(|(segment, _)| filter.map_or(true, |filter| filter.matches(segment)))
        .collect();
    let scored = kept
        .iter()
        .enumerate()
        .map(|(position, (_, distance))| (position, *distance))
        .collect();
    distance::rank(scored, k)
        .into_iter()
        .map(|(position, distance)| ScoredSegment {
            segment: kept[position].0.clone(),
            distance,
        })
        .collect()
}
