//! In-memory exact search with a checksummed binary snapshot.
//!
//! Snapshot layout (`index.bin`, all integers little-endian):
//!
//! | bytes | field |
//! |---|---|
//! | 8 | magic `PDFRAGIX` |
//! | 4 | format version |
//! | 4 | dimension |
//! | 8 | entry count |
//! | 4 | CRC32 of the vector payload |
//! | count * dimension * 4 | `f32` payload |
//!
//! `segments.jsonl` holds one serialized segment per line, in entry order.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crc32fast::Hasher as Crc32;

use super::distance::{decode_vector, encode_vector, squared_l2};
use super::{select, IndexEntry, MetadataFilter, QueryResult};
use crate::chunker::Segment;
use crate::error::{RagError, RagResult};

const MAGIC: &[u8; 8] = b"PDFRAGIX";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 8 + 4 + 4 + 8 + 4;
const VECTORS_FILE: &str = "index.bin";
const SEGMENTS_FILE: &str = "segments.jsonl";

/// Flat vector store: vectors are kept contiguous, one row per segment.
#[derive(Debug, Default)]
pub struct FlatIndex {
    dimension: Option<usize>,
    vectors: Vec<f32>,
    segments: Vec<Segment>,
}

impl FlatIndex {
    /// Empty, uninitialised index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn count(&self) -> usize {
        self.segments.len()
    }

    /// Pinned dimension, if any.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub(super) fn insert(&mut self, dimension: usize, entries: Vec<IndexEntry>) -> RagResult<()> {
        self.dimension = Some(dimension);
        self.vectors.reserve(entries.len() * dimension);
        self.segments.reserve(entries.len());
        for entry in entries {
            self.vectors.extend_from_slice(&entry.vector);
            self.segments.push(entry.segment);
        }
        Ok(())
    }

    /// Drops every entry past `count` and restores the previously pinned dimension.
    pub(super) fn truncate(&mut self, count: usize, dimension: Option<usize>) {
        if let Some(pinned) = self.dimension {
            self.vectors.truncate(count * pinned);
        }
        self.segments.truncate(count);
        self.dimension = dimension;
    }

    pub(super) fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> QueryResult {
        let Some(dimension) = self.dimension else {
            return Vec::new();
        };
        let candidates = self
            .vectors
            .chunks_exact(dimension)
            .zip(&self.segments)
            .map(|(row, segment)| (segment, squared_l2(vector, row)));
        select(candidates, k, filter)
    }

    pub(super) fn persist(&self, dir: &Path) -> RagResult<()> {
        let Some(dimension) = self.dimension else {
            return Ok(());
        };
        fs::create_dir_all(dir).map_err(|err| RagError::storage("create", dir, err))?;

        let segments_path = dir.join(SEGMENTS_FILE);
        write_atomically(&segments_path, |out| {
            for segment in &self.segments {
                serde_json::to_writer(&mut *out, segment)?;
                out.write_all(b"\n")?;
            }
            Ok(())
        })?;

        let payload = encode_vector(&self.vectors);
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let checksum = hasher.finalize();
        let vectors_path = dir.join(VECTORS_FILE);
        write_atomically(&vectors_path, |out| {
            out.write_all(MAGIC)?;
            out.write_all(&VERSION.to_le_bytes())?;
            out.write_all(&(dimension as u32).to_le_bytes())?;
            out.write_all(&(self.segments.len() as u64).to_le_bytes())?;
            out.write_all(&checksum.to_le_bytes())?;
            out.write_all(&payload)?;
            Ok(())
        })
    }

    pub(super) fn restore(&mut self, dir: &Path) -> RagResult<bool> {
        let vectors_path = dir.join(VECTORS_FILE);
        let segments_path = dir.join(SEGMENTS_FILE);
        match (vectors_path.exists(), segments_path.exists()) {
            (false, false) => return Ok(false),
            (true, false) => return Err(RagError::corrupt(&segments_path, "file is missing")),
            (false, true) => return Err(RagError::corrupt(&vectors_path, "file is missing")),
            (true, true) => {}
        }

        let bytes =
            fs::read(&vectors_path).map_err(|err| RagError::storage("read", &vectors_path, err))?;
        let header = SnapshotHeader::parse(&bytes).map_err(|reason| RagError::corrupt(&vectors_path, reason))?;
        let payload = &bytes[HEADER_LEN..];
        let mut hasher = Crc32::new();
        hasher.update(payload);
        if hasher.finalize() != header.checksum {
            return Err(RagError::corrupt(&vectors_path, "vector checksum mismatch"));
        }
        let vectors = decode_vector(payload, header.count * header.dimension)
            .map_err(|reason| RagError::corrupt(&vectors_path, reason))?;

        let segments = read_segments(&segments_path)?;
        if segments.len() != header.count {
            return Err(RagError::corrupt(
                &segments_path,
                format!(
                    "expected {} segments, found {}",
                    header.count,
                    segments.len()
                ),
            ));
        }

        self.dimension = Some(header.dimension);
        self.vectors = vectors;
        self.segments = segments;
        Ok(true)
    }

    pub(super) fn clear(&mut self, dir: &Path) -> RagResult<()> {
        *self = Self::new();
        for name in [VECTORS_FILE, SEGMENTS_FILE] {
            remove_if_present(&dir.join(name))?;
        }
        Ok(())
    }
}

struct SnapshotHeader {
    dimension: usize,
    count: usize,
    checksum: u32,
}

impl SnapshotHeader {
    fn parse(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < HEADER_LEN {
            return Err(format!("header truncated at {} bytes", bytes.len()));
        }
        if &bytes[..8] != MAGIC {
            return Err("bad magic".to_string());
        }
        let version = u32::from_le_bytes(field(bytes, 8));
        if version != VERSION {
            return Err(format!("unsupported snapshot version {version}"));
        }
        let dimension = u32::from_le_bytes(field(bytes, 12)) as usize;
        let count = u64::from_le_bytes(field(bytes, 16)) as usize;
        let checksum = u32::from_le_bytes(field(bytes, 24));
        if dimension == 0 {
            return Err("dimension is zero".to_string());
        }
        let expected = count
            .checked_mul(dimension)
            .and_then(|values| values.checked_mul(4))
            .ok_or_else(|| "entry count overflows".to_string())?;
        let actual = bytes.len() - HEADER_LEN;
        if actual != expected {
            return Err(format!(
                "payload is {actual} bytes, header promises {expected}"
            ));
        }
        Ok(Self {
            dimension,
            count,
            checksum,
        })
    }
}

fn field<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

fn read_segments(path: &Path) -> RagResult<Vec<Segment>> {
    let file = File::open(path).map_err(|err| RagError::storage("open", path, err))?;
    let mut segments = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|err| RagError::storage("read", path, err))?;
        if line.trim().is_empty() {
            continue;
        }
        let segment = serde_json::from_str(&line).map_err(|err| {
            RagError::corrupt(path, format!("line {}: {err}", line_no + 1))
        })?;
        segments.push(segment);
    }
    Ok(segments)
}

fn write_atomically(
    path: &Path,
    write: impl FnOnce(&mut BufWriter<File>) -> Result<(), Box<dyn std::error::Error>>,
) -> RagResult<()> {
    let tmp = path.with_extension("tmp");
    let file = File::create(&tmp).map_err(|err| RagError::storage("create", &tmp, err))?;
    let mut out = BufWriter::new(file);
    write(&mut out).map_err(|err| RagError::storage("write", &tmp, err))?;
    out.flush()
        .map_err(|err| RagError::storage("flush", &tmp, err))?;
    drop(out);
    fs::rename(&tmp, path).map_err(|err| RagError::storage("rename", path, err))
}

fn remove_if_present(path: &Path) -> RagResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(RagError::storage("remove", path, err)),
    }
}
