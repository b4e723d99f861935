//! Upload validation and PDF text extraction.

use crc32fast::Hasher as Crc32;
use serde::Serialize;
use tracing::{debug, info};

use crate::chunker::{Chunker, Segment};
use crate::error::{RagError, RagResult};

/// Default upload ceiling (10 MiB).
pub const DEFAULT_MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

const PDF_MAGIC: &[u8] = b"%PDF-";

/// Uploaded document after validation, extraction and chunking.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedDocument {
    /// Name the document was uploaded under.
    pub filename: String,
    /// Size of the raw upload in bytes.
    pub byte_size: usize,
    /// CRC32 of the raw upload.
    pub checksum: u32,
    /// Chunks produced from the extracted text, in document order.
    pub segments: Vec<Segment>,
}

/// Rejects names that do not carry a `.pdf` extension.
pub fn ensure_pdf_name(filename: &str) -> RagResult<()> {
    let lower = filename.trim().to_ascii_lowercase();
    if lower.len() > ".pdf".len() && lower.ends_with(".pdf") {
        Ok(())
    } else {
        Err(RagError::InvalidInput(format!(
            "only PDF files are supported, got `{filename}`"
        )))
    }
}

/// True when `bytes` start with the PDF header.
pub fn looks_like_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(PDF_MAGIC)
}

/// Extracts plain text from an in-memory PDF.
pub fn extract_text(bytes: &[u8]) -> RagResult<String> {
    // the extractor panics on some malformed inputs
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(err)) => Err(RagError::InvalidInput(format!(
            "failed to extract PDF text: {err}"
        ))),
        Err(_) => Err(RagError::InvalidInput(
            "failed to extract PDF text: malformed document".to_string(),
        )),
    }
}

/// Turns raw uploads into chunked documents.
#[derive(Debug, Clone)]
pub struct DocumentLoader {
    chunker: Chunker,
    max_file_size: usize,
}

impl DocumentLoader {
    /// Builds a loader around `chunker` that refuses uploads above `max_file_size` bytes.
    pub fn new(chunker: Chunker, max_file_size: usize) -> Self {
        Self {
            chunker,
            max_file_size,
        }
    }

    /// Maximum accepted upload size in bytes.
    pub fn max_file_size(&self) -> usize {
        self.max_file_size
    }

    /// Validates, extracts and chunks one PDF upload.
    pub fn load(&self, filename: &str, bytes: &[u8]) -> RagResult<LoadedDocument> {
        ensure_pdf_name(filename)?;
        if bytes.len() > self.max_file_size {
            return Err(RagError::InvalidInput(format!(
                "{filename} is {} bytes, above the {} byte limit",
                bytes.len(),
                self.max_file_size
            )));
        }
        if !looks_like_pdf(bytes) {
            return Err(RagError::InvalidInput(format!(
                "{filename} does not look like a PDF document"
            )));
        }

        let text = extract_text(bytes)?;
        debug!(filename, chars = text.chars().count(), "extracted pdf text");
        let document = self.finish(filename, bytes, &text);
        info!(
            filename,
            bytes = document.byte_size,
            segments = document.segments.len(),
            checksum = document.checksum,
            "loaded document"
        );
        Ok(document)
    }

    /// Chunks already-extracted text under `source`.
    pub fn load_text(&self, source: &str, text: &str) -> LoadedDocument {
        self.finish(source, text.as_bytes(), text)
    }

    fn finish(&self, filename: &str, bytes: &[u8], text: &str) -> LoadedDocument {
        let mut hasher = Crc32::new();
        hasher.update(bytes);
        LoadedDocument {
            filename: filename.to_string(),
            byte_size: bytes.len(),
            checksum: hasher.finalize(),
            segments: self.chunker.chunk(text, filename),
        }
    }
}
