//! Recursive character chunking for extracted document text.

use std::collections::VecDeque;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{RagError, RagResult};

/// Default maximum characters per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;
/// Default characters carried over between adjacent chunks.
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Paragraph, line, sentence, word, then single characters.
const SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", " ", ""];
const CHARACTERS: [&str; 1] = [""];

/// Chunk of source text plus its position inside the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Trimmed chunk text.
    pub text: String,
    /// Identifier of the originating document (usually its file name).
    pub source: String,
    /// Zero-based position of the chunk within its document.
    pub sequence_index: usize,
    /// Chunk length in characters.
    pub length: usize,
    /// Byte offset of the chunk inside the extracted document text.
    pub start_offset: usize,
}

impl Segment {
    /// Metadata map exposed to API clients and matched by index filters.
    pub fn metadata(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("source".into(), Value::from(self.source.as_str()));
        map.insert("chunk_id".into(), Value::from(self.sequence_index));
        map.insert("chunk_size".into(), Value::from(self.length));
        map.insert("start_offset".into(), Value::from(self.start_offset));
        map.insert("file_type".into(), Value::from(file_type(&self.source)));
        map
    }
}

fn file_type(source: &str) -> String {
    Path::new(source)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| "text".to_string())
}

/// Size and overlap knobs for [`Chunker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Maximum characters per chunk.
    pub chunk_size: usize,
    /// Maximum characters repeated at the start of the following chunk.
    pub overlap: usize,
}

impl ChunkerConfig {
    /// Builds a validated config.
    pub fn new(chunk_size: usize, overlap: usize) -> RagResult<Self> {
        let config = Self {
            chunk_size,
            overlap,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects a zero chunk size or an overlap that would swallow a whole chunk.
    pub fn validate(&self) -> RagResult<()> {
        if self.chunk_size == 0 {
            return Err(RagError::InvalidInput(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(RagError::InvalidInput(format!(
                "chunk overlap {} must be smaller than chunk_size {}",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

/// Stateless splitter that turns text into overlapping [`Segment`]s.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    /// Builds a chunker after validating `config`.
    pub fn new(config: ChunkerConfig) -> RagResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Returns the active config.
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Splits `text` into ordered segments attributed to `source`.
    pub fn chunk(&self, text: &str, source: &str) -> Vec<Segment> {
        let mut spans = Vec::new();
        split_span(
            text,
            Span {
                start: 0,
                end: text.len(),
            },
            &SEPARATORS,
            &self.config,
            &mut spans,
        );
        spans
            .into_iter()
            .enumerate()
            .map(|(sequence_index, span)| {
                let body = &text[span.start..span.end];
                Segment {
                    text: body.to_string(),
                    source: source.to_string(),
                    sequence_index,
                    length: body.chars().count(),
                    start_offset: span.start,
                }
            })
            .collect()
    }
}

/// One-shot helper: validates the parameters and chunks `text`.
pub fn chunk(
    text: &str,
    source: &str,
    chunk_size: usize,
    overlap: usize,
) -> RagResult<Vec<Segment>> {
    let chunker = Chunker::new(ChunkerConfig::new(chunk_size, overlap)?)?;
    Ok(chunker.chunk(text, source))
}

/// Byte range inside the text being chunked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    fn contains(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

fn split_span(
    text: &str,
    span: Span,
    separators: &[&str],
    config: &ChunkerConfig,
    out: &mut Vec<Span>,
) {
    let body = &text[span.start..span.end];
    let position = separators
        .iter()
        .position(|sep| sep.is_empty() || body.contains(sep))
        .unwrap_or(separators.len().saturating_sub(1));
    let separator = separators.get(position).copied().unwrap_or("");
    let remaining = match separators.get(position + 1..) {
        Some(rest) if !rest.is_empty() => rest,
        _ => &CHARACTERS[..],
    };

    let mut pending: Vec<Span> = Vec::new();
    for piece in split_pieces(text, span, separator) {
        if char_len(text, piece) <= config.chunk_size {
            pending.push(piece);
            continue;
        }
        if !pending.is_empty() {
            merge_pieces(text, &pending, config, out);
            pending.clear();
        }
        split_span(text, piece, remaining, config, out);
    }
    if !pending.is_empty() {
        merge_pieces(text, &pending, config, out);
    }
}

/// Splits `span` after every occurrence of `separator`; pieces keep their separator.
fn split_pieces(text: &str, span: Span, separator: &str) -> Vec<Span> {
    let body = &text[span.start..span.end];
    if separator.is_empty() {
        return body
            .char_indices()
            .map(|(offset, ch)| Span {
                start: span.start + offset,
                end: span.start + offset + ch.len_utf8(),
            })
            .collect();
    }

    let mut pieces = Vec::new();
    let mut cursor = 0usize;
    for (idx, _) in body.match_indices(separator) {
        let end = idx + separator.len();
        pieces.push(Span {
            start: span.start + cursor,
            end: span.start + end,
        });
        cursor = end;
    }
    if cursor < body.len() {
        pieces.push(Span {
            start: span.start + cursor,
            end: span.end,
        });
    }
    pieces
}

fn merge_pieces(text: &str, pieces: &[Span], config: &ChunkerConfig, out: &mut Vec<Span>) {
    let mut window: VecDeque<(Span, usize)> = VecDeque::new();
    let mut total = 0usize;
    for &piece in pieces {
        let len = char_len(text, piece);
        if total + len > config.chunk_size && !window.is_empty() {
            flush_window(text, &window, out);
            while total > config.overlap || (total > 0 && total + len > config.chunk_size) {
                let Some((_, dropped)) = window.pop_front() else {
                    break;
                };
                total -= dropped;
            }
        }
        window.push_back((piece, len));
        total += len;
    }
    flush_window(text, &window, out);
}

fn flush_window(text: &str, window: &VecDeque<(Span, usize)>, out: &mut Vec<Span>) {
    let (Some((first, _)), Some((last, _))) = (window.front(), window.back()) else {
        return;
    };
    let Some(span) = trim_span(
        text,
        Span {
            start: first.start,
            end: last.end,
        },
    ) else {
        return;
    };
    // a trailing window of overlap plus whitespace adds nothing new
    if out.last().is_some_and(|previous| previous.contains(&span)) {
        return;
    }
    out.push(span);
}

fn trim_span(text: &str, span: Span) -> Option<Span> {
    let body = &text[span.start..span.end];
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    let start = span.start + (body.len() - body.trim_start().len());
    Some(Span {
        start,
        end: start + trimmed.len(),
    })
}

fn char_len(text: &str, span: Span) -> usize {
    text[span.start..span.end].chars().count()
}
