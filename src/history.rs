//! Chat transcripts saved as dated JSON files.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{info, warn};

use crate::error::{RagError, RagResult};
use crate::rag::ConversationTurn;

/// File name used when the caller does not pick one.
pub fn default_file_name() -> String {
    format!("chat_history_{}.json", Local::now().format("%Y%m%d_%H%M%S"))
}

/// Writes `turns` as pretty JSON under `dir` and returns the file path.
pub fn save(dir: &Path, turns: &[ConversationTurn], filename: Option<&str>) -> RagResult<PathBuf> {
    fs::create_dir_all(dir).map_err(|err| RagError::storage("create", dir, err))?;
    let name = filename.map_or_else(default_file_name, str::to_string);
    let path = dir.join(name);
    let json = serde_json::to_string_pretty(turns)
        .map_err(|err| RagError::storage("serialize", &path, err))?;
    fs::write(&path, json).map_err(|err| RagError::storage("write", &path, err))?;
    info!(path = %path.display(), turns = turns.len(), "saved chat history");
    Ok(path)
}

/// Reads turns back; a missing or malformed file is an empty history.
pub fn load(path: &Path) -> Vec<ConversationTurn> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "could not read chat history");
            }
            return Vec::new();
        }
    };
    serde_json::from_str(&raw).unwrap_or_else(|err| {
        warn!(path = %path.display(), error = %err, "ignoring malformed chat history");
        Vec::new()
    })
}
