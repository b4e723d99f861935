//! SQLite-backed document store; every insert is durable immediately.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use super::distance::{cosine_distance, decode_vector, encode_vector};
use super::{select, IndexEntry, MetadataFilter, QueryResult};
use crate::chunker::Segment;
use crate::error::{RagError, RagResult};

const DB_FILE: &str = "index.sqlite3";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS index_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    sequence_index INTEGER NOT NULL,
    length INTEGER NOT NULL,
    start_offset INTEGER NOT NULL,
    text TEXT NOT NULL,
    embedding BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entries_source ON entries(source);
"#;

/// Vector store kept in a single SQLite database file.
#[derive(Debug)]
pub struct SqliteIndex {
    path: PathBuf,
    conn: Option<Mutex<Connection>>,
    dimension: Option<usize>,
    count: usize,
}

impl SqliteIndex {
    /// Store whose database lives at `dir/index.sqlite3`; nothing is opened yet.
    pub fn new(dir: PathBuf) -> Self {
        Self {
            path: dir.join(DB_FILE),
            conn: None,
            dimension: None,
            count: 0,
        }
    }

    /// Path of the working database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stored entries.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Pinned dimension, if any.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub(super) fn insert(&mut self, dimension: usize, entries: Vec<IndexEntry>) -> RagResult<()> {
        if self.conn.is_none() {
            self.conn = Some(Mutex::new(open_working(&self.path)?));
        }
        let path = self.path.clone();
        let added = entries.len();
        {
            let mut conn = self.lock()?;
            let tx = conn
                .transaction()
                .map_err(|err| RagError::storage("begin transaction on", &path, err))?;
            pin_dimension(&tx, dimension, &path)?;
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO entries (source, sequence_index, length, start_offset, text, embedding)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )
                    .map_err(|err| RagError::storage("prepare insert on", &path, err))?;
                for entry in &entries {
                    let segment = &entry.segment;
                    stmt.execute(params![
                        segment.source,
                        segment.sequence_index as i64,
                        segment.length as i64,
                        segment.start_offset as i64,
                        segment.text,
                        encode_vector(&entry.vector),
                    ])
                    .map_err(|err| RagError::storage("insert into", &path, err))?;
                }
            }
            tx.commit()
                .map_err(|err| RagError::storage("commit", &path, err))?;
        }
        self.dimension = Some(dimension);
        self.count += added;
        Ok(())
    }

    pub(super) fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> RagResult<QueryResult> {
        let Some(dimension) = self.dimension else {
            return Ok(Vec::new());
        };
        let conn = self.lock()?;
        let rows = load_entries(&conn, dimension, &self.path)?;
        let scored: Vec<(Segment, f32)> = rows
            .into_iter()
            .map(|entry| {
                let distance = cosine_distance(vector, &entry.vector);
                (entry.segment, distance)
            })
            .collect();
        Ok(select(
            scored.iter().map(|(segment, distance)| (segment, *distance)),
            k,
            filter,
        ))
    }

    /// Already durable at the working path; other locations get a `VACUUM INTO` copy.
    pub(super) fn persist(&self, dir: &Path) -> RagResult<()> {
        if self.conn.is_none() {
            return Ok(());
        }
        let target = dir.join(DB_FILE);
        if same_file(&target, &self.path) {
            return Ok(());
        }
        fs::create_dir_all(dir).map_err(|err| RagError::storage("create", dir, err))?;
        remove_if_present(&target)?;
        let conn = self.lock()?;
        conn.execute("VACUUM INTO ?1", params![target.to_string_lossy()])
            .map_err(|err| RagError::storage("copy index to", &target, err))?;
        Ok(())
    }

    pub(super) fn restore(&mut self, dir: &Path) -> RagResult<bool> {
        let source = dir.join(DB_FILE);
        if !source.exists() {
            return Ok(false);
        }

        if same_file(&source, &self.path) {
            self.conn = None;
            let conn = Connection::open(&source)
                .and_then(|conn| conn.execute_batch(SCHEMA_SQL).map(|_| conn))
                .map_err(|err| RagError::corrupt(&source, err.to_string()))?;
            let state = inspect(&conn, &source)?;
            self.conn = Some(Mutex::new(conn));
            return Ok(match state {
                Some((dimension, count)) => {
                    self.dimension = Some(dimension);
                    self.count = count;
                    true
                }
                None => {
                    self.dimension = None;
                    self.count = 0;
                    false
                }
            });
        }

        let snapshot = Connection::open(&source)
            .map_err(|err| RagError::corrupt(&source, err.to_string()))?;
        let Some((dimension, _)) = inspect(&snapshot, &source)? else {
            return Ok(false);
        };
        let entries = load_entries(&snapshot, dimension, &source)?;
        drop(snapshot);

        self.clear()?;
        if entries.is_empty() {
            let conn = open_working(&self.path)?;
            pin_dimension(&conn, dimension, &self.path)?;
            self.conn = Some(Mutex::new(conn));
        } else {
            self.insert(dimension, entries)?;
        }
        self.dimension = Some(dimension);
        Ok(true)
    }

    pub(super) fn clear(&mut self) -> RagResult<()> {
        self.conn = None;
        self.dimension = None;
        self.count = 0;
        for suffix in ["", "-journal", "-wal", "-shm"] {
            let mut name = self.path.clone().into_os_string();
            name.push(suffix);
            remove_if_present(Path::new(&name))?;
        }
        Ok(())
    }

    fn lock(&self) -> RagResult<MutexGuard<'_, Connection>> {
        let conn = self.conn.as_ref().ok_or(RagError::NotInitialized)?;
        conn.lock()
            .map_err(|_| RagError::Storage("sqlite connection lock poisoned".to_string()))
    }
}

fn open_working(path: &Path) -> RagResult<Connection> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| RagError::storage("create", parent, err))?;
    }
    let conn = Connection::open(path).map_err(|err| RagError::storage("open", path, err))?;
    conn.execute_batch(SCHEMA_SQL)
        .map_err(|err| RagError::storage("initialise schema in", path, err))?;
    Ok(conn)
}

fn pin_dimension(conn: &Connection, dimension: usize, path: &Path) -> RagResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO index_meta (key, value) VALUES ('dimension', ?1)",
        params![dimension.to_string()],
    )
    .map_err(|err| RagError::storage("write metadata to", path, err))?;
    Ok(())
}

/// Reads the pinned dimension and entry count, validating every stored vector length.
fn inspect(conn: &Connection, path: &Path) -> RagResult<Option<(usize, usize)>> {
    let corrupt = |err: rusqlite::Error| RagError::corrupt(path, err.to_string());
    let tables: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('index_meta', 'entries')",
            [],
            |row| row.get(0),
        )
        .map_err(corrupt)?;
    if tables != 2 {
        return Err(RagError::corrupt(path, "index tables are missing"));
    }
    let dimension: Option<String> = conn
        .query_row(
            "SELECT value FROM index_meta WHERE key = 'dimension'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(corrupt)?;
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))
        .map_err(corrupt)?;

    let Some(dimension) = dimension else {
        if count == 0 {
            return Ok(None);
        }
        return Err(RagError::corrupt(path, "entries stored without a dimension"));
    };
    let dimension: usize = dimension
        .parse()
        .ok()
        .filter(|dimension| *dimension > 0)
        .ok_or_else(|| RagError::corrupt(path, format!("invalid dimension `{dimension}`")))?;
    let malformed: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM entries WHERE length(embedding) != ?1",
            params![(dimension * 4) as i64],
            |row| row.get(0),
        )
        .map_err(corrupt)?;
    if malformed > 0 {
        return Err(RagError::corrupt(
            path,
            format!("{malformed} entries do not have {dimension}-dimensional vectors"),
        ));
    }
    Ok(Some((dimension, count as usize)))
}

fn load_entries(conn: &Connection, dimension: usize, path: &Path) -> RagResult<Vec<IndexEntry>> {
    let corrupt = |err: rusqlite::Error| RagError::corrupt(path, err.to_string());
    let mut stmt = conn
        .prepare(
            "SELECT source, sequence_index, length, start_offset, text, embedding
             FROM entries ORDER BY id",
        )
        .map_err(corrupt)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                Segment {
                    source: row.get(0)?,
                    sequence_index: row.get::<_, i64>(1)? as usize,
                    length: row.get::<_, i64>(2)? as usize,
                    start_offset: row.get::<_, i64>(3)? as usize,
                    text: row.get(4)?,
                },
                row.get::<_, Vec<u8>>(5)?,
            ))
        })
        .map_err(corrupt)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(corrupt)?;

    rows.into_iter()
        .map(|(segment, blob)| {
            let vector =
                decode_vector(&blob, dimension).map_err(|reason| RagError::corrupt(path, reason))?;
            Ok(IndexEntry { vector, segment })
        })
        .collect()
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn remove_if_present(path: &Path) -> RagResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(RagError::storage("remove", path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(idx: usize) -> IndexEntry {
        IndexEntry {
            vector: vec![1.0, idx as f32],
            segment: Segment {
                text: format!("row {idx}"),
                source: "doc.pdf".to_string(),
                sequence_index: idx,
                length: 5,
                start_offset: idx * 5,
            },
        }
    }

    #[test]
    fn inserts_are_visible_to_a_second_handle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = SqliteIndex::new(dir.path().to_path_buf());
        writer.insert(2, vec![entry(0), entry(1)]).expect("insert");
        assert!(writer.path().exists());

        let mut reader = SqliteIndex::new(dir.path().to_path_buf());
        assert!(reader.restore(dir.path()).expect("restore"));
        assert_eq!(reader.count(), 2);
        assert_eq!(reader.dimension(), Some(2));
    }

    #[test]
    fn empty_snapshot_keeps_its_dimension_across_restarts() {
        let export = tempfile::tempdir().expect("export");
        let conn = open_working(&export.path().join(DB_FILE)).expect("open");
        pin_dimension(&conn, 3, export.path()).expect("pin");
        drop(conn);

        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = SqliteIndex::new(dir.path().to_path_buf());
        assert!(index.restore(export.path()).expect("restore"));
        assert_eq!(index.dimension(), Some(3));
        assert_eq!(index.count(), 0);
        drop(index);

        let mut reopened = SqliteIndex::new(dir.path().to_path_buf());
        assert!(reopened.restore(dir.path()).expect("reopen"));
        assert_eq!(reopened.dimension(), Some(3));
        assert_eq!(reopened.count(), 0);
    }

    #[test]
    fn garbage_database_is_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(DB_FILE), b"definitely not sqlite").expect("write");
        let mut index = SqliteIndex::new(dir.path().to_path_buf());
        let err = index.restore(dir.path()).expect_err("corrupt");
        assert!(matches!(err, RagError::CorruptIndex { .. }), "{err}");
    }

    #[test]
    fn short_vector_blob_is_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut index = SqliteIndex::new(dir.path().to_path_buf());
        index.insert(2, vec![entry(0)]).expect("insert");
        {
            let conn = index.lock().expect("lock");
            conn.execute("UPDATE entries SET embedding = x'00'", [])
                .expect("update");
        }
        let mut reader = SqliteIndex::new(dir.path().to_path_buf());
        let err = reader.restore(dir.path()).expect_err("corrupt");
        assert!(err.to_string().contains("2-dimensional"), "{err}");
    }
}
