//! Chunk store: immutable, range-keyed CSV files under `chunk_dir/`.
//!
//! ```text
//! chunk_dir/
//!   index.json          RangeIndex (see persistence.rs)
//!   2000_1500.csv       rows for blocks [1500, 2000], newest first
//!   1499_1000.csv
//! ```
//!
//! A chunk is written to a temp file and renamed into place, so a chunk path
//! either holds a complete file or does not exist. Once the index records a
//! chunk its file is never rewritten.

use std::fs::{self, File};
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{HarvestError, Result};
use crate::record::TokenTransfer;
use crate::storage::index::{BlockRange, ChunkId};

pub const CHUNK_EXTENSION: &str = "csv";

/// Directory of chunk files. Pure file I/O, no bookkeeping.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    dir: PathBuf,
}

impl ChunkStore {
    /// Open (creating if needed) the chunk directory.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            HarvestError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot create chunk dir {dir:?}: {e}"),
            ))
        })?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &ChunkId) -> PathBuf {
        self.dir.join(format!("{id}.{CHUNK_EXTENSION}"))
    }

    /// Durably write `rows` as chunk `id`. Returns the final path.
    pub fn write(&self, id: &ChunkId, rows: &[TokenTransfer]) -> Result<PathBuf> {
        let path = self.path_for(id);
        let wrap = |source: std::io::Error| HarvestError::ChunkWrite { id: id.clone(), source };

        let tmp = tempfile::Builder::new()
            .prefix(".chunk_")
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(wrap)?;
        {
            let mut w = csv::Writer::from_writer(tmp.as_file());
            for row in rows {
                w.serialize(row).map_err(|e| wrap(std::io::Error::other(e)))?;
            }
            w.flush().map_err(wrap)?;
        }
        tmp.as_file().sync_all().map_err(wrap)?;
        tmp.persist(&path).map_err(|e| wrap(e.error))?;

        debug!(chunk = %id, path = ?path, rows = rows.len(), "Chunk written");
        Ok(path)
    }

    /// Read every row of chunk `id`. Missing files and rows that do not match
    /// the column schema are reported as [`HarvestError::ChunkRead`].
    pub fn read(&self, id: &ChunkId) -> Result<Vec<TokenTransfer>> {
        let path = self.path_for(id);
        let file = File::open(&path).map_err(|e| HarvestError::ChunkRead {
            id: id.clone(),
            reason: match e.kind() {
                ErrorKind::NotFound => format!("missing file {path:?}"),
                _ => format!("open {path:?}: {e}"),
            },
        })?;

        let mut reader = csv::Reader::from_reader(BufReader::new(file));
        reader
            .deserialize::<TokenTransfer>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| HarvestError::ChunkRead {
                id: id.clone(),
                reason: format!("malformed rows: {e}"),
            })
    }

    pub fn exists(&self, id: &ChunkId) -> bool {
        self.path_for(id).is_file()
    }

    /// List every chunk file in the directory, newest range first.
    ///
    /// This walks the whole directory; it backs operator commands only, the
    /// fetch and merge paths go through the index.
    pub fn scan(&self) -> Result<Vec<(ChunkId, BlockRange)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let is_chunk = Path::new(name)
                .extension()
                .is_some_and(|ext| ext == CHUNK_EXTENSION);
            if !is_chunk || !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(parsed) = ChunkId::parse(name) {
                found.push(parsed);
            }
        }
        found.sort_by(|a, b| b.1.high().cmp(&a.1.high()).then(b.1.low().cmp(&a.1.low())));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::transfer;

    fn id(high: u64, low: u64) -> ChunkId {
        ChunkId::for_range(BlockRange::new(high, low).unwrap())
    }

    #[test]
    fn write_then_read_returns_rows_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        let rows = vec![transfer(2000, 0), transfer(1800, 1), transfer(1500, 2)];
        let path = store.write(&id(2000, 1500), &rows).unwrap();
        assert!(path.ends_with("2000_1500.csv"));
        assert_eq!(store.read(&id(2000, 1500)).unwrap(), rows);
    }

    #[test]
    fn missing_chunk_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        let err = store.read(&id(10, 1)).unwrap_err();
        assert!(matches!(err, HarvestError::ChunkRead { .. }));
    }

    #[test]
    fn missing_columns_are_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        fs::write(store.path_for(&id(10, 1)), b"blockNumber,hash\n5,0xaa\n").unwrap();
        let err = store.read(&id(10, 1)).unwrap_err();
        assert!(matches!(err, HarvestError::ChunkRead { .. }));
    }

    #[test]
    fn scan_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        store.write(&id(10, 1), &[transfer(5, 0)]).unwrap();
        store.write(&id(30, 11), &[transfer(20, 0)]).unwrap();
        fs::write(dir.path().join("notes.csv"), b"x").unwrap();
        fs::write(dir.path().join("index.json"), b"{}").unwrap();
        let names: Vec<String> = store.scan().unwrap().iter().map(|(i, _)| i.to_string()).collect();
        assert_eq!(names, vec!["30_11", "10_1"]);
    }
}
