//! Index persistence: atomic load/commit of the [`RangeIndex`].
//!
//! A commit serialises the full index into a temp file next to the canonical
//! path, fsyncs it, then renames it over the canonical path. A crash at any
//! point leaves either the previous or the new document, never a torn one.
//!
//! Only one process may mutate an index location at a time; nothing here
//! takes a lock.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{HarvestError, Result};
use crate::storage::index::{BlockRange, IndexDocument, RangeIndex};

/// Durable home of a [`RangeIndex`].
pub trait IndexStore {
    /// `Ok(None)` when nothing was ever committed.
    fn load(&self) -> Result<Option<RangeIndex>>;

    fn commit(&mut self, index: &RangeIndex) -> Result<()>;
}

impl RangeIndex {
    /// Load from `store`, starting empty on first run.
    pub fn load(store: &impl IndexStore) -> Result<Self> {
        Ok(store.load()?.unwrap_or_default())
    }
}

/// JSON index file, replaced atomically on every commit.
#[derive(Debug, Clone)]
pub struct JsonIndexStore {
    path: PathBuf,
}

impl JsonIndexStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, reason: impl Into<String>) -> HarvestError {
        HarvestError::CorruptIndex {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn parse(&self, bytes: &[u8]) -> Result<RangeIndex> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| self.corrupt(e.to_string()))?;
        let Value::Object(map) = &value else {
            return Err(self.corrupt("top-level value is not an object"));
        };

        let doc = if map.is_empty() || map.contains_key("files") {
            serde_json::from_value::<IndexDocument>(value)
                .map_err(|e| self.corrupt(e.to_string()))?
        } else {
            // Flat `{ "<high>_<low>": {high, low} }` layout from older runs.
            let files: BTreeMap<String, BlockRange> = serde_json::from_value(value)
                .map_err(|e| self.corrupt(format!("legacy layout: {e}")))?;
            info!(path = ?self.path, chunks = files.len(), "Upgrading legacy flat index");
            IndexDocument { files, ..Default::default() }
        };

        RangeIndex::try_from(doc).map_err(|reason| self.corrupt(reason))
    }
}

impl IndexStore for JsonIndexStore {
    fn load(&self) -> Result<Option<RangeIndex>> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let index = self.parse(&bytes)?;
        debug!(
            path = ?self.path,
            chunks = index.len(),
            merged = index.merge_state().files.len(),
            "Index loaded"
        );
        Ok(Some(index))
    }

    fn commit(&mut self, index: &RangeIndex) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let tmp = tempfile::Builder::new()
            .prefix("idx_")
            .suffix(".json")
            .tempfile_in(&dir)?;
        write_document(&tmp, &IndexDocument::from(index))?;
        tmp.persist(&self.path).map_err(|e| HarvestError::Io(e.error))?;

        debug!(path = ?self.path, chunks = index.len(), "Index committed");
        Ok(())
    }
}

fn write_document(tmp: &NamedTempFile, doc: &IndexDocument) -> Result<()> {
    let mut w = BufWriter::new(tmp.as_file());
    serde_json::to_writer_pretty(&mut w, doc)
        .map_err(|e| HarvestError::Io(std::io::Error::other(e)))?;
    w.flush()?;
    drop(w);
    tmp.as_file().sync_all()?;
    Ok(())
}
