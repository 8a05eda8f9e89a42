//! Consolidated output: the single append-only table fed by the merger.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{HarvestError, Result};
use crate::record::TokenTransfer;

/// Append-only row sink.
pub trait RowSink {
    fn append_rows(&mut self, rows: &[TokenTransfer]) -> Result<()>;

    /// Make everything appended so far durable and return the sink length,
    /// which the merger records at each checkpoint.
    fn sync(&mut self) -> Result<u64>;
}

/// CSV file with a single header line, appended in place.
pub struct CsvOutput {
    path: PathBuf,
    file: File,
    has_header: bool,
}

impl CsvOutput {
    /// Open `path` for appending.
    ///
    /// `checkpoint_len` is the length recorded at the last index commit.
    /// Bytes past it were appended by a run that crashed before committing;
    /// they are cut off so those chunks are appended exactly once.
    pub fn open(path: &Path, checkpoint_len: Option<u64>) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| HarvestError::Output(format!("open {path:?}: {e}")))?;

        let mut len = file.metadata()?.len();
        match checkpoint_len {
            Some(committed) if len > committed => {
                warn!(
                    path = ?path,
                    committed,
                    found = len,
                    "Dropping rows appended after the last checkpoint"
                );
                file.set_len(committed)?;
                file.sync_all()?;
                len = committed;
            }
            Some(committed) if len < committed => {
                return Err(HarvestError::Output(format!(
                    "{path:?} is {len} bytes but the index recorded {committed}; \
                     the output was modified outside of merge"
                )));
            }
            _ => {}
        }
        file.seek(SeekFrom::End(0))?;

        info!(path = ?path, bytes = len, "Consolidated output opened");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            has_header: len > 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RowSink for CsvOutput {
    fn append_rows(&mut self, rows: &[TokenTransfer]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let to_err = |e: csv::Error| HarvestError::Output(format!("append {:?}: {e}", self.path));
        let mut w = csv::WriterBuilder::new()
            .has_headers(!self.has_header)
            .from_writer(&self.file);
        for row in rows {
            w.serialize(row).map_err(to_err)?;
        }
        w.flush()?;
        self.has_header = true;
        Ok(())
    }

    fn sync(&mut self) -> Result<u64> {
        self.file.sync_data()?;
        Ok(self.file.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::transfer;

    fn read_back(path: &Path) -> Vec<TokenTransfer> {
        csv::Reader::from_path(path)
            .unwrap()
            .deserialize()
            .collect::<std::result::Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn header_written_once_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("transfers.csv");

        let mut out = CsvOutput::open(&path, None).unwrap();
        out.append_rows(&[transfer(10, 0)]).unwrap();
        let len = out.sync().unwrap();
        drop(out);

        let mut out = CsvOutput::open(&path, Some(len)).unwrap();
        out.append_rows(&[transfer(9, 0), transfer(8, 1)]).unwrap();
        out.sync().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("blockNumber").count(), 1);
        assert_eq!(read_back(&path).len(), 3);
    }

    #[test]
    fn uncommitted_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.csv");

        let mut out = CsvOutput::open(&path, None).unwrap();
        out.append_rows(&[transfer(10, 0)]).unwrap();
        let committed = out.sync().unwrap();
        out.append_rows(&[transfer(9, 0)]).unwrap();
        out.sync().unwrap();
        drop(out);

        let out = CsvOutput::open(&path, Some(committed)).unwrap();
        drop(out);
        let rows = read_back(&path);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].block_number, 10);
    }

    #[test]
    fn shorter_than_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.csv");
        fs::write(&path, b"").unwrap();
        assert!(matches!(
            CsvOutput::open(&path, Some(100)),
            Err(HarvestError::Output(_))
        ));
    }
}
