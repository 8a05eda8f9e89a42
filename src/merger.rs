// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Merger: appends unmerged chunks to the consolidated output, newest range
//! first, checkpointing the index every `checkpoint_interval` chunks.
//!
//! A checkpoint syncs the output, records its length in the index, then
//! commits the index. A crash loses at most one interval of work, and the
//! output is cut back to the recorded length when it is reopened.

use tracing::{debug, info, warn};

use crate::error::{HarvestError, Result};
use crate::output::RowSink;
use crate::record::TokenTransfer;
use crate::storage::chunk_store::ChunkStore;
use crate::storage::index::{BlockRange, ChunkId, RangeIndex};
use crate::storage::persistence::IndexStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: Vec<ChunkId>,
    pub skipped: Vec<ChunkId>,
    pub rows_appended: usize,
    pub commits: usize,
}

pub struct Merger<'a, S, O> {
    chunks: &'a ChunkStore,
    store: &'a mut S,
    output: &'a mut O,
    checkpoint_interval: usize,
}

impl<'a, S: IndexStore, O: RowSink> Merger<'a, S, O> {
    pub fn new(
        chunks: &'a ChunkStore,
        store: &'a mut S,
        output: &'a mut O,
        checkpoint_interval: usize,
    ) -> Self {
        Self {
            chunks,
            store,
            output,
            checkpoint_interval: checkpoint_interval.max(1),
        }
    }

    pub fn run(&mut self, index: &mut RangeIndex) -> Result<MergeReport> {
        let pending: Vec<(ChunkId, BlockRange)> = index
            .unmerged_chunks()
            .map(|(id, range)| (id.clone(), range))
            .collect();
        info!(
            pending = pending.len(),
            already_merged = index.merge_state().files.len(),
            "Merge started"
        );

        let mut report = MergeReport::default();
        for (i, (id, range)) in pending.iter().enumerate() {
            match self.load_chunk(id, *range) {
                Ok(rows) => {
                    self.output.append_rows(&rows)?;
                    index.record_merge(id)?;
                    debug!(
                        chunk = %id,
                        n = i + 1,
                        of = pending.len(),
                        rows = rows.len(),
                        "Chunk merged"
                    );
                    report.rows_appended += rows.len();
                    report.merged.push(id.clone());
                }
                Err(HarvestError::ChunkRead { id, reason }) => {
                    warn!(chunk = %id, %range, reason = %reason, "Skipping unreadable chunk");
                    report.skipped.push(id);
                }
                Err(e) => return Err(e),
            }

            if (i + 1) % self.checkpoint_interval == 0 {
                self.checkpoint(index, &mut report)?;
                debug!(processed = i + 1, rows = report.rows_appended, "Checkpoint");
            }
        }

        self.checkpoint(index, &mut report)?;

        info!(
            merged = report.merged.len(),
            skipped = report.skipped.len(),
            rows = report.rows_appended,
            commits = report.commits,
            "Merge finished"
        );
        Ok(report)
    }

    fn load_chunk(&self, id: &ChunkId, range: BlockRange) -> Result<Vec<TokenTransfer>> {
        let rows = self.chunks.read(id)?;
        for row in &rows {
            row.validate_in(range)
                .map_err(|reason| HarvestError::ChunkRead { id: id.clone(), reason })?;
        }
        Ok(rows)
    }

    fn checkpoint(&mut self, index: &mut RangeIndex, report: &mut MergeReport) -> Result<()> {
        let len = self.output.sync()?;
        index.set_output_bytes(len);
        self.store.commit(index)?;
        report.commits += 1;
        Ok(())
    }
}
