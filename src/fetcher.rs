// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Fetcher: pages a [`PageSource`] backwards from a starting block down to a
//! floor, writing one chunk per page.
//!
//! ```text
//!   cursor ──► covered? ──yes──► jump below covering interval
//!                │ no
//!                ▼
//!          fetch [lower, cursor]   lower = max(floor, top of next covered span + 1)
//!                │
//!        empty ──┼── rows
//!          │     ▼
//!          │   write chunk ──► record_chunk ──► commit ──► cursor = oldest - 1
//!          ▼
//!   lower > floor ? jump : stop
//! ```
//!
//! A chunk file is always durable before the index mentions it, and every
//! written chunk is committed before the next page is requested, so killing
//! the process between any two steps leaves a valid resume point.

use tracing::{debug, info, warn};

use crate::error::{HarvestError, Result};
use crate::record::TokenTransfer;
use crate::source::{Page, PageRequest, PageSource};
use crate::storage::chunk_store::ChunkStore;
use crate::storage::index::{BlockNumber, BlockRange, ChunkId, RangeIndex};
use crate::storage::persistence::IndexStore;

/// Why a fetch run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The source returned no rows down to the floor.
    EmptyPage,
    /// The cursor went below the floor.
    FloorReached,
    /// Everything between the floor and the cursor is already in the index.
    Covered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub chunks_written: usize,
    pub rows_written: usize,
    pub stop: StopReason,
}

pub struct Fetcher<'a, P, S> {
    source: &'a mut P,
    chunks: &'a ChunkStore,
    store: &'a mut S,
}

impl<'a, P: PageSource, S: IndexStore> Fetcher<'a, P, S> {
    pub fn new(source: &'a mut P, chunks: &'a ChunkStore, store: &'a mut S) -> Self {
        Self { source, chunks, store }
    }

    /// Walk from `start` (inclusive) down to `floor` (inclusive).
    pub async fn run(
        &mut self,
        index: &mut RangeIndex,
        start: BlockNumber,
        floor: BlockNumber,
    ) -> Result<FetchReport> {
        info!(start, floor, known_chunks = index.len(), "Fetch started");

        let mut report = FetchReport {
            chunks_written: 0,
            rows_written: 0,
            stop: StopReason::FloorReached,
        };
        let mut cursor = start;

        report.stop = loop {
            let Some(remaining) = BlockRange::new(cursor, floor) else {
                break StopReason::FloorReached;
            };
            if index.is_covered(remaining) {
                break StopReason::Covered;
            }
            if let Some(span) = index.coverage().covering(cursor) {
                debug!(cursor, covered = %span, "Skipping covered blocks");
                match span.low().checked_sub(1) {
                    Some(next) => {
                        cursor = next;
                        continue;
                    }
                    None => break StopReason::FloorReached,
                }
            }

            let lower = index
                .coverage()
                .highest_below(cursor)
                .map_or(floor, |top| (top + 1).max(floor));
            let request = PageRequest { end_block: cursor, floor: lower };

            let page = self.source.fetch_page(request).await.map_err(|e| {
                HarvestError::FetchAborted {
                    end_block: cursor,
                    floor: lower,
                    attempts: e.attempts(),
                    reason: e.to_string(),
                }
            })?;

            let window = BlockRange::new(cursor, lower)
                .ok_or_else(|| HarvestError::Source(format!("floor {lower} above {cursor}")))?;
            let received = page.as_ref().map_or(0, Page::len);
            let page = page.and_then(|p| p.within(window));
            let kept = page.as_ref().map_or(0, Page::len);
            if kept != received {
                warn!(
                    dropped = received - kept,
                    end_block = cursor,
                    floor = lower,
                    "Source returned rows outside the requested window"
                );
            }

            let Some(page) = page else {
                if lower > floor {
                    debug!(end_block = cursor, floor = lower, "Gap holds no rows");
                    cursor = lower - 1;
                    continue;
                }
                break StopReason::EmptyPage;
            };

            let range = BlockRange::new(cursor, page.oldest())
                .ok_or_else(|| HarvestError::Source(format!("oldest {} above {cursor}", page.oldest())))?;
            self.commit_chunk(index, range, page.rows())?;
            report.chunks_written += 1;
            report.rows_written += page.len();

            match page.oldest().checked_sub(1) {
                Some(next) => cursor = next,
                None => break StopReason::FloorReached,
            }
        };

        info!(
            chunks = report.chunks_written,
            rows = report.rows_written,
            stop = ?report.stop,
            coverage = ?index.global_coverage(),
            "Fetch finished"
        );
        Ok(report)
    }

    /// Write → record → commit. The file must be durable before the index
    /// refers to it; a failed write leaves the index untouched.
    fn commit_chunk(
        &mut self,
        index: &mut RangeIndex,
        range: BlockRange,
        rows: &[TokenTransfer],
    ) -> Result<()> {
        let id = ChunkId::for_range(range);
        self.chunks.write(&id, rows)?;
        index.record_chunk(id.clone(), range)?;
        self.store.commit(index)?;
        info!(
            chunk = %id,
            high = range.high(),
            low = range.low(),
            rows = rows.len(),
            "Chunk committed"
        );
        Ok(())
    }
}
