// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Range index: maps chunk identity → covered block range.
//!
//! The index is the only source of truth for resumability. It tracks:
//!   - every chunk file that was durably written (`files`),
//!   - the aggregate block bounds across those chunks (`global`),
//!   - which chunks were appended to the consolidated output (`merged`).
//!
//! Alongside the persisted fields the index keeps a coalesced interval set of
//! all chunk ranges, rebuilt on load, so coverage checks are true containment
//! tests and gaps inside `[global.min, global.max]` are visible.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{HarvestError, Result};

/// Block height, the ordering key of the source data.
pub type BlockNumber = u64;

// ─────────────────────────────── BlockRange ──────────────────────────────────

/// Inclusive block range `[low, high]`, always `low <= high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRange")]
pub struct BlockRange {
    high: BlockNumber,
    low: BlockNumber,
}

#[derive(Deserialize)]
struct RawRange {
    high: BlockNumber,
    low: BlockNumber,
}

impl TryFrom<RawRange> for BlockRange {
    type Error = String;

    fn try_from(raw: RawRange) -> std::result::Result<Self, Self::Error> {
        BlockRange::new(raw.high, raw.low)
            .ok_or_else(|| format!("range low {} above high {}", raw.low, raw.high))
    }
}

impl BlockRange {
    /// Returns `None` when `low > high`.
    pub fn new(high: BlockNumber, low: BlockNumber) -> Option<Self> {
        (low <= high).then_some(Self { high, low })
    }

    pub fn high(&self) -> BlockNumber {
        self.high
    }

    pub fn low(&self) -> BlockNumber {
        self.low
    }

    pub fn contains(&self, block: BlockNumber) -> bool {
        self.low <= block && block <= self.high
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.low, self.high)
    }
}

// ─────────────────────────────── ChunkId ─────────────────────────────────────

/// Chunk identity, `{high}_{low}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn for_range(range: BlockRange) -> Self {
        Self(format!("{}_{}", range.high, range.low))
    }

    /// Parse a chunk name (optionally carrying a file extension) back into the
    /// identity and the range it encodes. Only canonical names are accepted,
    /// so `0100_50` is rejected: its chunk file would never be found again.
    pub fn parse(name: &str) -> Option<(Self, BlockRange)> {
        let stem = name.split_once('.').map_or(name, |(stem, _)| stem);
        let (high, low) = stem.split_once('_')?;
        if high.is_empty() || low.is_empty() {
            return None;
        }
        if !high.bytes().chain(low.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        let range = BlockRange::new(high.parse().ok()?, low.parse().ok()?)?;
        let id = Self::for_range(range);
        (id.0 == stem).then_some((id, range))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─────────────────────────────── bounds ──────────────────────────────────────

/// Aggregate `{min, max}` over a set of ranges. Not a contiguity guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub min: BlockNumber,
    pub max: BlockNumber,
}

impl Bounds {
    fn extend(bounds: Option<Bounds>, range: BlockRange) -> Bounds {
        match bounds {
            None => Bounds { min: range.low, max: range.high },
            Some(b) => Bounds {
                min: b.min.min(range.low),
                max: b.max.max(range.high),
            },
        }
    }
}

/// Merge progress: which chunks reached the consolidated output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeState {
    pub bounds: Option<Bounds>,
    pub files: BTreeSet<ChunkId>,
    /// Consolidated output length at the last checkpoint.
    pub output_bytes: Option<u64>,
}

impl MergeState {
    /// Output length the consolidated file must be cut back to on open.
    /// Nothing merged yet means nothing belongs in the output. `None` only
    /// for indexes written before lengths were recorded.
    pub fn committed_output_len(&self) -> Option<u64> {
        self.output_bytes
            .or_else(|| self.files.is_empty().then_some(0))
    }
}

// ─────────────────────────────── IntervalSet ─────────────────────────────────

/// Disjoint, non-adjacent inclusive intervals keyed by their low end.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntervalSet {
    spans: BTreeMap<BlockNumber, BlockNumber>,
}

impl IntervalSet {
    pub fn insert(&mut self, range: BlockRange) {
        let mut low = range.low;
        let mut high = range.high;
        let absorbed: Vec<BlockNumber> = self
            .spans
            .range(..=high.saturating_add(1))
            .rev()
            .take_while(|(_, &end)| end.saturating_add(1) >= low)
            .map(|(&start, _)| start)
            .collect();
        for start in absorbed {
            if let Some(end) = self.spans.remove(&start) {
                low = low.min(start);
                high = high.max(end);
            }
        }
        self.spans.insert(low, high);
    }

    /// The interval containing `block`, if any.
    pub fn covering(&self, block: BlockNumber) -> Option<BlockRange> {
        self.spans
            .range(..=block)
            .next_back()
            .filter(|(_, &end)| end >= block)
            .and_then(|(&start, &end)| BlockRange::new(end, start))
    }

    pub fn contains_range(&self, range: BlockRange) -> bool {
        self.covering(range.high)
            .is_some_and(|span| span.low <= range.low)
    }

    /// Whether any block of `range` is covered.
    pub fn intersects(&self, range: BlockRange) -> bool {
        self.spans
            .range(..=range.high)
            .next_back()
            .is_some_and(|(_, &end)| end >= range.low)
    }

    /// Highest covered block strictly below `block`.
    pub fn highest_below(&self, block: BlockNumber) -> Option<BlockNumber> {
        self.spans
            .range(..block)
            .next_back()
            .map(|(_, &end)| end.min(block - 1))
    }

    /// Uncovered ranges between the first and last interval, newest first.
    pub fn gaps(&self) -> Vec<BlockRange> {
        let spans: Vec<(BlockNumber, BlockNumber)> =
            self.spans.iter().map(|(&s, &e)| (s, e)).collect();
        spans
            .windows(2)
            .rev()
            .filter_map(|w| BlockRange::new(w[1].0 - 1, w[0].1 + 1))
            .collect()
    }

    /// Covered intervals, newest first.
    pub fn spans(&self) -> impl Iterator<Item = BlockRange> + '_ {
        self.spans
            .iter()
            .rev()
            .filter_map(|(&start, &end)| BlockRange::new(end, start))
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

// ─────────────────────────────── RangeIndex ──────────────────────────────────

/// Persisted record of known chunks, coverage and merge progress.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeIndex {
    files: BTreeMap<ChunkId, BlockRange>,
    global: Option<Bounds>,
    merged: MergeState,
    covered: IntervalSet,
}

impl RangeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a durably written chunk. Returns `false` when the identical
    /// entry was already present.
    pub fn record_chunk(&mut self, id: ChunkId, range: BlockRange) -> Result<bool> {
        if let Some(&recorded) = self.files.get(&id) {
            if recorded == range {
                return Ok(false);
            }
            return Err(HarvestError::InconsistentChunk {
                id,
                recorded,
                attempted: range,
            });
        }
        self.files.insert(id, range);
        self.global = Some(Bounds::extend(self.global, range));
        self.covered.insert(range);
        Ok(true)
    }

    /// Record chunk files found on disk but missing from the index, such as a
    /// chunk written by a run that died before its commit. A file whose range
    /// touches existing coverage is left out: its rows are already held by
    /// another chunk. Returns the adopted ids.
    pub fn adopt_orphans(
        &mut self,
        found: impl IntoIterator<Item = (ChunkId, BlockRange)>,
    ) -> Vec<ChunkId> {
        let mut adopted = Vec::new();
        for (id, range) in found {
            if self.files.contains_key(&id) {
                continue;
            }
            if self.covered.intersects(range) {
                warn!(chunk = %id, %range, "Orphan chunk overlaps indexed coverage, not adopted");
                continue;
            }
            self.files.insert(id.clone(), range);
            self.global = Some(Bounds::extend(self.global, range));
            self.covered.insert(range);
            adopted.push(id);
        }
        adopted
    }

    /// Whether every block of `range` lies inside recorded chunk coverage.
    pub fn is_covered(&self, range: BlockRange) -> bool {
        self.covered.contains_range(range)
    }

    /// Chunks not yet merged, ordered by descending `high`.
    pub fn unmerged_chunks(&self) -> impl Iterator<Item = (&ChunkId, BlockRange)> + '_ {
        let mut pending: Vec<(&ChunkId, BlockRange)> = self
            .files
            .iter()
            .filter(|(id, _)| !self.merged.files.contains(*id))
            .map(|(id, &range)| (id, range))
            .collect();
        pending.sort_by(|a, b| {
            b.1.high
                .cmp(&a.1.high)
                .then(b.1.low.cmp(&a.1.low))
                .then(a.0.cmp(b.0))
        });
        pending.into_iter()
    }

    /// Mark a chunk as merged. Returns `false` if it already was.
    pub fn record_merge(&mut self, id: &ChunkId) -> Result<bool> {
        let range = *self
            .files
            .get(id)
            .ok_or_else(|| HarvestError::UnknownChunk(id.clone()))?;
        if !self.merged.files.insert(id.clone()) {
            return Ok(false);
        }
        self.merged.bounds = Some(Bounds::extend(self.merged.bounds, range));
        Ok(true)
    }

    pub fn set_output_bytes(&mut self, len: u64) {
        self.merged.output_bytes = Some(len);
    }

    pub fn chunk(&self, id: &ChunkId) -> Option<BlockRange> {
        self.files.get(id).copied()
    }

    pub fn chunks(&self) -> impl Iterator<Item = (&ChunkId, BlockRange)> + '_ {
        self.files.iter().map(|(id, &range)| (id, range))
    }

    pub fn global_coverage(&self) -> Option<Bounds> {
        self.global
    }

    pub fn merge_state(&self) -> &MergeState {
        &self.merged
    }

    pub fn is_merged(&self, id: &ChunkId) -> bool {
        self.merged.files.contains(id)
    }

    pub fn coverage(&self) -> &IntervalSet {
        &self.covered
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

// ─────────────────────────────── persisted form ──────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IndexDocument {
    #[serde(default)]
    pub files: BTreeMap<String, BlockRange>,
    #[serde(default)]
    pub global: BoundsDocument,
    #[serde(default)]
    pub merged: MergedDocument,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BoundsDocument {
    pub min: Option<BlockNumber>,
    pub max: Option<BlockNumber>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MergedDocument {
    pub min: Option<BlockNumber>,
    pub max: Option<BlockNumber>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_bytes: Option<u64>,
}

impl From<Option<Bounds>> for BoundsDocument {
    fn from(bounds: Option<Bounds>) -> Self {
        Self {
            min: bounds.map(|b| b.min),
            max: bounds.map(|b| b.max),
        }
    }
}

impl From<&RangeIndex> for IndexDocument {
    fn from(index: &RangeIndex) -> Self {
        let merged_bounds = BoundsDocument::from(index.merged.bounds);
        IndexDocument {
            files: index
                .files
                .iter()
                .map(|(id, &range)| (id.to_string(), range))
                .collect(),
            global: index.global.into(),
            merged: MergedDocument {
                min: merged_bounds.min,
                max: merged_bounds.max,
                files: index.merged.files.iter().map(ToString::to_string).collect(),
                output_bytes: index.merged.output_bytes,
            },
        }
    }
}

impl TryFrom<IndexDocument> for RangeIndex {
    type Error = String;

    /// Rebuilds the index and checks its invariants. `global` and the merged
    /// bounds are recomputed from `files`; stored values are only validated.
    fn try_from(doc: IndexDocument) -> std::result::Result<Self, Self::Error> {
        let mut index = RangeIndex::new();
        for (name, range) in doc.files {
            let (id, named) =
                ChunkId::parse(&name).ok_or_else(|| format!("invalid chunk name '{name}'"))?;
            if named != range {
                return Err(format!("chunk '{name}' name disagrees with range {range}"));
            }
            index.record_chunk(id, range).map_err(|e| e.to_string())?;
        }

        if let (Some(min), Some(max)) = (doc.global.min, doc.global.max) {
            if min > max {
                return Err(format!("global min {min} above max {max}"));
            }
        }

        for name in doc.merged.files {
            let (id, _) = ChunkId::parse(&name)
                .ok_or_else(|| format!("invalid merged chunk name '{name}'"))?;
            if index.chunk(&id).is_none() {
                return Err(format!("merged chunk '{name}' missing from files"));
            }
            index.record_merge(&id).map_err(|e| e.to_string())?;
        }
        index.merged.output_bytes = doc.merged.output_bytes;
        Ok(index)
    }
}
