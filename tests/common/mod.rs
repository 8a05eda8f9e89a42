//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use txharvest::error::{HarvestError, Result};
use txharvest::output::RowSink;
use txharvest::record::TokenTransfer;
use txharvest::source::{Page, PageRequest, PageSource, SourceError};
use txharvest::storage::index::{BlockNumber, BlockRange, ChunkId, RangeIndex};
use txharvest::storage::persistence::{IndexStore, JsonIndexStore};

pub fn transfer(block: BlockNumber, n: u32) -> TokenTransfer {
    let mut t = TokenTransfer {
        block_number: block,
        time_stamp: 1_700_000_000 + block as i64 * 12,
        hash: format!("0x{block:08x}{n:04x}"),
        nonce: n.to_string(),
        block_hash: format!("0xb{block:x}"),
        from: format!("0xfrom{n}"),
        to: format!("0xto{n}"),
        contract_address: "0xdac17f958d2ee523a2206206994597c13d831ec7".into(),
        value: (1_000_000 + n as u64).to_string(),
        token_name: "Tether USD".into(),
        token_symbol: "USDT".into(),
        token_decimal: "6".into(),
        transaction_index: n.to_string(),
        gas: "65000".into(),
        gas_price: "20000000000".into(),
        gas_used: "46109".into(),
        cumulative_gas_used: "9000000".into(),
        input: "deprecated".into(),
        confirmations: "12".into(),
        datetime: String::new(),
    };
    t.fill_datetime();
    t
}

pub fn range(high: BlockNumber, low: BlockNumber) -> BlockRange {
    BlockRange::new(high, low).expect("valid range")
}

pub fn chunk_id(high: BlockNumber, low: BlockNumber) -> ChunkId {
    ChunkId::for_range(range(high, low))
}

/// In-memory explorer: `rows_per_block` rows at each listed block, pages
/// made of whole blocks up to `page_size` rows.
pub struct FakeChain {
    pub blocks: BTreeMap<BlockNumber, u32>,
    pub page_size: usize,
    pub requests: Vec<PageRequest>,
    /// Fail with a fatal error once this many pages were served.
    pub crash_after: Option<usize>,
    /// Answer with rate limits forever once this many pages were served.
    pub throttle_after: Option<usize>,
    /// Transient failures to return before serving the next page.
    pub transient_failures: u32,
}

impl FakeChain {
    pub fn new(blocks: &[(BlockNumber, u32)], page_size: usize) -> Self {
        Self {
            blocks: blocks.iter().copied().collect(),
            page_size,
            requests: Vec::new(),
            crash_after: None,
            throttle_after: None,
            transient_failures: 0,
        }
    }

    pub fn served(&self) -> usize {
        self.requests.len()
    }
}

impl PageSource for FakeChain {
    async fn head(&mut self) -> std::result::Result<BlockNumber, SourceError> {
        self.blocks
            .keys()
            .next_back()
            .copied()
            .ok_or_else(|| SourceError::Fatal("empty chain".into()))
    }

    async fn fetch_page(
        &mut self,
        req: PageRequest,
    ) -> std::result::Result<Option<Page>, SourceError> {
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(SourceError::Transient("Max rate limit reached".into()));
        }
        if self.throttle_after.is_some_and(|n| self.served() >= n) {
            return Err(SourceError::Transient("Max rate limit reached".into()));
        }
        if self.crash_after.is_some_and(|n| self.served() >= n) {
            return Err(SourceError::Fatal("process killed".into()));
        }
        self.requests.push(req);

        let mut rows = Vec::new();
        for (&block, &count) in self.blocks.range(req.floor..=req.end_block).rev() {
            if !rows.is_empty() && rows.len() + count as usize > self.page_size {
                break;
            }
            rows.extend((0..count).map(|n| transfer(block, n)));
        }
        Ok(Page::new(rows))
    }
}

/// JSON store that counts commits and can be made to fail.
pub struct CountingStore {
    pub inner: JsonIndexStore,
    pub commits: usize,
    pub fail_commits: bool,
}

impl CountingStore {
    pub fn new(path: &Path) -> Self {
        Self {
            inner: JsonIndexStore::new(path),
            commits: 0,
            fail_commits: false,
        }
    }
}

impl IndexStore for CountingStore {
    fn load(&self) -> Result<Option<RangeIndex>> {
        self.inner.load()
    }

    fn commit(&mut self, index: &RangeIndex) -> Result<()> {
        if self.fail_commits {
            return Err(HarvestError::Io(std::io::Error::other("disk full")));
        }
        self.commits += 1;
        self.inner.commit(index)
    }
}

/// Row sink kept in memory.
#[derive(Default)]
pub struct MemorySink {
    pub rows: Vec<TokenTransfer>,
    pub appends: usize,
}

impl RowSink for MemorySink {
    fn append_rows(&mut self, rows: &[TokenTransfer]) -> Result<()> {
        self.appends += 1;
        self.rows.extend_from_slice(rows);
        Ok(())
    }

    fn sync(&mut self) -> Result<u64> {
        Ok(self.rows.len() as u64)
    }
}

/// Wraps a sink and fails the `fail_on`-th append (1-based).
pub struct FailingSink<O> {
    pub inner: O,
    pub appends: usize,
    pub fail_on: usize,
}

impl<O: RowSink> RowSink for FailingSink<O> {
    fn append_rows(&mut self, rows: &[TokenTransfer]) -> Result<()> {
        self.appends += 1;
        if self.appends == self.fail_on {
            return Err(HarvestError::Output("process killed".into()));
        }
        self.inner.append_rows(rows)
    }

    fn sync(&mut self) -> Result<u64> {
        self.inner.sync()
    }
}
