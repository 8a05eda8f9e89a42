use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;

use crate::error::{HarvestError, Result};
use crate::source::RetryPolicy;
use crate::storage::index::BlockNumber;

/// Env var consulted when `source.api_key` is not set.
pub const API_KEY_ENV: &str = "ETHERSCAN_KEY";

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Explorer API settings.
    pub source: SourceConfig,
    /// Where chunks, the index and the merged output live.
    pub storage: StorageConfig,
    /// Block window to harvest.
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub merge: MergeConfig,
}

/// Explorer API client configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    /// Token contract whose transfers are harvested.
    pub contract_address: String,
    /// Falls back to the `ETHERSCAN_KEY` environment variable.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Rows per page; the explorer caps this at 10000.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Minimum spacing between two API requests.
    #[serde(default = "default_request_interval")]
    pub request_interval_ms: u64,
    /// Retries per page on rate limits and transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay, doubled on each further attempt.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Storage layout.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding `{high}_{low}.csv` chunk files.
    pub chunk_dir: PathBuf,
    /// Defaults to `<chunk_dir>/index.json`.
    #[serde(default)]
    pub index_path: Option<PathBuf>,
    /// Consolidated CSV produced by `merge`.
    pub output_path: PathBuf,
}

/// Fetch window. The walk starts at `start_block` (or the newest block with
/// transfers) and goes down to the floor.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FetchConfig {
    #[serde(default)]
    pub start_block: Option<BlockNumber>,
    #[serde(default)]
    pub floor_block: Option<BlockNumber>,
    /// `YYYY-MM-DD`, resolved to the first block at or after midnight UTC.
    #[serde(default)]
    pub floor_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MergeConfig {
    /// Chunks merged between two index commits.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self { checkpoint_interval: default_checkpoint_interval() }
    }
}

fn default_api_url() -> String { "https://api.etherscan.io/v2/api".into() }
fn default_chain_id() -> u64 { 1 }
fn default_page_size() -> usize { 10_000 }
fn default_request_interval() -> u64 { 250 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_delay() -> u64 { 250 }
fn default_timeout() -> u64 { 30 }
fn default_checkpoint_interval() -> usize { 100 }

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HarvestError::Config(format!("Cannot read config file: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| HarvestError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.source.contract_address.trim().is_empty() {
            return Err(HarvestError::Config("contract_address must be set".into()));
        }
        if self.source.page_size == 0 || self.source.page_size > 10_000 {
            return Err(HarvestError::Config("page_size must be in 1..=10000".into()));
        }
        if self.merge.checkpoint_interval == 0 {
            return Err(HarvestError::Config("checkpoint_interval must be > 0".into()));
        }
        if let (Some(start), Some(floor)) = (self.fetch.start_block, self.fetch.floor_block) {
            if floor > start {
                return Err(HarvestError::Config(format!(
                    "floor_block {floor} is above start_block {start}"
                )));
            }
        }
        Ok(())
    }
}

impl SourceConfig {
    pub fn resolve_api_key(&self) -> Result<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty()))
            .ok_or_else(|| {
                HarvestError::Config(format!("no api_key configured and {API_KEY_ENV} is unset"))
            })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

impl StorageConfig {
    pub fn index_path(&self) -> PathBuf {
        self.index_path
            .clone()
            .unwrap_or_else(|| self.chunk_dir.join("index.json"))
    }
}

impl FetchConfig {
    /// Unix timestamp of the floor date at 00:00 UTC.
    pub fn floor_timestamp(&self) -> Option<i64> {
        self.floor_date
            .map(|d| d.and_time(NaiveTime::MIN).and_utc().timestamp())
    }
}
