//! Etherscan V2 client: `account/tokentx` pages sorted newest first.
//!
//! Requests are paced by `request_interval_ms`. Rate-limit answers, timeouts
//! and 5xx responses surface as [`SourceError::Transient`] so the
//! [`RetryingSource`](crate::source::RetryingSource) wrapper can back off.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::error::{HarvestError, Result};
use crate::record::TokenTransfer;
use crate::source::{Page, PageRequest, PageSource, SourceError};
use crate::storage::index::BlockNumber;

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: Value,
}

impl ApiResponse {
    fn result_text(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn is_rate_limited(&self) -> bool {
        let text = format!("{} {}", self.message, self.result_text()).to_lowercase();
        text.contains("rate limit") || text.contains("too many")
    }

    fn is_no_records(&self) -> bool {
        let text = format!("{} {}", self.message, self.result_text()).to_lowercase();
        text.contains("no transactions found") || text.contains("no records found")
    }
}

pub struct EtherscanClient {
    http: Client,
    api_url: String,
    chain_id: u64,
    contract: String,
    api_key: String,
    page_size: usize,
    interval: Duration,
    next_slot: Option<Instant>,
}

impl std::fmt::Debug for EtherscanClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtherscanClient")
            .field("api_url", &self.api_url)
            .field("chain_id", &self.chain_id)
            .field("contract", &self.contract)
            .finish()
    }
}

impl EtherscanClient {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .build()
            .map_err(|e| HarvestError::Source(format!("http client: {e}")))?;
        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            chain_id: config.chain_id,
            contract: config.contract_address.clone(),
            api_key: config.resolve_api_key()?,
            page_size: config.page_size,
            interval: Duration::from_millis(config.request_interval_ms),
            next_slot: None,
        })
    }

    async fn get(&mut self, params: &[(&str, String)]) -> std::result::Result<ApiResponse, SourceError> {
        if let Some(slot) = self.next_slot {
            sleep_until(slot).await;
        }
        self.next_slot = Some(Instant::now() + self.interval);

        let mut query: Vec<(&str, String)> = vec![
            ("chainid", self.chain_id.to_string()),
            ("apikey", self.api_key.clone()),
        ];
        query.extend(params.iter().cloned());

        let res = self
            .http
            .get(&self.api_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    SourceError::Transient(e.to_string())
                } else {
                    SourceError::Fatal(e.to_string())
                }
            })?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(SourceError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(SourceError::Fatal(format!("HTTP {status}")));
        }

        let body = res
            .bytes()
            .await
            .map_err(|e| SourceError::Transient(e.to_string()))?;
        let parsed: ApiResponse = serde_json::from_slice(&body).map_err(|_| {
            let head = String::from_utf8_lossy(&body[..body.len().min(120)]).into_owned();
            SourceError::Transient(format!("non-JSON response: {head}"))
        })?;

        if parsed.is_rate_limited() {
            return Err(SourceError::Transient(parsed.result_text()));
        }
        Ok(parsed)
    }

    fn transfers(&self, resp: ApiResponse) -> std::result::Result<Vec<TokenTransfer>, SourceError> {
        if resp.status != "1" {
            if resp.is_no_records() {
                return Ok(Vec::new());
            }
            // Explorers answer status 0 for hiccups as well as bad requests;
            // let the retry budget decide.
            return Err(SourceError::Transient(format!(
                "{}: {}",
                resp.message,
                resp.result_text()
            )));
        }
        let mut rows: Vec<TokenTransfer> = serde_json::from_value(resp.result)
            .map_err(|e| SourceError::Fatal(format!("unexpected tokentx payload: {e}")))?;
        for row in &mut rows {
            row.fill_datetime();
        }
        Ok(rows)
    }

    /// First block at or after `timestamp` (unix seconds).
    pub async fn block_at(&mut self, timestamp: i64) -> std::result::Result<BlockNumber, SourceError> {
        let resp = self
            .get(&[
                ("module", "block".into()),
                ("action", "getblocknobytime".into()),
                ("timestamp", timestamp.to_string()),
                ("closest", "after".into()),
            ])
            .await?;
        if resp.status != "1" {
            return Err(SourceError::Transient(resp.result_text()));
        }
        resp.result_text()
            .trim()
            .parse()
            .map_err(|e| SourceError::Fatal(format!("bad block number '{}': {e}", resp.result_text())))
    }

    fn tokentx_params(&self, start: BlockNumber, end: Option<BlockNumber>, offset: usize) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("module", "account".to_string()),
            ("action", "tokentx".to_string()),
            ("contractaddress", self.contract.clone()),
            ("startblock", start.to_string()),
            ("page", "1".to_string()),
            ("offset", offset.to_string()),
            ("sort", "desc".to_string()),
        ];
        if let Some(end) = end {
            params.push(("endblock", end.to_string()));
        }
        params
    }
}

/// Drop the rows of the lowest block of a full page: the page limit may have
/// cut that block short, and the next page restarts from it.
fn trim_partial_block(rows: &mut Vec<TokenTransfer>, page_size: usize) {
    if rows.len() < page_size {
        return;
    }
    let Some(lowest) = rows.iter().map(|r| r.block_number).min() else {
        return;
    };
    if rows.iter().all(|r| r.block_number == lowest) {
        warn!(
            block = lowest,
            rows = rows.len(),
            "Single block fills a whole page, later rows of this block are unreachable"
        );
        return;
    }
    rows.retain(|r| r.block_number != lowest);
}

impl PageSource for EtherscanClient {
    async fn head(&mut self) -> std::result::Result<BlockNumber, SourceError> {
        let params = self.tokentx_params(0, None, 1);
        let resp = self.get(&params).await?;
        self.transfers(resp)?
            .iter()
            .map(|r| r.block_number)
            .max()
            .ok_or_else(|| SourceError::Fatal("contract has no transfers".into()))
    }

    async fn fetch_page(&mut self, request: PageRequest) -> std::result::Result<Option<Page>, SourceError> {
        let params = self.tokentx_params(request.floor, Some(request.end_block), self.page_size);
        let resp = self.get(&params).await?;
        let mut rows = self.transfers(resp)?;
        let received = rows.len();
        trim_partial_block(&mut rows, self.page_size);
        debug!(
            end_block = request.end_block,
            floor = request.floor,
            received,
            kept = rows.len(),
            "tokentx page"
        );
        Ok(Page::new(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::transfer;

    #[test]
    fn full_page_drops_lowest_block() {
        let mut rows = vec![transfer(30, 0), transfer(20, 0), transfer(10, 0), transfer(10, 1)];
        trim_partial_block(&mut rows, 4);
        let blocks: Vec<_> = rows.iter().map(|r| r.block_number).collect();
        assert_eq!(blocks, vec![30, 20]);
    }

    #[test]
    fn short_page_is_untouched() {
        let mut rows = vec![transfer(30, 0), transfer(10, 0)];
        trim_partial_block(&mut rows, 4);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn single_block_page_is_kept() {
        let mut rows = vec![transfer(10, 0), transfer(10, 1)];
        trim_partial_block(&mut rows, 2);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn status_zero_no_transactions_is_empty() {
        let resp: ApiResponse = serde_json::from_str(
            r#"{"status":"0","message":"No transactions found","result":[]}"#,
        )
        .unwrap();
        assert!(resp.is_no_records());
        assert!(!resp.is_rate_limited());
    }

    #[test]
    fn rate_limit_message_is_detected() {
        let resp: ApiResponse = serde_json::from_str(
            r#"{"status":"0","message":"NOTOK","result":"Max rate limit reached"}"#,
        )
        .unwrap();
        assert!(resp.is_rate_limited());
    }
}
