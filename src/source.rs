//! Page source capability: the next page of rows in `[floor, end_block]`,
//! newest first. Also a retrying decorator.

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::record::TokenTransfer;
use crate::storage::index::{BlockNumber, BlockRange};

/// Inclusive block window for one page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub end_block: BlockNumber,
    pub floor: BlockNumber,
}

/// A non-empty batch of rows and the lowest block among them.
#[derive(Debug, Clone)]
pub struct Page {
    rows: Vec<TokenTransfer>,
    oldest: BlockNumber,
}

impl Page {
    /// `None` for an empty batch.
    pub fn new(rows: Vec<TokenTransfer>) -> Option<Self> {
        let oldest = rows.iter().map(|r| r.block_number).min()?;
        Some(Self { rows, oldest })
    }

    /// Keep only the rows inside `window`. `None` if nothing is left.
    pub fn within(mut self, window: BlockRange) -> Option<Self> {
        self.rows.retain(|r| window.contains(r.block_number));
        Self::new(self.rows)
    }

    pub fn rows(&self) -> &[TokenTransfer] {
        &self.rows
    }

    pub fn oldest(&self) -> BlockNumber {
        self.oldest
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// Worth retrying: rate limits, timeouts, 5xx.
    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),

    #[error("gave up after {attempts} attempt(s): {reason}")]
    Exhausted { attempts: u32, reason: String },
}

impl SourceError {
    pub fn attempts(&self) -> u32 {
        match self {
            SourceError::Exhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }
}

/// Remote paginated data, walked backwards by block number.
#[allow(async_fn_in_trait)]
pub trait PageSource {
    /// Newest block that currently has rows.
    async fn head(&mut self) -> Result<BlockNumber, SourceError>;

    /// Rows with `floor <= block <= end_block`, newest first. `Ok(None)` when
    /// the window holds no rows.
    async fn fetch_page(&mut self, request: PageRequest) -> Result<Option<Page>, SourceError>;
}

/// Retry schedule for [`RetryingSource`]: `base_delay`, doubled per attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(6)))
    }
}

/// Retries transient failures of the wrapped source, then reports
/// [`SourceError::Exhausted`].
pub struct RetryingSource<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> RetryingSource<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    async fn pause(&self, attempt: u32, what: &str, reason: &str) {
        let backoff = self.policy.backoff(attempt);
        warn!(
            attempt,
            max_retries = self.policy.max_retries,
            ?backoff,
            error = reason,
            "{what} failed, will retry"
        );
        sleep(backoff).await;
    }
}

impl<S: PageSource> PageSource for RetryingSource<S> {
    async fn head(&mut self) -> Result<BlockNumber, SourceError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.head().await {
                Err(SourceError::Transient(reason)) => {
                    attempt += 1;
                    if attempt > self.policy.max_retries {
                        return Err(SourceError::Exhausted { attempts: attempt, reason });
                    }
                    self.pause(attempt, "head lookup", &reason).await;
                }
                other => return other,
            }
        }
    }

    async fn fetch_page(&mut self, request: PageRequest) -> Result<Option<Page>, SourceError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.fetch_page(request).await {
                Err(SourceError::Transient(reason)) => {
                    attempt += 1;
                    if attempt > self.policy.max_retries {
                        return Err(SourceError::Exhausted { attempts: attempt, reason });
                    }
                    self.pause(attempt, "page fetch", &reason).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky {
        failures_left: u32,
        calls: u32,
    }

    impl PageSource for Flaky {
        async fn head(&mut self) -> Result<BlockNumber, SourceError> {
            Ok(100)
        }

        async fn fetch_page(&mut self, _: PageRequest) -> Result<Option<Page>, SourceError> {
            self.calls += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(SourceError::Transient("rate limit".into()));
            }
            Ok(None)
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy { max_retries, base_delay: Duration::from_millis(1) }
    }

    const REQ: PageRequest = PageRequest { end_block: 10, floor: 0 };

    #[tokio::test]
    async fn transient_errors_are_retried_within_budget() {
        let mut source = RetryingSource::new(Flaky { failures_left: 2, calls: 0 }, policy(3));
        assert!(source.fetch_page(REQ).await.unwrap().is_none());
        assert_eq!(source.get_mut().calls, 3);
    }

    #[tokio::test]
    async fn exhausted_budget_reports_attempts() {
        let mut source = RetryingSource::new(Flaky { failures_left: 10, calls: 0 }, policy(2));
        let err = source.fetch_page(REQ).await.unwrap_err();
        assert_eq!(err.attempts(), 3);
        assert_eq!(source.get_mut().calls, 3);
    }

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy { max_retries: 5, base_delay: Duration::from_millis(250) };
        assert_eq!(p.backoff(1), Duration::from_millis(250));
        assert_eq!(p.backoff(3), Duration::from_millis(1000));
    }

    #[test]
    fn oldest_follows_window() {
        use crate::record::tests::transfer;

        let page = Page::new(vec![transfer(30, 0), transfer(20, 0), transfer(5, 0)]).unwrap();
        assert_eq!(page.oldest(), 5);

        let page = page.within(BlockRange::new(25, 10).unwrap()).unwrap();
        assert_eq!(page.oldest(), 20);
        assert_eq!(page.len(), 1);
        assert!(page.within(BlockRange::new(19, 10).unwrap()).is_none());
    }
}
