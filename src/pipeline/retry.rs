// src/pipeline/retry.rs

//! Retry with exponential backoff for outbound calls.
//!
//! [`Retry`] wraps any search, crawler or index backend and runs every one of
//! its operations through a [`RetryPolicy`]. Only errors for which
//! [`AppError::is_transient`](crate::error::AppError::is_transient) holds
//! are retried.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{BucketReference, IndexDocument, Key, RetryConfig};
use crate::services::{BucketSearch, ManifestCrawler, ManifestStream, SearchPage};
use crate::storage::DocumentIndex;

/// Bounded attempts with a non-decreasing delay between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first call included
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based):
    /// `min(initial * 2^(attempt-1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        operation,
                        attempt,
                        self.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        log::error!("{} gave up after {} attempts: {}", operation, attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Retry decorator.
pub struct Retry<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> Retry<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: BucketSearch> BucketSearch for Retry<T> {
    async fn search_page(&self, query: &str, page: u32, per_page: u32) -> Result<SearchPage> {
        self.policy
            .run("search_page", || self.inner.search_page(query, page, per_page))
            .await
    }
}

#[async_trait]
impl<T: ManifestCrawler> ManifestCrawler for Retry<T> {
    async fn crawl(&self, bucket: &BucketReference) -> Result<ManifestStream> {
        self.policy.run("crawl", || self.inner.crawl(bucket)).await
    }
}

#[async_trait]
impl<T: DocumentIndex> DocumentIndex for Retry<T> {
    async fn upsert(&self, docs: &[IndexDocument]) -> Result<()> {
        self.policy.run("upsert", || self.inner.upsert(docs)).await
    }

    async fn keys_for_bucket(&self, bucket_id: &str) -> Result<HashSet<Key>> {
        self.policy
            .run("keys_for_bucket", || self.inner.keys_for_bucket(bucket_id))
            .await
    }

    async fn delete(&self, bucket_id: &str, keys: &[Key]) -> Result<()> {
        self.policy
            .run("delete", || self.inner.delete(bucket_id, keys))
            .await
    }

    async fn bucket_ids(&self) -> Result<HashSet<String>> {
        self.policy.run("bucket_ids", || self.inner.bucket_ids()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(100), Duration::from_secs(1))
    }

    /// Fails transiently `failures` times, then succeeds.
    async fn flaky(calls: &AtomicU32, failures: u32) -> Result<u32> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= failures {
            Err(AppError::transient(format!("boom {n}")))
        } else {
            Ok(n)
        }
    }

    #[test]
    fn test_delay_is_non_decreasing_and_capped() {
        let policy = fast(10);
        let delays: Vec<Duration> = (1..10).map(|a| policy.delay_for(a)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = fast(4).run("op", || flaky(&calls, 3)).await;
        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result = fast(3).run("op", || flaky(&calls, 3)).await;
        assert!(matches!(result, Err(AppError::TransientNetwork(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast(5)
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Authentication("bad token".into()))
            })
            .await;
        assert!(matches!(result, Err(AppError::Authentication(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
