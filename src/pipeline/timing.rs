// src/pipeline/timing.rs

//! Timing decorator.
//!
//! [`Timed`] measures every operation of the search, crawler, indexer and
//! index traits, success or not, and hands a [`Timing`] record to a
//! [`TimingSink`]. The default [`LogSink`] writes one JSON line per call on
//! the `timing` log target.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::models::{BucketReference, IndexDocument, IndexSummary, Key};
use crate::services::{BucketSearch, Indexer, ManifestCrawler, ManifestStream, SearchPage};
use crate::storage::DocumentIndex;
use crate::utils::CancelSignal;

/// One measured call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Timing {
    /// `<component>.<operation>`, e.g. `crawler.crawl`
    pub operation: String,
    pub duration_ms: u64,
    pub success: bool,
}

/// Receives timing records.
pub trait TimingSink: Send + Sync {
    fn record(&self, timing: Timing);
}

/// Writes timings as JSON on the `timing` log target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl TimingSink for LogSink {
    fn record(&self, timing: Timing) {
        match serde_json::to_string(&timing) {
            Ok(line) => log::info!(target: "timing", "{}", line),
            Err(e) => log::warn!(target: "timing", "unserializable timing: {}", e),
        }
    }
}

/// Keeps timings in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Timing>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Timing> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TimingSink for MemorySink {
    fn record(&self, timing: Timing) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(timing);
    }
}

/// Timing decorator.
pub struct Timed<T> {
    inner: T,
    component: &'static str,
    sink: Arc<dyn TimingSink>,
}

impl<T> Timed<T> {
    pub fn new(inner: T, component: &'static str, sink: Arc<dyn TimingSink>) -> Self {
        Self {
            inner,
            component,
            sink,
        }
    }

    async fn measure<R>(&self, operation: &str, fut: impl Future<Output = Result<R>>) -> Result<R> {
        let started = Instant::now();
        let result = fut.await;
        self.sink.record(Timing {
            operation: format!("{}.{}", self.component, operation),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            success: result.is_ok(),
        });
        result
    }
}

#[async_trait]
impl<T: BucketSearch> BucketSearch for Timed<T> {
    async fn search_page(&self, query: &str, page: u32, per_page: u32) -> Result<SearchPage> {
        self.measure("search_page", self.inner.search_page(query, page, per_page))
            .await
    }
}

#[async_trait]
impl<T: ManifestCrawler> ManifestCrawler for Timed<T> {
    async fn crawl(&self, bucket: &BucketReference) -> Result<ManifestStream> {
        self.measure("crawl", self.inner.crawl(bucket)).await
    }
}

#[async_trait]
impl<T: Indexer> Indexer for Timed<T> {
    async fn index(
        &self,
        bucket_id: &str,
        records: ManifestStream,
        cancel: &CancelSignal,
    ) -> Result<IndexSummary> {
        self.measure("index", self.inner.index(bucket_id, records, cancel))
            .await
    }
}

#[async_trait]
impl<T: DocumentIndex> DocumentIndex for Timed<T> {
    async fn upsert(&self, docs: &[IndexDocument]) -> Result<()> {
        self.measure("upsert", self.inner.upsert(docs)).await
    }

    async fn keys_for_bucket(&self, bucket_id: &str) -> Result<HashSet<Key>> {
        self.measure("keys_for_bucket", self.inner.keys_for_bucket(bucket_id))
            .await
    }

    async fn delete(&self, bucket_id: &str, keys: &[Key]) -> Result<()> {
        self.measure("delete", self.inner.delete(bucket_id, keys))
            .await
    }

    async fn bucket_ids(&self) -> Result<HashSet<String>> {
        self.measure("bucket_ids", self.inner.bucket_ids()).await
    }
}
