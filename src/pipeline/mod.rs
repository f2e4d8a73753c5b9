// src/pipeline/mod.rs

//! Pipeline orchestration and composition root.
//!
//! - `dispatch`: discover buckets and enqueue them
//! - `worker`: drain the queue, crawl and index each bucket
//! - `retry` / `timing`: decorators wrapped around every outbound service
//!
//! [`Services::build`] wires the production graph from [`Config`];
//! [`Services::compose`] wires the same graph around any backends.

pub mod dispatch;
pub mod retry;
pub mod timing;
pub mod worker;

use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::models::{Config, IndexBackend, PoolSummary};
use crate::queue::{self, WorkQueue};
use crate::services::{
    BucketSearch, GitHubSearch, GitManifestCrawler, KeyGenerator, ManifestCrawler, SearchIndexer,
};
use crate::storage::{DocumentIndex, HttpSearchIndex, LocalIndex, MemoryIndex};
use crate::utils::CancelSignal;
use crate::utils::http::create_async_client;

pub use dispatch::{DispatchSummary, run_dispatcher};
pub use retry::{Retry, RetryPolicy};
pub use timing::{LogSink, MemorySink, Timed, Timing, TimingSink};
pub use worker::{BucketCrawler, CrawlOutcome, WorkerPool};

/// The fixed service graph of one process.
pub struct Services {
    /// Repository search, with retry and timing
    pub search: Arc<dyn BucketSearch>,
    /// External index client, with retry and timing
    pub index: Arc<dyn DocumentIndex>,
    /// Crawl + index of a single bucket
    pub crawler: Arc<BucketCrawler>,
    pub queue: Arc<dyn WorkQueue>,
}

impl Services {
    /// Build the production graph described by `config`.
    pub async fn build(config: &Config) -> Result<Self> {
        let client = create_async_client(&config.crawler)?;

        let search: Arc<dyn BucketSearch> =
            Arc::new(GitHubSearch::new(client.clone(), &config.discovery));
        let manifests: Arc<dyn ManifestCrawler> =
            Arc::new(GitManifestCrawler::new(&config.crawler));
        let store = open_index(config, client).await?;
        let queue: Arc<dyn WorkQueue> = Arc::from(queue::from_config(&config.queue)?);

        Ok(Self::compose(
            search,
            manifests,
            store,
            queue,
            RetryPolicy::from(&config.retry),
            config.index.batch_size,
            Arc::new(LogSink),
        ))
    }

    /// Wrap the given backends in the retry and timing decorators.
    ///
    /// Search, crawl and index-store calls are retried; every operation of
    /// every service, the indexer included, is timed.
    pub fn compose(
        search: Arc<dyn BucketSearch>,
        manifests: Arc<dyn ManifestCrawler>,
        store: Arc<dyn DocumentIndex>,
        queue: Arc<dyn WorkQueue>,
        retry: RetryPolicy,
        batch_size: usize,
        sink: Arc<dyn TimingSink>,
    ) -> Self {
        let search = Arc::new(Timed::new(
            Retry::new(search, retry),
            "discovery",
            Arc::clone(&sink),
        ));
        let manifests = Arc::new(Timed::new(
            Retry::new(manifests, retry),
            "crawler",
            Arc::clone(&sink),
        ));
        let index: Arc<dyn DocumentIndex> = Arc::new(Timed::new(
            Retry::new(store, retry),
            "index",
            Arc::clone(&sink),
        ));
        let indexer = Arc::new(Timed::new(
            SearchIndexer::new(Arc::clone(&index), KeyGenerator::new(), batch_size),
            "indexer",
            sink,
        ));

        Self {
            search,
            index,
            crawler: Arc::new(BucketCrawler::new(manifests, indexer)),
            queue,
        }
    }

    /// Worker pool over this graph's queue.
    pub fn worker_pool(&self, config: &Config) -> WorkerPool {
        WorkerPool::new(
            Arc::clone(&self.crawler),
            Arc::clone(&self.queue),
            config.crawler.worker_count(),
            config.queue.poll_interval(),
        )
    }
}

async fn open_index(config: &Config, client: reqwest::Client) -> Result<Arc<dyn DocumentIndex>> {
    let index: Arc<dyn DocumentIndex> = match config.index.backend {
        IndexBackend::Memory => Arc::new(MemoryIndex::new()),
        IndexBackend::Local => Arc::new(LocalIndex::new(&config.index.path)),
        IndexBackend::Search => Arc::new(HttpSearchIndex::new(client, &config.index)),
        #[cfg(feature = "s3")]
        IndexBackend::S3 => Arc::new(crate::storage::S3Index::from_config(&config.index).await?),
        #[cfg(not(feature = "s3"))]
        IndexBackend::S3 => {
            return Err(AppError::config(
                "index backend 's3' requires the `s3` feature",
            ));
        }
    };
    Ok(index)
}

/// Totals of a bounded run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub dispatch: DispatchSummary,
    pub pool: PoolSummary,
}

/// Bounded run: dispatch into the queue, then drain it.
///
/// If discovery fails part-way, the buckets it already enqueued are still
/// drained before the discovery error is returned.
pub async fn run_pipeline(
    config: &Config,
    services: &Services,
    cancel: &CancelSignal,
) -> Result<RunSummary> {
    let dispatched = run_dispatcher(
        &config.discovery,
        services.search.as_ref(),
        services.queue.as_ref(),
        Some(services.index.as_ref()),
        cancel,
    )
    .await;

    let (dispatch, discovery_error) = match dispatched {
        Ok(summary) => (summary, None),
        Err(AppError::Cancelled) => return Err(AppError::Cancelled),
        Err(e) => {
            log::error!("Discovery ended early: {}", e);
            (DispatchSummary::default(), Some(e))
        }
    };

    let pool = services.worker_pool(config).run(cancel).await?;
    match discovery_error {
        Some(e) => Err(e),
        None => Ok(RunSummary { dispatch, pool }),
    }
}
