// src/pipeline/worker.rs

//! Crawl workers draining the work queue.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::error::{AppError, Result};
use crate::models::{IndexSummary, PoolSummary, QueueItem};
use crate::queue::{Delivery, WorkQueue};
use crate::services::{Indexer, ManifestCrawler};
use crate::utils::CancelSignal;

/// Result of processing one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlOutcome {
    pub bucket_id: String,
    pub index: IndexSummary,
    /// Malformed manifests left out of the index
    pub skipped_manifests: usize,
}

/// Crawls one bucket and reconciles its documents.
pub struct BucketCrawler {
    crawler: Arc<dyn ManifestCrawler>,
    indexer: Arc<dyn Indexer>,
}

impl BucketCrawler {
    pub fn new(crawler: Arc<dyn ManifestCrawler>, indexer: Arc<dyn Indexer>) -> Self {
        Self { crawler, indexer }
    }

    /// Process one queue item. Safe to repeat for the same bucket.
    pub async fn run(&self, item: &QueueItem, cancel: &CancelSignal) -> Result<CrawlOutcome> {
        let bucket = &item.bucket;
        let records = cancel.guard(self.crawler.crawl(bucket)).await?;
        let skipped = records.skip_counter();

        let index = self.indexer.index(&bucket.id, records, cancel).await?;
        let outcome = CrawlOutcome {
            bucket_id: bucket.id.clone(),
            index,
            skipped_manifests: skipped.load(Ordering::Relaxed),
        };

        log::info!(
            "[{}] Indexed {} manifests, removed {}, skipped {}",
            outcome.bucket_id,
            outcome.index.upserted,
            outcome.index.deleted,
            outcome.skipped_manifests
        );
        Ok(outcome)
    }
}

/// Fixed pool of workers, each looping dequeue → crawl → index → ack.
pub struct WorkerPool {
    crawler: Arc<BucketCrawler>,
    queue: Arc<dyn WorkQueue>,
    workers: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        crawler: Arc<BucketCrawler>,
        queue: Arc<dyn WorkQueue>,
        workers: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            crawler,
            queue,
            workers: workers.max(1),
            poll_interval,
        }
    }

    /// Drain the queue.
    ///
    /// Returns once no item is visible or leased anywhere, or once `cancel`
    /// fires. Item failures are nacked and counted; a queue transport error
    /// stops the worker that hit it and is returned after the others finish.
    pub async fn run(&self, cancel: &CancelSignal) -> Result<PoolSummary> {
        log::info!("Starting {} workers", self.workers);

        let mut tasks = JoinSet::new();
        for id in 0..self.workers {
            let worker = Worker {
                id,
                crawler: Arc::clone(&self.crawler),
                queue: Arc::clone(&self.queue),
                poll_interval: self.poll_interval,
                cancel: cancel.clone(),
            };
            tasks.spawn(worker.run());
        }

        let mut summary = PoolSummary::default();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(part)) => summary.merge(part),
                Ok(Err(e)) => {
                    log::error!("Worker stopped: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    log::error!("Worker panicked: {}", e);
                    first_error.get_or_insert(AppError::queue(format!("worker panicked: {e}")));
                }
            }
        }

        log::info!(
            "Workers finished: {} succeeded, {} failed, {} upserted, {} deleted",
            summary.succeeded,
            summary.failed,
            summary.upserted,
            summary.deleted
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

struct Worker {
    id: usize,
    crawler: Arc<BucketCrawler>,
    queue: Arc<dyn WorkQueue>,
    poll_interval: Duration,
    cancel: CancelSignal,
}

impl Worker {
    async fn run(self) -> Result<PoolSummary> {
        let mut summary = PoolSummary::default();

        while !self.cancel.is_cancelled() {
            let delivery = match self.queue.dequeue().await? {
                Some(delivery) => delivery,
                None => {
                    if self.queue.outstanding().await? == 0 {
                        break;
                    }
                    // Leases held by other workers may still come back.
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                    continue;
                }
            };
            self.process(delivery, &mut summary).await?;
        }

        log::debug!("Worker {} done", self.id);
        Ok(summary)
    }

    async fn process(&self, delivery: Delivery, summary: &mut PoolSummary) -> Result<()> {
        let bucket_id = &delivery.item.bucket.id;
        match self.crawler.run(&delivery.item, &self.cancel).await {
            Ok(outcome) => {
                self.queue.ack(&delivery).await?;
                summary.succeeded += 1;
                summary.upserted += outcome.index.upserted;
                summary.deleted += outcome.index.deleted;
                summary.skipped_manifests += outcome.skipped_manifests;
            }
            Err(AppError::Cancelled) => {
                log::info!("[{}] Cancelled, handing back to the queue", bucket_id);
                self.queue.nack(&delivery).await?;
            }
            Err(e) => {
                log::error!(
                    "[{}] Failed (delivery {}): {}",
                    bucket_id,
                    delivery.deliveries,
                    e
                );
                summary.failed += 1;
                self.queue.nack(&delivery).await?;
            }
        }
        Ok(())
    }
}
