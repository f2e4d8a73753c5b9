// src/models/mod.rs

//! Domain models for the bucket crawler.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod bucket;
mod config;
mod manifest;

// Re-export all public types
pub use bucket::{BucketReference, QueueItem, bucket_id_from_url};
pub use config::{
    Config, CrawlerConfig, DiscoveryConfig, IndexBackend, IndexConfig, LoggingConfig,
    QueueBackend, QueueConfig, RetryConfig,
};
pub use manifest::{IndexDocument, Key, ManifestRecord};

/// Outcome of one bucket's index reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSummary {
    /// Documents written in the upsert phase
    pub upserted: usize,
    /// Stale documents removed in the delete phase
    pub deleted: usize,
}

/// Totals of a worker pool run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    /// Items crawled and indexed successfully
    pub succeeded: usize,
    /// Items that failed and were handed back to the queue
    pub failed: usize,
    pub upserted: usize,
    pub deleted: usize,
    /// Malformed manifests skipped during crawls
    pub skipped_manifests: usize,
}

impl PoolSummary {
    pub fn merge(&mut self, other: PoolSummary) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.upserted += other.upserted;
        self.deleted += other.deleted;
        self.skipped_manifests += other.skipped_manifests;
    }
}
