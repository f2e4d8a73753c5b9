//! Service layer for the bucket crawler.
//!
//! This module defines the capability traits the pipeline is written
//! against, and their production implementations:
//! - Bucket search (`BucketSearch`, implemented by `GitHubSearch`)
//! - Manifest crawling (`ManifestCrawler`, implemented by `GitManifestCrawler`)
//! - Index reconciliation (`Indexer`, implemented by `SearchIndexer`)
//! - Document keys (`KeyGenerator`)
//!
//! The retry and timing decorators in `pipeline` implement the same traits,
//! so callers never know whether they hold a bare or a decorated service.

mod discovery;
mod indexer;
mod keys;
mod manifests;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{BucketReference, IndexSummary};
use crate::utils::CancelSignal;

pub use discovery::GitHubSearch;
pub use indexer::SearchIndexer;
pub use keys::KeyGenerator;
pub use manifests::{GitManifestCrawler, ManifestLayout, ManifestStream};

/// One page of repository search results.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub buckets: Vec<BucketReference>,
    /// Total hits reported by the search API across all pages
    pub total_count: u64,
}

/// Remote repository search used for bucket discovery.
#[async_trait]
pub trait BucketSearch: Send + Sync {
    /// Fetch one page (1-based) of results for `query`.
    async fn search_page(&self, query: &str, page: u32, per_page: u32) -> Result<SearchPage>;
}

/// Reads the manifests of one bucket.
#[async_trait]
pub trait ManifestCrawler: Send + Sync {
    /// Make the bucket's tree available and stream its parsed manifests.
    ///
    /// Fails with `CrawlUnavailable` when the repository cannot be read.
    async fn crawl(&self, bucket: &BucketReference) -> Result<ManifestStream>;
}

/// Reconciles one bucket's documents in the external index.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Upsert every record, then delete the bucket's documents that were not
    /// upserted. The delete phase only runs after all upserts succeeded.
    async fn index(
        &self,
        bucket_id: &str,
        records: ManifestStream,
        cancel: &CancelSignal,
    ) -> Result<IndexSummary>;
}

#[async_trait]
impl<T: BucketSearch + ?Sized> BucketSearch for Arc<T> {
    async fn search_page(&self, query: &str, page: u32, per_page: u32) -> Result<SearchPage> {
        (**self).search_page(query, page, per_page).await
    }
}

#[async_trait]
impl<T: ManifestCrawler + ?Sized> ManifestCrawler for Arc<T> {
    async fn crawl(&self, bucket: &BucketReference) -> Result<ManifestStream> {
        (**self).crawl(bucket).await
    }
}

#[async_trait]
impl<T: Indexer + ?Sized> Indexer for Arc<T> {
    async fn index(
        &self,
        bucket_id: &str,
        records: ManifestStream,
        cancel: &CancelSignal,
    ) -> Result<IndexSummary> {
        (**self).index(bucket_id, records, cancel).await
    }
}
