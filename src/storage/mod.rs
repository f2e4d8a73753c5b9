//! External index backends.
//!
//! Every backend implements [`DocumentIndex`], the upsert-by-key /
//! delete-by-key boundary the indexer reconciles against.
//!
//! | Backend           | Where documents live                          |
//! |-------------------|-----------------------------------------------|
//! | `MemoryIndex`     | in-process map (tests, dry runs)              |
//! | `LocalIndex`      | one JSON file, atomically replaced            |
//! | `HttpSearchIndex` | hosted search service (`docs/index` REST API) |
//! | `S3Index`         | `<prefix>/<hex bucket id>/<key>.json` objects |

pub mod local;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;
pub mod search;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{IndexDocument, Key};

// Re-export for convenience
pub use local::LocalIndex;
pub use memory::MemoryIndex;
#[cfg(feature = "s3")]
pub use s3::S3Index;
pub use search::HttpSearchIndex;

/// Key-addressed document store shared by all workers.
///
/// Implementations must be safe for concurrent calls on different buckets.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Replace (or create) each document under its key.
    async fn upsert(&self, docs: &[IndexDocument]) -> Result<()>;

    /// Keys of every document currently indexed for `bucket_id`.
    async fn keys_for_bucket(&self, bucket_id: &str) -> Result<HashSet<Key>>;

    /// Delete documents by key. Missing keys are not an error.
    async fn delete(&self, bucket_id: &str, keys: &[Key]) -> Result<()>;

    /// Every bucket id with at least one document.
    async fn bucket_ids(&self) -> Result<HashSet<String>>;
}

#[async_trait]
impl<T: DocumentIndex + ?Sized> DocumentIndex for Arc<T> {
    async fn upsert(&self, docs: &[IndexDocument]) -> Result<()> {
        (**self).upsert(docs).await
    }

    async fn keys_for_bucket(&self, bucket_id: &str) -> Result<HashSet<Key>> {
        (**self).keys_for_bucket(bucket_id).await
    }

    async fn delete(&self, bucket_id: &str, keys: &[Key]) -> Result<()> {
        (**self).delete(bucket_id, keys).await
    }

    async fn bucket_ids(&self) -> Result<HashSet<String>> {
        (**self).bucket_ids().await
    }
}
