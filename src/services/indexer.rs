// src/services/indexer.rs

//! Two-phase index reconciliation for one bucket.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use crate::error::{AppError, Result};
use crate::models::{IndexDocument, IndexSummary, Key};
use crate::services::{Indexer, KeyGenerator, ManifestStream};
use crate::storage::DocumentIndex;
use crate::utils::CancelSignal;

/// Reconciles a bucket's documents against a [`DocumentIndex`].
///
/// Upserts every record first, then deletes the bucket's documents that were
/// not part of this crawl. Nothing is deleted unless every upsert succeeded.
pub struct SearchIndexer {
    index: Arc<dyn DocumentIndex>,
    keys: KeyGenerator,
    batch_size: usize,
}

impl SearchIndexer {
    pub fn new(index: Arc<dyn DocumentIndex>, keys: KeyGenerator, batch_size: usize) -> Self {
        Self {
            index,
            keys,
            batch_size: batch_size.max(1),
        }
    }

    /// Upload every record in batches and return the keys written.
    async fn upsert_all(&self, bucket_id: &str, mut records: ManifestStream) -> Result<HashSet<Key>> {
        let mut fresh = HashSet::new();
        let mut batch = Vec::with_capacity(self.batch_size);

        while let Some(mut record) = records.next().await {
            record.bucket_id = bucket_id.to_string();
            let key = self.keys.key(bucket_id, &record.path);
            fresh.insert(key.clone());
            batch.push(IndexDocument::from_record(key, record));

            if batch.len() >= self.batch_size {
                self.index.upsert(&batch).await?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.index.upsert(&batch).await?;
        }
        Ok(fresh)
    }

    async fn delete_stale(&self, bucket_id: &str, fresh: &HashSet<Key>) -> Result<usize> {
        let existing = self.index.keys_for_bucket(bucket_id).await?;
        let mut stale: Vec<Key> = existing.difference(fresh).cloned().collect();
        stale.sort();

        for chunk in stale.chunks(self.batch_size) {
            self.index.delete(bucket_id, chunk).await?;
        }
        Ok(stale.len())
    }
}

#[async_trait]
impl Indexer for SearchIndexer {
    async fn index(
        &self,
        bucket_id: &str,
        records: ManifestStream,
        cancel: &CancelSignal,
    ) -> Result<IndexSummary> {
        let fresh = cancel.guard(self.upsert_all(bucket_id, records)).await?;

        // Past this point the bucket is fully upserted; the delete phase is
        // either skipped entirely or run to completion.
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        let deleted = self.delete_stale(bucket_id, &fresh).await?;

        if deleted > 0 {
            log::info!("[{}] Removed {} stale documents", bucket_id, deleted);
        }
        Ok(IndexSummary {
            upserted: fresh.len(),
            deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::{TimeZone, Utc};

    use crate::models::ManifestRecord;
    use crate::storage::MemoryIndex;

    fn record(path: &str, version: &str) -> ManifestRecord {
        let json = format!(r#"{{"version":"{version}"}}"#);
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ManifestRecord::parse("a/b", path, json.as_bytes(), ts).unwrap()
    }

    fn stream(records: &[(&str, &str)]) -> ManifestStream {
        ManifestStream::from_records(records.iter().map(|(p, v)| record(p, v)).collect())
    }

    /// Memory index that logs calls and can fail upserts.
    #[derive(Default)]
    struct RecordingIndex {
        inner: MemoryIndex,
        calls: Mutex<Vec<String>>,
        fail_upserts: bool,
        /// Fired after the first successful upsert
        cancel_after_upsert: Option<CancelSignal>,
    }

    impl RecordingIndex {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DocumentIndex for RecordingIndex {
        async fn upsert(&self, docs: &[IndexDocument]) -> Result<()> {
            self.calls.lock().unwrap().push(format!("upsert:{}", docs.len()));
            if self.fail_upserts {
                return Err(AppError::index_write("rejected"));
            }
            self.inner.upsert(docs).await?;
            if let Some(cancel) = &self.cancel_after_upsert {
                cancel.cancel();
                tokio::task::yield_now().await;
            }
            Ok(())
        }

        async fn keys_for_bucket(&self, bucket_id: &str) -> Result<HashSet<Key>> {
            self.calls.lock().unwrap().push("list".into());
            self.inner.keys_for_bucket(bucket_id).await
        }

        async fn delete(&self, bucket_id: &str, keys: &[Key]) -> Result<()> {
            self.calls.lock().unwrap().push(format!("delete:{}", keys.len()));
            self.inner.delete(bucket_id, keys).await
        }

        async fn bucket_ids(&self) -> Result<HashSet<String>> {
            self.inner.bucket_ids().await
        }
    }

    #[tokio::test]
    async fn test_second_identical_run_is_noop() {
        let index = Arc::new(MemoryIndex::new());
        let indexer = SearchIndexer::new(index.clone(), KeyGenerator::new(), 10);
        let cancel = CancelSignal::new();
        let input = [("bucket/a.json", "1"), ("bucket/b.json", "2")];

        indexer.index("a/b", stream(&input), &cancel).await.unwrap();
        let before = index.snapshot();

        let summary = indexer.index("a/b", stream(&input), &cancel).await.unwrap();
        assert_eq!(summary.deleted, 0);
        assert_eq!(index.snapshot(), before);
    }

    #[tokio::test]
    async fn test_stale_documents_deleted_after_upserts() {
        let index = Arc::new(RecordingIndex::default());
        let indexer = SearchIndexer::new(index.clone(), KeyGenerator::new(), 2);
        let cancel = CancelSignal::new();

        indexer
            .index("a/b", stream(&[("x.json", "1"), ("y.json", "1"), ("z.json", "1")]), &cancel)
            .await
            .unwrap();
        index.calls.lock().unwrap().clear();

        let summary = indexer
            .index("a/b", stream(&[("x.json", "2")]), &cancel)
            .await
            .unwrap();
        assert_eq!(summary, IndexSummary { upserted: 1, deleted: 2 });
        assert_eq!(index.calls(), vec!["upsert:1", "list", "delete:2"]);

        let docs = index.inner.snapshot();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].version, "2");
        assert_eq!(docs[0].key, KeyGenerator::new().key("a/b", "x.json"));
    }

    #[tokio::test]
    async fn test_failed_upsert_never_deletes() {
        let index = Arc::new(RecordingIndex {
            fail_upserts: true,
            ..Default::default()
        });
        let indexer = SearchIndexer::new(index.clone(), KeyGenerator::new(), 10);

        let result = indexer
            .index("a/b", stream(&[("x.json", "1")]), &CancelSignal::new())
            .await;
        assert!(matches!(result, Err(AppError::IndexWrite(_))));
        assert_eq!(index.calls(), vec!["upsert:1"]);
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_delete_phase() {
        let index = Arc::new(RecordingIndex::default());
        let indexer = SearchIndexer::new(index.clone(), KeyGenerator::new(), 10);
        let cancel = CancelSignal::new();
        cancel.cancel();

        let result = indexer.index("a/b", stream(&[("x.json", "1")]), &cancel).await;
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert!(index.calls().iter().all(|c| !c.starts_with("delete")));
    }

    #[tokio::test]
    async fn test_cancel_between_batches_skips_delete_phase() {
        let cancel = CancelSignal::new();
        let index = Arc::new(RecordingIndex {
            cancel_after_upsert: Some(cancel.clone()),
            ..Default::default()
        });
        let old = record("old.json", "1");
        let old = IndexDocument::from_record(KeyGenerator::new().key("a/b", "old.json"), old);
        index.inner.upsert(&[old]).await.unwrap();
        let indexer = SearchIndexer::new(index.clone(), KeyGenerator::new(), 1);

        let input = [("x.json", "1"), ("y.json", "1"), ("z.json", "1")];
        let result = indexer.index("a/b", stream(&input), &cancel).await;

        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(index.calls(), vec!["upsert:1"]);
        // The stale document survives; only the first batch landed.
        assert_eq!(index.inner.len(), 2);
    }

    #[tokio::test]
    async fn test_other_buckets_untouched() {
        let index = Arc::new(MemoryIndex::new());
        let indexer = SearchIndexer::new(index.clone(), KeyGenerator::new(), 10);
        let cancel = CancelSignal::new();

        indexer.index("a/b", stream(&[("x.json", "1")]), &cancel).await.unwrap();
        indexer.index("c/d", stream(&[]), &cancel).await.unwrap();
        assert_eq!(index.len(), 1);
    }
}
