//! In-process index.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{IndexDocument, Key};
use crate::storage::DocumentIndex;

/// Index held in memory; [`MemoryIndex::snapshot`] exposes its state.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    docs: Mutex<BTreeMap<Key, IndexDocument>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current documents ordered by key.
    pub fn snapshot(&self) -> Vec<IndexDocument> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Key, IndexDocument>> {
        // No operation leaves the map half-updated, so a poisoned lock is usable.
        self.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DocumentIndex for MemoryIndex {
    async fn upsert(&self, docs: &[IndexDocument]) -> Result<()> {
        let mut map = self.lock();
        for doc in docs {
            map.insert(doc.key.clone(), doc.clone());
        }
        Ok(())
    }

    async fn keys_for_bucket(&self, bucket_id: &str) -> Result<HashSet<Key>> {
        Ok(self
            .lock()
            .values()
            .filter(|doc| doc.bucket_id == bucket_id)
            .map(|doc| doc.key.clone())
            .collect())
    }

    async fn delete(&self, _bucket_id: &str, keys: &[Key]) -> Result<()> {
        let mut map = self.lock();
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }

    async fn bucket_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .lock()
            .values()
            .map(|doc| doc.bucket_id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn doc(key: &str, bucket: &str) -> IndexDocument {
        IndexDocument {
            key: Key::new(key),
            name: key.to_string(),
            version: "1".into(),
            description: None,
            homepage: None,
            license: None,
            bucket_id: bucket.into(),
            source_path: format!("{key}.json"),
            last_modified: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_key() {
        let index = MemoryIndex::new();
        index.upsert(&[doc("k1", "a"), doc("k2", "b")]).await.unwrap();

        let mut updated = doc("k1", "a");
        updated.version = "2".into();
        index.upsert(&[updated]).await.unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index.snapshot()[0].version, "2");
    }

    #[tokio::test]
    async fn test_keys_and_delete_per_bucket() {
        let index = MemoryIndex::new();
        index
            .upsert(&[doc("k1", "a"), doc("k2", "a"), doc("k3", "b")])
            .await
            .unwrap();

        let keys = index.keys_for_bucket("a").await.unwrap();
        assert_eq!(keys.len(), 2);

        index.delete("a", &[Key::new("k1"), Key::new("missing")]).await.unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.bucket_ids().await.unwrap().len(), 2);
    }
}
