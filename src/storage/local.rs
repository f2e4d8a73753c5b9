//! Local filesystem index.
//!
//! All documents live in a single JSON file:
//!
//! ```text
//! {
//!   "updated_at": "2024-03-01T12:00:00Z",
//!   "count": 2,
//!   "documents": [ { "key": "...", "bucketId": "...", ... }, ... ]
//! }
//! ```
//!
//! The file is loaded once and every mutation rewrites it atomically
//! (temp file, then rename), so readers never see a torn file.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::{IndexDocument, Key};
use crate::storage::DocumentIndex;

/// On-disk shape of the index file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFile {
    /// ISO 8601 timestamp of last update
    pub updated_at: DateTime<Utc>,
    pub count: usize,
    pub documents: Vec<IndexDocument>,
}

impl IndexFile {
    pub fn new(documents: Vec<IndexDocument>) -> Self {
        Self {
            updated_at: Utc::now(),
            count: documents.len(),
            documents,
        }
    }
}

type DocMap = BTreeMap<Key, IndexDocument>;

/// Index persisted to one JSON file.
pub struct LocalIndex {
    path: PathBuf,
    docs: Mutex<Option<DocMap>>,
}

impl LocalIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            docs: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the index file, returning an empty map if it doesn't exist.
    async fn read_file(&self) -> Result<DocMap> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let file: IndexFile = serde_json::from_slice(&bytes)?;
                Ok(file
                    .documents
                    .into_iter()
                    .map(|doc| (doc.key.clone(), doc))
                    .collect())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No index at {:?}, starting empty", self.path);
                Ok(DocMap::new())
            }
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_file(&self, docs: &DocMap) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = IndexFile::new(docs.values().cloned().collect());
        let bytes = serde_json::to_vec_pretty(&file)?;

        let tmp = self.path.with_extension("tmp");
        let mut out = tokio::fs::File::create(&tmp).await?;
        out.write_all(&bytes).await?;
        out.flush().await?;
        drop(out);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| AppError::index_write(format!("{:?}: {}", self.path, e)))
    }

    /// Run `f` over the loaded documents, holding the lock.
    async fn with_docs<T>(&self, f: impl FnOnce(&mut DocMap) -> T) -> Result<T> {
        let mut guard = self.docs.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_file().await?);
        }
        let docs = guard.get_or_insert_with(DocMap::new);
        Ok(f(docs))
    }

    /// Apply a mutation and persist it. The cache is dropped if the write
    /// fails so the next call reloads what is actually on disk.
    async fn mutate(&self, f: impl FnOnce(&mut DocMap) -> bool) -> Result<()> {
        let mut guard = self.docs.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_file().await?);
        }
        let docs = guard.get_or_insert_with(DocMap::new);
        if !f(docs) {
            return Ok(());
        }
        if let Err(e) = self.write_file(docs).await {
            *guard = None;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentIndex for LocalIndex {
    async fn upsert(&self, docs: &[IndexDocument]) -> Result<()> {
        self.mutate(|map| {
            let mut changed = false;
            for doc in docs {
                if map.get(&doc.key) != Some(doc) {
                    map.insert(doc.key.clone(), doc.clone());
                    changed = true;
                }
            }
            changed
        })
        .await
    }

    async fn keys_for_bucket(&self, bucket_id: &str) -> Result<HashSet<Key>> {
        self.with_docs(|map| {
            map.values()
                .filter(|doc| doc.bucket_id == bucket_id)
                .map(|doc| doc.key.clone())
                .collect()
        })
        .await
    }

    async fn delete(&self, _bucket_id: &str, keys: &[Key]) -> Result<()> {
        self.mutate(|map| {
            let before = map.len();
            for key in keys {
                map.remove(key);
            }
            map.len() != before
        })
        .await
    }

    async fn bucket_ids(&self) -> Result<HashSet<String>> {
        self.with_docs(|map| map.values().map(|doc| doc.bucket_id.clone()).collect())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn doc(key: &str, bucket: &str, version: &str) -> IndexDocument {
        IndexDocument {
            key: Key::new(key),
            name: key.to_string(),
            version: version.into(),
            description: Some("test".into()),
            homepage: None,
            license: None,
            bucket_id: bucket.into(),
            source_path: format!("bucket/{key}.json"),
            last_modified: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_read_nonexistent_is_empty() {
        let tmp = TempDir::new().unwrap();
        let index = LocalIndex::new(tmp.path().join("index.json"));
        assert!(index.bucket_ids().await.unwrap().is_empty());
        assert!(!index.path().exists());
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/index.json");

        let index = LocalIndex::new(&path);
        index
            .upsert(&[doc("k1", "a", "1"), doc("k2", "b", "1")])
            .await
            .unwrap();
        index.delete("b", &[Key::new("k2")]).await.unwrap();

        let reopened = LocalIndex::new(&path);
        let keys = reopened.keys_for_bucket("a").await.unwrap();
        assert_eq!(keys, HashSet::from([Key::new("k1")]));
        assert!(reopened.keys_for_bucket("b").await.unwrap().is_empty());

        let file: IndexFile = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(file.count, 1);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_unchanged_upsert_does_not_rewrite() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.json");
        let index = LocalIndex::new(&path);

        let d = doc("k1", "a", "1");
        index.upsert(std::slice::from_ref(&d)).await.unwrap();
        let first = std::fs::read(&path).unwrap();

        index.upsert(&[d]).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), first);
    }
}
