//! AWS S3 index backend.
//!
//! One object per document:
//!
//! ```text
//! s3://{bucket}/{prefix}/{hex(bucket id)}/{key}.json
//! ```
//!
//! Bucket ids are hex-encoded so that `owner/repo` stays a single path
//! segment and can be recovered from a delimiter listing.

use std::collections::HashSet;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use futures::stream::{self, StreamExt, TryStreamExt};

use crate::error::{AppError, Result};
use crate::models::{IndexConfig, IndexDocument, Key};
use crate::storage::DocumentIndex;

/// Concurrent object requests per call.
const CONCURRENCY: usize = 8;

/// S3-backed document index.
pub struct S3Index {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Index {
    pub fn new(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create the index from the ambient AWS configuration.
    pub async fn from_config(config: &IndexConfig) -> Result<Self> {
        let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Ok(Self::new(
            Client::new(&aws),
            &config.s3_bucket,
            &config.s3_prefix,
        ))
    }

    fn bucket_prefix(&self, bucket_id: &str) -> String {
        format!("{}/{}/", self.prefix, hex::encode(bucket_id))
    }

    fn object_key(&self, bucket_id: &str, key: &Key) -> String {
        format!("{}{}.json", self.bucket_prefix(bucket_id), key)
    }

    async fn put_json(&self, doc: &IndexDocument) -> Result<()> {
        let json = serde_json::to_vec(doc)?;
        let key = self.object_key(&doc.bucket_id, &doc.key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(json))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| AppError::index_write(format!("s3://{}/{}: {}", self.bucket, key, e)))?;
        Ok(())
    }

    async fn delete_object(&self, key: String) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| AppError::index_write(format!("s3://{}/{}: {}", self.bucket, key, e)))?;
        Ok(())
    }

    /// List object keys (or common prefixes, with a delimiter) under `prefix`.
    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_delimiter(delimiter.map(String::from))
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| AppError::S3(format!("list s3://{}/{}: {}", self.bucket, prefix, e)))?;

            if delimiter.is_some() {
                names.extend(
                    output
                        .common_prefixes()
                        .iter()
                        .filter_map(|p| p.prefix())
                        .map(String::from),
                );
            } else {
                names.extend(
                    output
                        .contents()
                        .iter()
                        .filter_map(|o| o.key())
                        .map(String::from),
                );
            }

            match output.next_continuation_token() {
                Some(next) if output.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string());
                }
                _ => break,
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl DocumentIndex for S3Index {
    async fn upsert(&self, docs: &[IndexDocument]) -> Result<()> {
        stream::iter(docs)
            .map(|doc| self.put_json(doc))
            .buffer_unordered(CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await?;
        log::debug!("Wrote {} documents to s3://{}", docs.len(), self.bucket);
        Ok(())
    }

    async fn keys_for_bucket(&self, bucket_id: &str) -> Result<HashSet<Key>> {
        let prefix = self.bucket_prefix(bucket_id);
        Ok(self
            .list(&prefix, None)
            .await?
            .iter()
            .filter_map(|name| name.strip_prefix(&prefix)?.strip_suffix(".json"))
            .map(Key::new)
            .collect())
    }

    async fn delete(&self, bucket_id: &str, keys: &[Key]) -> Result<()> {
        stream::iter(keys)
            .map(|key| self.delete_object(self.object_key(bucket_id, key)))
            .buffer_unordered(CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    async fn bucket_ids(&self) -> Result<HashSet<String>> {
        let root = format!("{}/", self.prefix);
        let prefixes = self.list(&root, Some("/")).await?;
        Ok(prefixes
            .iter()
            .filter_map(|p| decode_bucket_segment(p.strip_prefix(&root)?))
            .collect())
    }
}

/// Recover a bucket id from its `hex(id)/` listing segment.
fn decode_bucket_segment(segment: &str) -> Option<String> {
    let bytes = hex::decode(segment.trim_end_matches('/')).ok()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_segment_round_trip() {
        let segment = format!("{}/", hex::encode("owner/repo"));
        assert_eq!(
            decode_bucket_segment(&segment).as_deref(),
            Some("owner/repo")
        );
        assert!(decode_bucket_segment("not-hex/").is_none());
    }
}
