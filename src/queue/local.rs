//! Durable directory-backed queue.
//!
//! ## Layout
//!
//! ```text
//! {root}/
//! ├── pending/    # visible messages: {id}.json
//! ├── inflight/   # leased messages: {lease deadline ms}~{id}.json
//! ├── dead/       # dead-lettered messages
//! └── tmp/        # staging for atomic writes
//! ```
//!
//! A claim is a single rename from `pending/` to `inflight/`, so two
//! processes sharing the directory can never lease the same message. The
//! lease deadline is part of the in-flight file name, which makes the claim
//! and the lease one atomic step.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::models::{QueueConfig, QueueItem};
use crate::queue::{Delivery, WorkQueue};

const PENDING: &str = "pending";
const INFLIGHT: &str = "inflight";
const DEAD: &str = "dead";
const TMP: &str = "tmp";
const LEASE_SEPARATOR: char = '~';

/// Stored message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    id: String,
    item: QueueItem,
    deliveries: u32,
}

/// Queue persisted in a directory tree.
#[derive(Debug)]
pub struct LocalQueue {
    root: PathBuf,
    visibility_timeout: Duration,
    max_deliveries: u32,
    sequence: AtomicU64,
}

impl LocalQueue {
    /// Open (creating if needed) the queue at `config.path`.
    pub fn open(config: &QueueConfig) -> Result<Self> {
        Self::with_settings(&config.path, config.visibility_timeout(), config.max_deliveries)
    }

    pub fn with_settings(
        root: impl Into<PathBuf>,
        visibility_timeout: Duration,
        max_deliveries: u32,
    ) -> Result<Self> {
        let root = root.into();
        for dir in [PENDING, INFLIGHT, DEAD, TMP] {
            std::fs::create_dir_all(root.join(dir))
                .map_err(|e| AppError::queue(format!("{:?}: {}", root.join(dir), e)))?;
        }
        Ok(Self {
            root,
            visibility_timeout,
            max_deliveries: max_deliveries.max(1),
            sequence: AtomicU64::new(0),
        })
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn new_id(&self) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{:020}-{}-{:06}", nanos, std::process::id(), seq)
    }

    /// Write a message atomically (write to tmp/, then rename into place).
    async fn write_message(&self, dest: &Path, message: &StoredMessage) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(message)?;
        let tmp = self.dir(TMP).join(format!("{}.{}", message.id, self.new_id()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, dest).await?;
        Ok(())
    }

    async fn read_message(path: &Path) -> Result<Option<StoredMessage>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Sorted `*.json` file names of a queue directory.
    async fn list(&self, name: &str) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(self.dir(name)).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file = entry.file_name().to_string_lossy().into_owned();
            if file.ends_with(".json") {
                names.push(file);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Move an in-flight file back to pending, or to dead/ once exhausted.
    /// Returns `false` when another consumer moved it first.
    async fn release(&self, inflight_name: &str) -> Result<bool> {
        let path = self.dir(INFLIGHT).join(inflight_name);
        let Some(message) = Self::read_message(&path).await? else {
            return Ok(false);
        };
        let file = format!("{}.json", message.id);
        let target = if message.deliveries >= self.max_deliveries {
            log::error!(
                "Dead-lettering {} after {} deliveries",
                message.item.bucket.id,
                message.deliveries
            );
            self.dir(DEAD).join(file)
        } else {
            self.dir(PENDING).join(file)
        };
        rename_if_present(&path, &target).await
    }

    async fn reclaim_expired(&self) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        for name in self.list(INFLIGHT).await? {
            let expired = lease_deadline(&name).is_none_or(|deadline| deadline <= now);
            if expired && self.release(&name).await? {
                log::warn!("Lease {} expired, redelivering", name);
            }
        }
        Ok(())
    }
}

/// Deadline (unix millis) encoded in an in-flight file name.
fn lease_deadline(name: &str) -> Option<i64> {
    name.split_once(LEASE_SEPARATOR)?.0.parse().ok()
}

/// Rename, treating a vanished source as lost race rather than error.
async fn rename_if_present(from: &Path, to: &Path) -> Result<bool> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(AppError::queue(format!("{:?} -> {:?}: {}", from, to, e))),
    }
}

#[async_trait]
impl WorkQueue for LocalQueue {
    async fn enqueue(&self, item: QueueItem) -> Result<()> {
        let message = StoredMessage {
            id: self.new_id(),
            item,
            deliveries: 0,
        };
        let dest = self.dir(PENDING).join(format!("{}.json", message.id));
        self.write_message(&dest, &message)
            .await
            .map_err(|e| AppError::queue(format!("enqueue failed: {e}")))
    }

    async fn dequeue(&self) -> Result<Option<Delivery>> {
        self.reclaim_expired().await?;

        for name in self.list(PENDING).await? {
            let deadline = Utc::now().timestamp_millis() + self.visibility_timeout.as_millis() as i64;
            let leased = format!("{deadline:016}{LEASE_SEPARATOR}{name}");
            let inflight = self.dir(INFLIGHT).join(&leased);

            if !rename_if_present(&self.dir(PENDING).join(&name), &inflight).await? {
                continue;
            }
            let Some(mut message) = Self::read_message(&inflight).await? else {
                continue;
            };
            message.deliveries += 1;
            self.write_message(&inflight, &message).await?;

            return Ok(Some(Delivery {
                item: message.item,
                receipt: leased,
                deliveries: message.deliveries,
            }));
        }
        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let path = self.dir(INFLIGHT).join(&delivery.receipt);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!(
                    "Ack for expired lease on {}; item was redelivered",
                    delivery.item.bucket.id
                );
                Ok(())
            }
            Err(e) => Err(AppError::queue(format!("ack failed: {e}"))),
        }
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        self.release(&delivery.receipt).await?;
        Ok(())
    }

    async fn outstanding(&self) -> Result<usize> {
        Ok(self.list(PENDING).await?.len() + self.list(INFLIGHT).await?.len())
    }
}
