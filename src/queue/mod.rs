//! At-least-once work queue.
//!
//! A dequeued item is leased to one consumer. It is removed by [`WorkQueue::ack`],
//! handed back by [`WorkQueue::nack`], and handed back automatically when the
//! lease expires without either. Items delivered `max_deliveries` times that
//! fail again are dead-lettered. Delivery order is unspecified.

pub mod local;
pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{QueueConfig, QueueBackend, QueueItem};

pub use local::LocalQueue;
pub use memory::MemoryQueue;

/// An item leased to one consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub item: QueueItem,
    /// Identifies this lease; stale after the lease expires
    pub receipt: String,
    /// How many times the item has been delivered, this one included
    pub deliveries: u32,
}

/// Message queue carrying bucket work.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Add an item. Transport errors propagate; nothing is dropped silently.
    async fn enqueue(&self, item: QueueItem) -> Result<()>;

    /// Lease the next visible item, if any.
    async fn dequeue(&self) -> Result<Option<Delivery>>;

    /// Processing succeeded; remove the item for good.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Processing failed; make the item visible again or dead-letter it.
    async fn nack(&self, delivery: &Delivery) -> Result<()>;

    /// Visible plus leased items.
    async fn outstanding(&self) -> Result<usize>;
}

/// Build the queue selected in configuration.
pub fn from_config(config: &QueueConfig) -> Result<Box<dyn WorkQueue>> {
    Ok(match config.backend {
        QueueBackend::Memory => Box::new(MemoryQueue::from_config(config)),
        QueueBackend::Local => Box::new(LocalQueue::open(config)?),
    })
}
