//! In-process queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::Result;
use crate::models::{QueueConfig, QueueItem};
use crate::queue::{Delivery, WorkQueue};

/// Dead letters kept per queue; the oldest are dropped beyond this.
const DEAD_LETTER_CAP: usize = 1000;

#[derive(Debug, Clone)]
struct Message {
    item: QueueItem,
    deliveries: u32,
}

#[derive(Debug)]
struct Lease {
    message: Message,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    visible: VecDeque<Message>,
    inflight: HashMap<String, Lease>,
    dead: VecDeque<QueueItem>,
    next_receipt: u64,
}

/// Queue held in memory, with lease expiry and dead-lettering.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<State>,
    visibility_timeout: Duration,
    max_deliveries: u32,
    dead_letter_cap: usize,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration, max_deliveries: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            visibility_timeout,
            max_deliveries: max_deliveries.max(1),
            dead_letter_cap: DEAD_LETTER_CAP,
        }
    }

    /// Keep at most `cap` dead letters.
    pub fn with_dead_letter_cap(mut self, cap: usize) -> Self {
        self.dead_letter_cap = cap;
        self
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.visibility_timeout(), config.max_deliveries)
    }

    /// Items that exhausted their deliveries.
    pub fn dead_letters(&self) -> Vec<QueueItem> {
        self.lock().dead.iter().cloned().collect()
    }

    /// Remove and return the dead letters.
    pub fn take_dead_letters(&self) -> Vec<QueueItem> {
        self.lock().dead.drain(..).collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requeue or dead-letter a message whose delivery failed.
    fn release(&self, state: &mut State, message: Message) {
        if message.deliveries >= self.max_deliveries {
            log::error!(
                "Dead-lettering {} after {} deliveries",
                message.item.bucket.id,
                message.deliveries
            );
            if self.dead_letter_cap == 0 {
                return;
            }
            if state.dead.len() >= self.dead_letter_cap {
                if let Some(dropped) = state.dead.pop_front() {
                    log::warn!("Dead-letter list full, dropping {}", dropped.bucket.id);
                }
            }
            state.dead.push_back(message.item);
        } else {
            state.visible.push_back(message);
        }
    }

    fn reclaim_expired(&self, state: &mut State) {
        let now = Instant::now();
        let expired: Vec<String> = state
            .inflight
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(lease) = state.inflight.remove(&receipt) {
                log::warn!(
                    "Lease on {} expired, redelivering",
                    lease.message.item.bucket.id
                );
                self.release(state, lease.message);
            }
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, item: QueueItem) -> Result<()> {
        self.lock().visible.push_back(Message {
            item,
            deliveries: 0,
        });
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>> {
        let mut state = self.lock();
        self.reclaim_expired(&mut state);

        let Some(mut message) = state.visible.pop_front() else {
            return Ok(None);
        };
        message.deliveries += 1;
        state.next_receipt += 1;
        let receipt = format!("m{}", state.next_receipt);

        let delivery = Delivery {
            item: message.item.clone(),
            receipt: receipt.clone(),
            deliveries: message.deliveries,
        };
        state.inflight.insert(
            receipt,
            Lease {
                message,
                deadline: Instant::now() + self.visibility_timeout,
            },
        );
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        if self.lock().inflight.remove(&delivery.receipt).is_none() {
            log::warn!(
                "Ack for expired lease on {}; item was redelivered",
                delivery.item.bucket.id
            );
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.lock();
        if let Some(lease) = state.inflight.remove(&delivery.receipt) {
            self.release(&mut state, lease.message);
        }
        Ok(())
    }

    async fn outstanding(&self) -> Result<usize> {
        let state = self.lock();
        Ok(state.visible.len() + state.inflight.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BucketReference;

    fn item(id: &str) -> QueueItem {
        QueueItem::new(BucketReference::new(id, format!("https://github.com/{id}"), None))
    }

    #[tokio::test]
    async fn test_one_consumer_per_item() {
        let queue = MemoryQueue::new(Duration::from_secs(60), 3);
        queue.enqueue(item("a/one")).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.outstanding().await.unwrap(), 1);

        queue.ack(&first).await.unwrap();
        assert_eq!(queue.outstanding().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let queue = MemoryQueue::new(Duration::from_secs(60), 2);
        queue.enqueue(item("a/poison")).await.unwrap();

        let d1 = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(d1.deliveries, 1);
        queue.nack(&d1).await.unwrap();

        let d2 = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(d2.deliveries, 2);
        assert_eq!(d2.item, d1.item);
        queue.nack(&d2).await.unwrap();

        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.outstanding().await.unwrap(), 0);
        assert_eq!(queue.dead_letters(), vec![item("a/poison")]);
    }

    #[tokio::test]
    async fn test_dead_letters_are_capped() {
        let queue = MemoryQueue::new(Duration::from_secs(60), 1).with_dead_letter_cap(2);
        for id in ["a/one", "a/two", "a/three"] {
            queue.enqueue(item(id)).await.unwrap();
            let d = queue.dequeue().await.unwrap().unwrap();
            queue.nack(&d).await.unwrap();
        }

        assert_eq!(queue.dead_letters(), vec![item("a/two"), item("a/three")]);
        assert_eq!(queue.take_dead_letters().len(), 2);
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_redelivered() {
        let queue = MemoryQueue::new(Duration::from_secs(600), 5);
        queue.enqueue(item("a/slow")).await.unwrap();

        let stale = queue.dequeue().await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(601)).await;

        let fresh = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(fresh.item, stale.item);
        assert_ne!(fresh.receipt, stale.receipt);

        // The late ack of the first consumer must not remove the new lease.
        queue.ack(&stale).await.unwrap();
        assert_eq!(queue.outstanding().await.unwrap(), 1);
        queue.ack(&fresh).await.unwrap();
        assert_eq!(queue.outstanding().await.unwrap(), 0);
    }
}
