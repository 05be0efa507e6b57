use crate::error::BrokerError;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Consumes a batch of expired work items.
pub trait WorkProcessor<T>: Send + Sync {
    fn process<'a>(
        &'a self,
        items: Vec<T>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>>;
}

#[derive(Debug)]
struct DelayedItem<T> {
    item: T,
    expires_at: Instant,
}

#[derive(Debug)]
struct Pending<T> {
    // Fixed delay, so insertion order is expiry order.
    order: VecDeque<DelayedItem<T>>,
    members: HashSet<T>,
}

/// Buffers work for a grace period and collapses duplicates that arrive
/// within it. Expired items are drained in batches.
#[derive(Debug)]
pub struct DedupedDelayQueue<T> {
    name: String,
    delay: Duration,
    pending: Mutex<Pending<T>>,
}

impl<T> DedupedDelayQueue<T>
where
    T: Eq + Hash + Clone + Send,
{
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            pending: Mutex::new(Pending {
                order: VecDeque::new(),
                members: HashSet::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Queues `item` unless an equal item is already waiting.
    ///
    /// Returns whether the item was inserted.
    pub fn add_work_item(&self, item: T) -> bool {
        let mut pending = self.lock();
        if pending.members.contains(&item) {
            return false;
        }
        pending.members.insert(item.clone());
        pending.order.push_back(DelayedItem {
            item,
            expires_at: Instant::now() + self.delay,
        });
        true
    }

    pub fn queue_size(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue_size() == 0
    }

    pub fn contains(&self, item: &T) -> bool {
        self.lock().members.contains(item)
    }

    /// Removes up to `max_batch` expired items, oldest first.
    pub fn drain_expired(&self, max_batch: usize) -> Vec<T> {
        let now = Instant::now();
        let mut pending = self.lock();
        let mut batch = Vec::new();
        while batch.len() < max_batch {
            match pending.order.front() {
                Some(front) if front.expires_at <= now => {}
                _ => break,
            }
            let Some(expired) = pending.order.pop_front() else {
                break;
            };
            pending.members.remove(&expired.item);
            batch.push(expired.item);
        }
        batch
    }

    /// Drains up to `max_batch` expired items and hands them to `processor`.
    ///
    /// A failing processor loses the batch; items are not re-queued.
    /// Returns the number of items drained.
    pub async fn process<P>(&self, max_batch: usize, processor: &P) -> usize
    where
        P: WorkProcessor<T> + ?Sized,
    {
        let batch = self.drain_expired(max_batch);
        if batch.is_empty() {
            return 0;
        }

        let count = batch.len();
        tracing::debug!(queue = self.name.as_str(), count, "Processing expired work items");
        if let Err(e) = processor.process(batch).await {
            tracing::error!(
                queue = self.name.as_str(),
                count,
                "Batch processing failed, dropping items: {e}"
            );
        }
        count
    }

    fn lock(&self) -> MutexGuard<'_, Pending<T>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
