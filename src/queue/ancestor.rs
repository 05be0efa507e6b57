use super::delay_queue::{DedupedDelayQueue, WorkProcessor};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Descendant-id queue for one ancestor.
pub type AncestorQueue = DedupedDelayQueue<i64>;

/// Outcome of one [`AncestorQueues::process_next`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AncestorTick {
    pub ancestor_id: i64,
    pub processed: usize,
    pub removed: bool,
}

/// Per-ancestor delay queues, created on first use and dropped once they
/// drain. Insertion and removal share one lock so an add can never land in
/// a queue that is being discarded.
#[derive(Debug)]
pub struct AncestorQueues {
    delay: Duration,
    queues: Mutex<BTreeMap<i64, Arc<AncestorQueue>>>,
}

impl AncestorQueues {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            queues: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get_or_create(&self, ancestor_id: i64) -> Arc<AncestorQueue> {
        Arc::clone(Self::entry(&mut self.lock(), ancestor_id, self.delay))
    }

    /// Queues `descendant_id` under `ancestor_id`.
    pub fn add(&self, ancestor_id: i64, descendant_id: i64) -> bool {
        let mut queues = self.lock();
        Self::entry(&mut queues, ancestor_id, self.delay).add_work_item(descendant_id)
    }

    /// Drops the queue for `ancestor_id` if it is still `queue` and empty.
    pub fn remove_if_empty(&self, ancestor_id: i64, queue: &Arc<AncestorQueue>) -> bool {
        let mut queues = self.lock();
        let current_is_drained = queues
            .get(&ancestor_id)
            .is_some_and(|current| Arc::ptr_eq(current, queue) && current.is_empty());
        if current_is_drained {
            queues.remove(&ancestor_id);
        }
        current_is_drained
    }

    /// Lowest ancestor id with a live queue.
    pub fn first(&self) -> Option<(i64, Arc<AncestorQueue>)> {
        self.lock()
            .iter()
            .next()
            .map(|(id, queue)| (*id, Arc::clone(queue)))
    }

    /// Processes the lowest-id ancestor queue and removes it once empty.
    pub async fn process_next<P, F>(&self, max_batch: usize, make_processor: F) -> Option<AncestorTick>
    where
        P: WorkProcessor<i64>,
        F: FnOnce(i64) -> P,
    {
        let (ancestor_id, queue) = self.first()?;
        let processor = make_processor(ancestor_id);
        let processed = queue.process(max_batch, &processor).await;
        let removed = self.remove_if_empty(ancestor_id, &queue);
        if removed {
            tracing::debug!(ancestor_id, "Ancestor queue drained and removed");
        }
        Some(AncestorTick {
            ancestor_id,
            processed,
            removed,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, ancestor_id: i64) -> bool {
        self.lock().contains_key(&ancestor_id)
    }

    fn entry(
        queues: &mut BTreeMap<i64, Arc<AncestorQueue>>,
        ancestor_id: i64,
        delay: Duration,
    ) -> &Arc<AncestorQueue> {
        queues.entry(ancestor_id).or_insert_with(|| {
            Arc::new(DedupedDelayQueue::new(
                format!("ancestor-{ancestor_id}"),
                delay,
            ))
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i64, Arc<AncestorQueue>>> {
        self.queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
