//! Delayed, de-duplicated work and the timer that drains it.

pub mod ancestor;
pub mod delay_queue;
pub mod scheduler;

pub use ancestor::{AncestorQueue, AncestorQueues, AncestorTick};
pub use delay_queue::{DedupedDelayQueue, WorkProcessor};
pub use scheduler::{DEFAULT_SCHEDULER_THREADS, PeriodicScheduler};
