use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SCHEDULER_THREADS: usize = 5;

/// Runs jobs at a fixed rate on the tokio runtime.
///
/// At most `threads` job bodies execute at once across all schedules. A
/// schedule whose job overruns its period skips the missed ticks instead of
/// bursting to catch up.
pub struct PeriodicScheduler {
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PeriodicScheduler {
    pub fn new(threads: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(threads.max(1))),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn schedule_at_fixed_rate<F, Fut>(
        &self,
        name: &str,
        initial_delay: Duration,
        period: Duration,
        job: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.to_string();
        let permits = Arc::clone(&self.permits);
        let shutdown = self.shutdown.clone();
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + initial_delay, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(
                job = name.as_str(),
                ?initial_delay,
                ?period,
                "Periodic job scheduled"
            );

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let Ok(_permit) = permits.acquire().await else {
                    break;
                };
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    result = job() => {
                        if let Err(e) = result {
                            tracing::warn!(job = name.as_str(), "Periodic job failed: {e:#}");
                        }
                    }
                }
            }
            tracing::debug!(job = name.as_str(), "Periodic job stopped");
        });

        self.handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handle);
    }

    pub fn job_count(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Stops every schedule and waits for running jobs to observe it.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for PeriodicScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEDULER_THREADS)
    }
}

impl Drop for PeriodicScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
