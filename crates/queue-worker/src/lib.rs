//! # queue-worker
//!
//! The batch loop that drives a [`QueueDriver`] to completion over a bounded
//! window, plus a long-running convenience loop for a standalone worker
//! process.

use queue_core::{Clock, ProcessOutcome, QueueDriver, QueueError, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Aggregate outcome of one [`BatchWorker::run_batch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub processed: u32,
    pub successful: u32,
    pub failed: u32,
    pub execution_time: Duration,
}

/// Drives a [`QueueDriver`] through bounded or unbounded batches of work.
pub struct BatchWorker {
    clock: Arc<dyn Clock>,
}

impl Default for BatchWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchWorker {
    pub fn new() -> Self {
        Self { clock: Arc::new(SystemClock) }
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Run up to `n` jobs, or until `budget` elapses, or until the driver
    /// reports no eligible work, whichever comes first. Never exceeds the
    /// budget by more than the runtime of the one job already in flight when
    /// the budget check fires — jobs are not preemptible.
    pub async fn run_batch(
        &self,
        driver: &dyn QueueDriver,
        n: usize,
        queue: Option<&str>,
        budget: Duration,
    ) -> Result<BatchResult, QueueError> {
        let start = self.clock.monotonic();
        driver.release_delayed().await?;

        let mut result = BatchResult::default();
        loop {
            if result.processed as usize >= n || start.elapsed() >= budget {
                break;
            }

            match driver.process_one(queue).await? {
                Some(ProcessOutcome::Completed) => {
                    result.processed += 1;
                    result.successful += 1;
                }
                Some(ProcessOutcome::Retried) | Some(ProcessOutcome::DeadLettered) => {
                    result.processed += 1;
                    result.failed += 1;
                }
                None => break,
            }
        }

        result.execution_time = start.elapsed();
        tracing::info!(
            processed = result.processed,
            successful = result.successful,
            failed = result.failed,
            elapsed_ms = result.execution_time.as_millis() as u64,
            "batch complete"
        );
        Ok(result)
    }

    /// Run `run_batch` repeatedly until `stop` is notified, sleeping
    /// `idle_delay` between empty batches so an idle worker doesn't
    /// busy-loop against the store. Additive over `run_batch`: it does not
    /// change that method's per-call contract.
    pub async fn run_forever(
        &self,
        driver: &dyn QueueDriver,
        batch_size: usize,
        queue: Option<&str>,
        budget: Duration,
        idle_delay: Duration,
        stop: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                _ = stop.notified() => {
                    tracing::info!("worker stopping");
                    break;
                }
                result = self.run_batch(driver, batch_size, queue, budget) => {
                    match result {
                        Ok(result) if result.processed == 0 => {
                            tokio::select! {
                                _ = stop.notified() => break,
                                _ = tokio::time::sleep(idle_delay) => {}
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::error!(error = %err, "batch failed, backing off");
                            tokio::select! {
                                _ = stop.notified() => break,
                                _ = tokio::time::sleep(idle_delay) => {}
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_core::{BackoffStrategy, EnqueueOptions, NullLogger, QueueConfig, StaticResolver, ThreadRand};
    use queue_memory::InMemoryDriver;
    use queue_testing::FakeClock;

    fn driver_with(resolver: StaticResolver, clock: Arc<FakeClock>) -> InMemoryDriver {
        InMemoryDriver::with_collaborators(
            QueueConfig::default(),
            Arc::new(resolver),
            clock,
            Arc::new(ThreadRand),
            Arc::new(NullLogger),
        )
    }

    #[tokio::test]
    async fn run_batch_stops_at_n_when_more_work_remains() {
        let clock = Arc::new(FakeClock::starting_now());
        let resolver = StaticResolver::new().with("Work", |_payload: serde_json::Value| async { Ok(()) });
        let driver = driver_with(resolver, clock.clone());

        for _ in 0..5 {
            driver.enqueue("Work", &serde_json::json!({}), "default", EnqueueOptions::default()).await.unwrap();
        }

        let worker = BatchWorker::with_clock(clock);
        let result = worker.run_batch(&driver, 3, None, Duration::from_secs(60)).await.unwrap();
        assert_eq!(result.processed, 3);
        assert_eq!(result.successful, 3);

        let stats = driver.stats(None).await.unwrap();
        assert_eq!(stats.pending, 2);
    }

    #[tokio::test]
    async fn run_batch_stops_early_when_no_work_is_eligible() {
        let clock = Arc::new(FakeClock::starting_now());
        let resolver = StaticResolver::new();
        let driver = driver_with(resolver, clock.clone());

        let worker = BatchWorker::with_clock(clock);
        let result = worker.run_batch(&driver, 10, None, Duration::from_secs(60)).await.unwrap();
        assert_eq!(result.processed, 0);
    }

    #[tokio::test]
    async fn run_batch_tallies_retries_and_dead_letters_as_failed() {
        let clock = Arc::new(FakeClock::starting_now());
        let resolver = StaticResolver::new().with("AlwaysFails", |_payload: serde_json::Value| async {
            anyhow::bail!("boom")
        });
        let driver = driver_with(resolver, clock.clone());

        driver
            .enqueue(
                "AlwaysFails",
                &serde_json::json!({}),
                "default",
                EnqueueOptions { max_attempts: 1, backoff_strategy: BackoffStrategy::Fixed, ..Default::default() },
            )
            .await
            .unwrap();

        let worker = BatchWorker::with_clock(clock);
        let result = worker.run_batch(&driver, 10, None, Duration::from_secs(60)).await.unwrap();
        assert_eq!(result.processed, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.successful, 0);
    }
}
