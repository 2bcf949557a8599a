//! The uniform driver contract implemented by every backend.

use crate::error::QueueError;
use crate::record::{FailedJobRecord, JobStatus};
use crate::retry::BackoffStrategy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Options accepted by [`QueueDriver::enqueue`], beyond the required
/// `task`/`payload`/`queue`.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub priority: i16,
    pub delay_seconds: u32,
    pub max_attempts: u32,
    pub timeout_seconds: u32,
    pub backoff_strategy: BackoffStrategy,
    pub retry_delay: u32,
    pub tags: Vec<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 5,
            delay_seconds: 0,
            max_attempts: 3,
            timeout_seconds: 300,
            backoff_strategy: BackoffStrategy::Exponential,
            retry_delay: 60,
            tags: Vec::new(),
        }
    }
}

/// Aggregate counts returned by [`QueueDriver::stats`].
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub delayed: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub high_priority: u64,
    pub average_attempts: f64,
    pub dead_letter: u64,
}

/// Result of a single [`QueueDriver::process_one`] call, used by the batch
/// worker to tally outcomes. `None` means no eligible job was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Retried,
    DeadLettered,
}

/// The uniform API every backend (in-memory, skip-lock relational,
/// transactional relational) exposes. Handler errors and storage errors
/// during housekeeping never propagate out of `process_one`/`process_batch`
/// — they are logged and translated into record state instead.
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Persist a new job. Returns `true` on success; storage failures are
    /// logged at `error` and returned as `false` rather than panicking, so
    /// callers can decide whether to retry the enqueue.
    async fn enqueue(
        &self,
        task: &str,
        payload: &serde_json::Value,
        queue: &str,
        options: EnqueueOptions,
    ) -> Result<bool, QueueError>;

    /// Promote delayed jobs, release stuck jobs, atomically claim at most
    /// one pending job, and run it to completion/retry/DLQ. Returns the
    /// outcome, or `None` if no job was eligible.
    async fn process_one(&self, queue: Option<&str>) -> Result<Option<ProcessOutcome>, QueueError>;

    async fn stats(&self, queue: Option<&str>) -> Result<QueueStats, QueueError>;

    async fn get_failed_jobs(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<FailedJobRecord>, QueueError>;

    async fn get_failed_job(&self, id: i64) -> Result<Option<FailedJobRecord>, QueueError>;

    /// Move a DLQ row back into the active store as `pending`. The DLQ row
    /// is removed in the same atomic action that inserts the active row.
    async fn retry_failed_job(&self, id: i64) -> Result<bool, QueueError>;

    async fn retry_all_failed_jobs(&self, queue: Option<&str>) -> Result<u64, QueueError>;

    async fn purge_old_jobs(&self, older_than_days: u32) -> Result<u64, QueueError>;

    async fn purge_failed_jobs(&self, queue: Option<&str>) -> Result<u64, QueueError>;

    /// Promote `delayed` rows whose `available_at <= now` to `pending`.
    async fn release_delayed(&self) -> Result<u64, QueueError>;

    /// Revert `processing` rows whose `updated_at` is older than the
    /// configured timeout, and whose `attempts < max_attempts`, back to
    /// `pending`.
    async fn release_stuck(&self) -> Result<u64, QueueError>;

    /// Move `processing` rows whose `updated_at` is older than the
    /// configured timeout, and whose `attempts >= max_attempts`, to
    /// `failed`.
    async fn fail_exceeded(&self) -> Result<u64, QueueError>;
}

/// A single job's current status and timestamps, as surfaced for
/// introspection and the claim ordering (`priority DESC, created_at ASC`).
/// Not part of the public driver contract; drivers use this internally to
/// keep claim SQL and in-memory scans aligned on the same ordering.
pub fn claim_order_key(priority: i16, created_at: DateTime<Utc>) -> (i16, std::cmp::Reverse<DateTime<Utc>>) {
    (priority, std::cmp::Reverse(created_at))
}

/// True when `status` is a terminal status eligible for cleanup.
pub fn is_terminal(status: JobStatus) -> bool {
    matches!(status, JobStatus::Completed | JobStatus::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_order_prefers_higher_priority_then_older_created_at() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(10);
        let mut keys = vec![
            ("A", claim_order_key(5, now)),
            ("B", claim_order_key(9, now)),
            ("C", claim_order_key(9, earlier)),
        ];
        keys.sort_by(|a, b| b.1.cmp(&a.1));
        let order: Vec<&str> = keys.iter().map(|(name, _)| *name).collect();
        assert_eq!(order, vec!["C", "B", "A"]);
    }
}
