//! The durable job record and its state machine.

use crate::error::QueueError;
use crate::retry::BackoffStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Clamp range for `priority`. Higher is preferred; ties break on the
/// oldest `created_at`.
pub const PRIORITY_MIN: i16 = 0;
pub const PRIORITY_MAX: i16 = 10;

/// Length to which `last_error` is truncated before being persisted.
pub const LAST_ERROR_MAX_CHARS: usize = 1000;

/// Lifecycle status of a [`JobRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Delayed,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Delayed => "delayed",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "delayed" => Ok(JobStatus::Delayed),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(QueueError::InvariantViolation(format!(
                "unknown job status `{other}`"
            ))),
        }
    }
}

/// The unit of work tracked by the engine. See §3 of the design document for
/// field semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub queue: String,
    pub task: String,
    pub payload: Vec<u8>,
    pub status: JobStatus,
    pub priority: i16,
    pub attempts: u32,
    pub max_attempts: u32,
    pub timeout_seconds: u32,
    pub backoff_strategy: BackoffStrategy,
    pub retry_delay: u32,
    pub last_error: Option<String>,
    pub tags: Vec<String>,
    pub available_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Decode `payload` as a JSON mapping. A decode error is itself a job
    /// failure per the executor contract, not a panic.
    pub fn payload_json(&self) -> Result<serde_json::Value, QueueError> {
        serde_json::from_slice(&self.payload).map_err(QueueError::Serialization)
    }

    /// Truncate an error message to the persisted `last_error` limit.
    pub fn truncate_error(message: &str) -> String {
        if message.chars().count() <= LAST_ERROR_MAX_CHARS {
            message.to_string()
        } else {
            message.chars().take(LAST_ERROR_MAX_CHARS).collect()
        }
    }

    /// Clamp a requested priority into the legal `[0, 10]` range.
    pub fn clamp_priority(priority: i16) -> i16 {
        priority.clamp(PRIORITY_MIN, PRIORITY_MAX)
    }
}

/// A single entry in a [`FailedJobRecord`]'s retry history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEvent {
    pub attempt: u32,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

/// A dead-lettered job: a copy of the originating [`JobRecord`] plus failure
/// detail accumulated over its lifetime. Carries every enqueue-time field of
/// the original record (priority, attempt budget, timeout, backoff, tags) so
/// that `retryFailedJob` can restore the job exactly as it was configured,
/// rather than falling back to engine defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJobRecord {
    pub id: i64,
    pub original_job_id: i64,
    pub queue: String,
    pub task: String,
    pub payload: Vec<u8>,
    pub priority: i16,
    pub max_attempts: u32,
    pub timeout_seconds: u32,
    pub backoff_strategy: BackoffStrategy,
    pub retry_delay: u32,
    pub tags: Vec<String>,
    pub exception: String,
    pub stack_trace: String,
    pub total_attempts: u32,
    pub retry_history: Vec<RetryEvent>,
    pub failed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// An append-only structured log line scoped to one job, optionally
/// persisted by a `QueueLogger` sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLog {
    pub job_id: i64,
    pub level: String,
    pub message: String,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Validate a transition against the state machine in the design document.
/// Any combination not listed here is an invariant violation: the caller
/// must refuse to operate on the record and log at `error`, never silently
/// coerce it.
pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), QueueError> {
    use JobStatus::*;
    let legal = matches!(
        (from, to),
        (Pending, Processing)
            | (Delayed, Pending)
            | (Processing, Completed)
            | (Processing, Delayed)
            | (Processing, Failed)
            | (Processing, Pending)
    );
    if legal {
        Ok(())
    } else {
        Err(QueueError::InvariantViolation(format!(
            "illegal transition {from} -> {to}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_are_accepted() {
        assert!(validate_transition(JobStatus::Pending, JobStatus::Processing).is_ok());
        assert!(validate_transition(JobStatus::Delayed, JobStatus::Pending).is_ok());
        assert!(validate_transition(JobStatus::Processing, JobStatus::Completed).is_ok());
        assert!(validate_transition(JobStatus::Processing, JobStatus::Delayed).is_ok());
        assert!(validate_transition(JobStatus::Processing, JobStatus::Failed).is_ok());
        assert!(validate_transition(JobStatus::Processing, JobStatus::Pending).is_ok());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        assert!(validate_transition(JobStatus::Completed, JobStatus::Pending).is_err());
        assert!(validate_transition(JobStatus::Pending, JobStatus::Delayed).is_err());
        assert!(validate_transition(JobStatus::Failed, JobStatus::Processing).is_err());
    }

    #[test]
    fn priority_is_clamped() {
        assert_eq!(JobRecord::clamp_priority(-5), PRIORITY_MIN);
        assert_eq!(JobRecord::clamp_priority(99), PRIORITY_MAX);
        assert_eq!(JobRecord::clamp_priority(7), 7);
    }

    #[test]
    fn last_error_is_truncated() {
        let long = "x".repeat(1500);
        let truncated = JobRecord::truncate_error(&long);
        assert_eq!(truncated.chars().count(), LAST_ERROR_MAX_CHARS);
    }
}
