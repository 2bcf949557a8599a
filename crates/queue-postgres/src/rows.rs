//! Raw row shapes returned by sqlx, and their conversion into the engine's
//! public record types. Kept separate from `lib.rs` so the SQL-facing
//! shapes (string statuses, JSON columns) don't leak into the driver logic.

use chrono::{DateTime, Utc};
use queue_core::{BackoffStrategy, FailedJobRecord, JobRecord, JobStatus, RetryEvent};
use sqlx::FromRow;
use std::str::FromStr;

#[derive(FromRow)]
pub struct JobRow {
    pub id: i64,
    pub queue: String,
    pub task: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub priority: i16,
    pub attempts: i32,
    pub max_attempts: i32,
    pub timeout_seconds: i32,
    pub backoff_strategy: String,
    pub retry_delay: i32,
    pub last_error: Option<String>,
    pub tags: serde_json::Value,
    pub available_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<JobRow> for JobRecord {
    fn from(row: JobRow) -> Self {
        JobRecord {
            id: row.id,
            queue: row.queue,
            task: row.task,
            payload: serde_json::to_vec(&row.payload).unwrap_or_default(),
            status: JobStatus::from_str(&row.status).unwrap_or(JobStatus::Pending),
            priority: row.priority,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            timeout_seconds: row.timeout_seconds.max(0) as u32,
            backoff_strategy: parse_backoff(&row.backoff_strategy),
            retry_delay: row.retry_delay.max(0) as u32,
            last_error: row.last_error,
            tags: serde_json::from_value(row.tags).unwrap_or_default(),
            available_at: row.available_at,
            reserved_at: row.reserved_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
pub struct FailedJobRow {
    pub id: i64,
    pub original_job_id: i64,
    pub queue: String,
    pub task: String,
    pub payload: serde_json::Value,
    pub priority: i16,
    pub max_attempts: i32,
    pub timeout_seconds: i32,
    pub backoff_strategy: String,
    pub retry_delay: i32,
    pub tags: serde_json::Value,
    pub exception: String,
    pub stack_trace: String,
    pub total_attempts: i32,
    pub retry_history: serde_json::Value,
    pub failed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<FailedJobRow> for FailedJobRecord {
    fn from(row: FailedJobRow) -> Self {
        let retry_history: Vec<RetryEvent> = serde_json::from_value(row.retry_history).unwrap_or_default();
        FailedJobRecord {
            id: row.id,
            original_job_id: row.original_job_id,
            queue: row.queue,
            task: row.task,
            payload: serde_json::to_vec(&row.payload).unwrap_or_default(),
            priority: row.priority,
            max_attempts: row.max_attempts.max(0) as u32,
            timeout_seconds: row.timeout_seconds.max(0) as u32,
            backoff_strategy: parse_backoff(&row.backoff_strategy),
            retry_delay: row.retry_delay.max(0) as u32,
            tags: serde_json::from_value(row.tags).unwrap_or_default(),
            exception: row.exception,
            stack_trace: row.stack_trace,
            total_attempts: row.total_attempts.max(0) as u32,
            retry_history,
            failed_at: row.failed_at,
            created_at: row.created_at,
        }
    }
}

fn parse_backoff(s: &str) -> BackoffStrategy {
    match s {
        "fixed" => BackoffStrategy::Fixed,
        "linear" => BackoffStrategy::Linear,
        "exponential_jitter" => BackoffStrategy::ExponentialJitter,
        _ => BackoffStrategy::Exponential,
    }
}
