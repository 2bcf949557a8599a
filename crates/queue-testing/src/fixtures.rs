use chrono::Utc;
use queue_core::{BackoffStrategy, EnqueueOptions, JobRecord, JobStatus};

/// A `JobRecord` with sane defaults, for tests that only care about a few
/// fields. Mirrors the shape `enqueue` would have produced.
pub fn job_record(id: i64, task: &str, payload: serde_json::Value) -> JobRecord {
    let now = Utc::now();
    JobRecord {
        id,
        queue: "default".to_string(),
        task: task.to_string(),
        payload: serde_json::to_vec(&payload).expect("fixture payload must serialize"),
        status: JobStatus::Pending,
        priority: 5,
        attempts: 0,
        max_attempts: 3,
        timeout_seconds: 300,
        backoff_strategy: BackoffStrategy::Exponential,
        retry_delay: 60,
        last_error: None,
        tags: Vec::new(),
        available_at: now,
        reserved_at: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn enqueue_options() -> EnqueueOptions {
    EnqueueOptions::default()
}
