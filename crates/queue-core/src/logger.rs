//! Optional per-job log persistence.
//!
//! `tracing` carries the engine's operational logs regardless of whether a
//! [`QueueLogger`] sink is configured; the sink exists for deployments that
//! also want per-job log rows queryable alongside the job itself (the
//! `job_logs` table in the design document).

use crate::record::JobLog;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

#[async_trait]
pub trait QueueLogger: Send + Sync {
    async fn log(&self, job_id: i64, level: &str, message: &str, context: serde_json::Value);

    async fn logs_for(&self, job_id: i64) -> Vec<JobLog>;
}

/// A `QueueLogger` that discards everything. The default when no
/// persistence sink is configured; `tracing` output is unaffected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogger;

#[async_trait]
impl QueueLogger for NullLogger {
    async fn log(&self, _job_id: i64, _level: &str, _message: &str, _context: serde_json::Value) {}

    async fn logs_for(&self, _job_id: i64) -> Vec<JobLog> {
        Vec::new()
    }
}

/// An in-process `QueueLogger` backed by a concurrent map, one log vector
/// per job id. Useful for tests and the in-memory driver; not durable
/// across restarts.
#[derive(Clone, Default)]
pub struct InMemoryLogger {
    logs: Arc<dashmap::DashMap<i64, Vec<JobLog>>>,
}

impl InMemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueLogger for InMemoryLogger {
    async fn log(&self, job_id: i64, level: &str, message: &str, context: serde_json::Value) {
        let entry = JobLog {
            job_id,
            level: level.to_string(),
            message: message.to_string(),
            context,
            created_at: Utc::now(),
        };
        self.logs.entry(job_id).or_default().push(entry);
    }

    async fn logs_for(&self, job_id: i64) -> Vec<JobLog> {
        self.logs.get(&job_id).map(|v| v.clone()).unwrap_or_default()
    }
}
