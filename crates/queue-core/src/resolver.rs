//! Job resolution and execution.
//!
//! `JobResolver` maps a task name to a handler; `Executor` decodes a job's
//! payload, resolves its handler, and invokes it. Neither commits any
//! state — the driver is the sole writer, per the design document.

use crate::error::QueueError;
use crate::record::JobRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// A handler invoked with a decoded job payload. Handlers must be
/// idempotent: the engine provides at-least-once delivery, not exactly-once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        (self)(payload).await
    }
}

/// Maps a job's `task` string to an invocable handler.
pub trait JobResolver: Send + Sync {
    fn resolve(&self, task: &str) -> Option<Arc<dyn JobHandler>>;
}

/// A resolver built by explicit registration at startup. No runtime
/// reflection over class/type names is used or required.
#[derive(Clone, Default)]
pub struct StaticResolver {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task: impl Into<String>, handler: impl JobHandler + 'static) -> &mut Self {
        self.handlers.insert(task.into(), Arc::new(handler));
        self
    }

    pub fn with(mut self, task: impl Into<String>, handler: impl JobHandler + 'static) -> Self {
        self.register(task, handler);
        self
    }
}

impl JobResolver for StaticResolver {
    fn resolve(&self, task: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(task).cloned()
    }
}

/// Outcome of executing one job. The driver is responsible for translating
/// this into the corresponding state transition (completed, retry-scheduled,
/// or DLQ-moved); the executor never writes to storage itself.
pub enum ExecutionOutcome {
    Completed,
    Failed {
        message: String,
        stack_trace: String,
    },
}

/// Decodes a payload, resolves a handler, and runs it.
pub struct Executor {
    resolver: Arc<dyn JobResolver>,
}

impl Executor {
    pub fn new(resolver: Arc<dyn JobResolver>) -> Self {
        Self { resolver }
    }

    /// Run `record` to completion or failure. Decode errors, resolution
    /// failures, and handler errors are all folded into
    /// [`ExecutionOutcome::Failed`] — they are job failures, not exceptions
    /// that escape to the caller.
    pub async fn execute(&self, record: &JobRecord) -> ExecutionOutcome {
        let payload = match record.payload_json() {
            Ok(payload) => payload,
            Err(err) => {
                return ExecutionOutcome::Failed {
                    message: format!("payload decode error: {err}"),
                    stack_trace: format!("{err:?}"),
                }
            }
        };

        let handler = match self.resolver.resolve(&record.task) {
            Some(handler) => handler,
            None => {
                let err = QueueError::Resolution(record.task.clone());
                return ExecutionOutcome::Failed {
                    message: err.to_string(),
                    stack_trace: format!("{err:?}"),
                };
            }
        };

        match handler.handle(payload).await {
            Ok(()) => ExecutionOutcome::Completed,
            Err(err) => ExecutionOutcome::Failed {
                message: err.to_string(),
                stack_trace: format!("{err:?}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffStrategy;
    use chrono::Utc;

    fn sample_record(task: &str, payload: serde_json::Value) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: 1,
            queue: "default".into(),
            task: task.into(),
            payload: serde_json::to_vec(&payload).unwrap(),
            status: crate::record::JobStatus::Processing,
            priority: 5,
            attempts: 1,
            max_attempts: 3,
            timeout_seconds: 300,
            backoff_strategy: BackoffStrategy::Exponential,
            retry_delay: 60,
            last_error: None,
            tags: vec![],
            available_at: now,
            reserved_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn resolves_and_runs_a_registered_handler() {
        let resolver = StaticResolver::new().with("SendEmail", |_payload: serde_json::Value| async {
            Ok(())
        });
        let executor = Executor::new(Arc::new(resolver));
        let record = sample_record("SendEmail", serde_json::json!({"to": "a@b"}));
        match executor.execute(&record).await {
            ExecutionOutcome::Completed => {}
            ExecutionOutcome::Failed { message, .. } => panic!("unexpected failure: {message}"),
        }
    }

    #[tokio::test]
    async fn unresolved_task_is_a_failure() {
        let resolver = StaticResolver::new();
        let executor = Executor::new(Arc::new(resolver));
        let record = sample_record("Unknown", serde_json::json!({}));
        match executor.execute(&record).await {
            ExecutionOutcome::Completed => panic!("expected failure"),
            ExecutionOutcome::Failed { message, .. } => {
                assert!(message.contains("Unknown"));
            }
        }
    }

    #[tokio::test]
    async fn handler_error_is_a_failure() {
        let resolver = StaticResolver::new().with("Flaky", |_payload: serde_json::Value| async {
            anyhow::bail!("boom")
        });
        let executor = Executor::new(Arc::new(resolver));
        let record = sample_record("Flaky", serde_json::json!({}));
        match executor.execute(&record).await {
            ExecutionOutcome::Completed => panic!("expected failure"),
            ExecutionOutcome::Failed { message, .. } => assert!(message.contains("boom")),
        }
    }
}
