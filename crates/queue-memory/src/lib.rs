//! # queue-memory
//!
//! The reference `QueueDriver` implementation: an ordered sequence of
//! [`JobRecord`]s held in process memory behind a single mutex. Claim
//! atomicity is trivial — the mutex serializes every operation — which
//! makes this driver useful for tests and for single-process deployments
//! that don't need durability across restarts.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use queue_core::{
    driver::claim_order_key, EnqueueOptions, Executor, ExecutionOutcome,
    FailedJobRecord, JobRecord, JobResolver, JobStatus, NullLogger, ProcessOutcome, QueueConfig,
    QueueDriver, QueueError, QueueLogger, QueueStats, RandSource, RetryEvent, SystemClock,
    ThreadRand,
};
use queue_core::Clock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

struct State {
    active: Vec<JobRecord>,
    dlq: Vec<FailedJobRecord>,
}

/// In-process job queue driver. Cloning shares the underlying store (it is
/// `Arc`-backed internally), matching how a driver is typically handed to
/// several worker tasks.
#[derive(Clone)]
pub struct InMemoryDriver {
    state: Arc<Mutex<State>>,
    next_job_id: Arc<AtomicI64>,
    next_dlq_id: Arc<AtomicI64>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    rand: Arc<dyn RandSource>,
    resolver: Arc<dyn JobResolver>,
    logger: Arc<dyn QueueLogger>,
}

impl InMemoryDriver {
    pub fn new(config: QueueConfig, resolver: Arc<dyn JobResolver>) -> Self {
        Self::with_collaborators(
            config,
            resolver,
            Arc::new(SystemClock),
            Arc::new(ThreadRand),
            Arc::new(NullLogger),
        )
    }

    pub fn with_collaborators(
        config: QueueConfig,
        resolver: Arc<dyn JobResolver>,
        clock: Arc<dyn Clock>,
        rand: Arc<dyn RandSource>,
        logger: Arc<dyn QueueLogger>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                active: Vec::new(),
                dlq: Vec::new(),
            })),
            next_job_id: Arc::new(AtomicI64::new(1)),
            next_dlq_id: Arc::new(AtomicI64::new(1)),
            config,
            clock,
            rand,
            resolver,
            logger,
        }
    }

    fn timeout(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.config.job_timeout as i64)
    }

    /// Insert a fully-formed record directly, bypassing `enqueue`. Intended
    /// for tests that need to exercise housekeeping (`release_stuck`,
    /// `fail_exceeded`) against a row already in `processing`, which the
    /// public claim path has no synchronous way to produce once a handler
    /// is in flight.
    pub fn seed_job(&self, record: JobRecord) {
        self.state.lock().expect("in-memory driver mutex poisoned").active.push(record);
    }

    /// A snapshot of every active-table row, for introspection in tests.
    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.state.lock().expect("in-memory driver mutex poisoned").active.clone()
    }

    /// Find the index of the highest-priority, oldest-eligible pending job
    /// matching `queue`, honoring the global `priority DESC, created_at ASC`
    /// ordering required everywhere in the engine.
    fn pick_claimable(active: &[JobRecord], queue: Option<&str>) -> Option<usize> {
        active
            .iter()
            .enumerate()
            .filter(|(_, job)| job.status == JobStatus::Pending)
            .filter(|(_, job)| queue.map_or(true, |q| job.queue == q))
            .max_by_key(|(_, job)| claim_order_key(job.priority, job.created_at))
            .map(|(idx, _)| idx)
    }
}

#[async_trait]
impl QueueDriver for InMemoryDriver {
    async fn enqueue(
        &self,
        task: &str,
        payload: &serde_json::Value,
        queue: &str,
        options: EnqueueOptions,
    ) -> Result<bool, QueueError> {
        let payload_bytes = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(error = %err, "enqueue failed: payload did not serialize");
                return Err(QueueError::Serialization(err));
            }
        };

        let now = self.clock.now_utc();
        let available_at = now + ChronoDuration::seconds(options.delay_seconds as i64);
        let status = if options.delay_seconds > 0 {
            JobStatus::Delayed
        } else {
            JobStatus::Pending
        };

        let record = JobRecord {
            id: self.next_job_id.fetch_add(1, Ordering::SeqCst),
            queue: queue.to_string(),
            task: task.to_string(),
            payload: payload_bytes,
            status,
            priority: JobRecord::clamp_priority(options.priority),
            attempts: 0,
            max_attempts: options.max_attempts,
            timeout_seconds: options.timeout_seconds,
            backoff_strategy: options.backoff_strategy,
            retry_delay: options.retry_delay,
            last_error: None,
            tags: options.tags,
            available_at,
            reserved_at: None,
            created_at: now,
            updated_at: now,
        };

        self.state.lock().expect("in-memory driver mutex poisoned").active.push(record);
        Ok(true)
    }

    async fn process_one(&self, queue: Option<&str>) -> Result<Option<ProcessOutcome>, QueueError> {
        self.release_delayed().await?;
        self.release_stuck().await?;

        // Claim: find and mark `processing` under one mutex hold so no other
        // caller (even on another async task sharing this driver) can
        // observe the same row as pending.
        let claimed = {
            let mut state = self.state.lock().expect("in-memory driver mutex poisoned");
            let idx = match Self::pick_claimable(&state.active, queue) {
                Some(idx) => idx,
                None => return Ok(None),
            };
            let now = self.clock.now_utc();
            let job = &mut state.active[idx];
            job.status = JobStatus::Processing;
            job.attempts += 1;
            job.reserved_at = Some(now);
            job.updated_at = now;
            job.clone()
        };

        self.logger
            .log(claimed.id, "info", "claimed", serde_json::json!({"attempt": claimed.attempts}))
            .await;

        let executor = Executor::new(self.resolver.clone());
        let outcome = executor.execute(&claimed).await;

        let result = match outcome {
            ExecutionOutcome::Completed => {
                let now = self.clock.now_utc();
                {
                    let mut state = self.state.lock().expect("in-memory driver mutex poisoned");
                    if let Some(job) = state.active.iter_mut().find(|job| job.id == claimed.id) {
                        job.status = JobStatus::Completed;
                        job.updated_at = now;
                    }
                }
                self.logger.log(claimed.id, "info", "completed", serde_json::json!({})).await;
                ProcessOutcome::Completed
            }
            ExecutionOutcome::Failed { message, stack_trace } => {
                self.apply_failure(&claimed, &message, &stack_trace).await
            }
        };

        Ok(Some(result))
    }

    async fn stats(&self, queue: Option<&str>) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().expect("in-memory driver mutex poisoned");
        let jobs: Vec<&JobRecord> = state
            .active
            .iter()
            .filter(|job| queue.map_or(true, |q| job.queue == q))
            .collect();

        let mut stats = QueueStats::default();
        let mut total_attempts = 0u64;
        for job in &jobs {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Delayed => stats.delayed += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
            if job.priority >= 8 {
                stats.high_priority += 1;
            }
            total_attempts += job.attempts as u64;
        }
        stats.average_attempts = if jobs.is_empty() {
            0.0
        } else {
            total_attempts as f64 / jobs.len() as f64
        };
        stats.dead_letter = state
            .dlq
            .iter()
            .filter(|job| queue.map_or(true, |q| job.queue == q))
            .count() as u64;

        Ok(stats)
    }

    async fn get_failed_jobs(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<FailedJobRecord>, QueueError> {
        let state = self.state.lock().expect("in-memory driver mutex poisoned");
        let mut rows: Vec<FailedJobRecord> = state.dlq.clone();
        rows.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn get_failed_job(&self, id: i64) -> Result<Option<FailedJobRecord>, QueueError> {
        let state = self.state.lock().expect("in-memory driver mutex poisoned");
        Ok(state.dlq.iter().find(|job| job.id == id).cloned())
    }

    async fn retry_failed_job(&self, id: i64) -> Result<bool, QueueError> {
        let now = self.clock.now_utc();
        let mut state = self.state.lock().expect("in-memory driver mutex poisoned");
        let Some(pos) = state.dlq.iter().position(|job| job.id == id) else {
            return Ok(false);
        };
        let failed = state.dlq.remove(pos);
        state.active.push(JobRecord {
            id: failed.original_job_id,
            queue: failed.queue,
            task: failed.task,
            payload: failed.payload,
            status: JobStatus::Pending,
            priority: failed.priority,
            attempts: 0,
            max_attempts: failed.max_attempts,
            timeout_seconds: failed.timeout_seconds,
            backoff_strategy: failed.backoff_strategy,
            retry_delay: failed.retry_delay,
            last_error: None,
            tags: failed.tags,
            available_at: now,
            reserved_at: None,
            created_at: now,
            updated_at: now,
        });
        Ok(true)
    }

    async fn retry_all_failed_jobs(&self, queue: Option<&str>) -> Result<u64, QueueError> {
        let ids: Vec<i64> = {
            let state = self.state.lock().expect("in-memory driver mutex poisoned");
            state
                .dlq
                .iter()
                .filter(|job| queue.map_or(true, |q| job.queue == q))
                .map(|job| job.id)
                .collect()
        };
        let mut retried = 0u64;
        for id in ids {
            if self.retry_failed_job(id).await? {
                retried += 1;
            }
        }
        Ok(retried)
    }

    async fn purge_old_jobs(&self, older_than_days: u32) -> Result<u64, QueueError> {
        let cutoff = self.clock.now_utc() - ChronoDuration::days(older_than_days as i64);
        let mut state = self.state.lock().expect("in-memory driver mutex poisoned");
        let before_active = state.active.len();
        state
            .active
            .retain(|job| !(queue_core::driver::is_terminal(job.status) && job.updated_at < cutoff));
        let active_purged = (before_active - state.active.len()) as u64;

        let before_dlq = state.dlq.len();
        state.dlq.retain(|job| job.failed_at >= cutoff);
        let dlq_purged = (before_dlq - state.dlq.len()) as u64;

        Ok(active_purged + dlq_purged)
    }

    async fn purge_failed_jobs(&self, queue: Option<&str>) -> Result<u64, QueueError> {
        let mut state = self.state.lock().expect("in-memory driver mutex poisoned");
        let before = state.dlq.len();
        state.dlq.retain(|job| !queue.map_or(true, |q| job.queue == q));
        Ok((before - state.dlq.len()) as u64)
    }

    async fn release_delayed(&self) -> Result<u64, QueueError> {
        let now = self.clock.now_utc();
        let mut state = self.state.lock().expect("in-memory driver mutex poisoned");
        let mut released = 0u64;
        for job in state.active.iter_mut() {
            if job.status == JobStatus::Delayed && job.available_at <= now {
                job.status = JobStatus::Pending;
                job.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn release_stuck(&self) -> Result<u64, QueueError> {
        let now = self.clock.now_utc();
        let timeout = self.timeout();
        let mut state = self.state.lock().expect("in-memory driver mutex poisoned");
        let mut released = 0u64;
        for job in state.active.iter_mut() {
            if job.status == JobStatus::Processing
                && job.attempts < job.max_attempts
                && now - job.updated_at > timeout
            {
                job.status = JobStatus::Pending;
                job.reserved_at = None;
                job.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn fail_exceeded(&self) -> Result<u64, QueueError> {
        let now = self.clock.now_utc();
        let timeout = self.timeout();
        let mut state = self.state.lock().expect("in-memory driver mutex poisoned");
        let mut failed = 0u64;
        for job in state.active.iter_mut() {
            if job.status == JobStatus::Processing
                && job.attempts >= job.max_attempts
                && now - job.updated_at > timeout
            {
                job.status = JobStatus::Failed;
                job.updated_at = now;
                failed += 1;
            }
        }
        Ok(failed)
    }
}

impl InMemoryDriver {
    /// Shared tail of `process_one`'s failure path: decide retry vs.
    /// dead-letter, and apply the corresponding mutation atomically under
    /// the driver's single mutex.
    async fn apply_failure(
        &self,
        claimed: &JobRecord,
        message: &str,
        stack_trace: &str,
    ) -> ProcessOutcome {
        let truncated = JobRecord::truncate_error(message);
        let now = self.clock.now_utc();

        if claimed.attempts < claimed.max_attempts {
            let delay = queue_core::retry::delay_seconds(
                claimed.backoff_strategy,
                claimed.retry_delay,
                claimed.attempts,
                self.rand.as_ref(),
            );
            {
                let mut state = self.state.lock().expect("in-memory driver mutex poisoned");
                if let Some(job) = state.active.iter_mut().find(|job| job.id == claimed.id) {
                    job.status = JobStatus::Delayed;
                    job.available_at = now + ChronoDuration::seconds(delay as i64);
                    job.reserved_at = None;
                    job.last_error = Some(truncated);
                    job.updated_at = now;
                }
            }
            self.logger
                .log(claimed.id, "warn", "scheduled retry", serde_json::json!({"delay_seconds": delay}))
                .await;
            ProcessOutcome::Retried
        } else {
            {
                let mut state = self.state.lock().expect("in-memory driver mutex poisoned");
                let retry_history = vec![RetryEvent {
                    attempt: claimed.attempts,
                    error: truncated.clone(),
                    occurred_at: now,
                }];
                state.dlq.push(FailedJobRecord {
                    id: self.next_dlq_id.fetch_add(1, Ordering::SeqCst),
                    original_job_id: claimed.id,
                    queue: claimed.queue.clone(),
                    task: claimed.task.clone(),
                    payload: claimed.payload.clone(),
                    priority: claimed.priority,
                    max_attempts: claimed.max_attempts,
                    timeout_seconds: claimed.timeout_seconds,
                    backoff_strategy: claimed.backoff_strategy,
                    retry_delay: claimed.retry_delay,
                    tags: claimed.tags.clone(),
                    exception: truncated,
                    stack_trace: stack_trace.to_string(),
                    total_attempts: claimed.attempts,
                    retry_history,
                    failed_at: now,
                    created_at: claimed.created_at,
                });
                state.active.retain(|job| job.id != claimed.id);
            }
            self.logger.log(claimed.id, "error", "moved to dlq", serde_json::json!({})).await;
            ProcessOutcome::DeadLettered
        }
    }
}
