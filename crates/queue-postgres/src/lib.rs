//! # queue-postgres
//!
//! PostgreSQL implementation of the job queue engine's `QueueDriver`
//! contract.
//!
//! # Claim strategy
//!
//! Postgres supports `SELECT ... FOR UPDATE SKIP LOCKED`, so claiming a job
//! is a single short transaction: select the highest-priority, oldest
//! eligible row while skipping anything another transaction already holds a
//! row lock on, then update it by id.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id BIGSERIAL PRIMARY KEY,
//!     queue TEXT NOT NULL,
//!     task TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     status TEXT NOT NULL DEFAULT 'pending',
//!     priority SMALLINT NOT NULL DEFAULT 5,
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     max_attempts INTEGER NOT NULL DEFAULT 3,
//!     timeout_seconds INTEGER NOT NULL DEFAULT 300,
//!     backoff_strategy TEXT NOT NULL DEFAULT 'exponential',
//!     retry_delay INTEGER NOT NULL DEFAULT 60,
//!     last_error TEXT,
//!     tags JSONB NOT NULL DEFAULT '[]',
//!     available_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     reserved_at TIMESTAMPTZ,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE TABLE failed_jobs (
//!     id BIGSERIAL PRIMARY KEY,
//!     original_job_id BIGINT NOT NULL,
//!     queue TEXT NOT NULL,
//!     task TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     priority SMALLINT NOT NULL DEFAULT 5,
//!     max_attempts INTEGER NOT NULL DEFAULT 3,
//!     timeout_seconds INTEGER NOT NULL DEFAULT 300,
//!     backoff_strategy TEXT NOT NULL DEFAULT 'exponential',
//!     retry_delay INTEGER NOT NULL DEFAULT 60,
//!     tags JSONB NOT NULL DEFAULT '[]',
//!     exception TEXT NOT NULL,
//!     stack_trace TEXT NOT NULL,
//!     total_attempts INTEGER NOT NULL,
//!     retry_history JSONB NOT NULL DEFAULT '[]',
//!     failed_at TIMESTAMPTZ NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE INDEX idx_jobs_ready ON jobs (priority DESC, created_at ASC)
//!     WHERE status = 'pending';
//! CREATE INDEX idx_jobs_processing ON jobs (status, updated_at)
//!     WHERE status = 'processing';
//! CREATE INDEX idx_jobs_terminal ON jobs (status, created_at)
//!     WHERE status IN ('completed', 'failed');
//! CREATE INDEX idx_jobs_queue ON jobs (queue, status);
//! ```

mod rows;

use async_trait::async_trait;
use queue_core::{
    config::validate_table_name, record::LAST_ERROR_MAX_CHARS, retry::delay_seconds,
    EnqueueOptions, Executor, ExecutionOutcome, FailedJobRecord, JobRecord, JobResolver,
    ProcessOutcome, QueueConfig, QueueDriver, QueueError, QueueStats, RandSource, SystemClock,
    ThreadRand,
};
use queue_core::Clock;
use rows::{FailedJobRow, JobRow};
use sqlx::{PgPool, Row};
use std::sync::Arc;

/// PostgreSQL-backed job queue driver.
#[derive(Clone)]
pub struct PgQueueDriver {
    pool: PgPool,
    table: String,
    dlq_table: String,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    rand: Arc<dyn RandSource>,
    resolver: Arc<dyn JobResolver>,
}

impl PgQueueDriver {
    /// Construct a driver against `pool`, validating the configured table
    /// name up front — table identifiers are interpolated into SQL text
    /// rather than bound as parameters, so an unvalidated name would be a
    /// SQL injection vector.
    pub fn new(pool: PgPool, config: QueueConfig, resolver: Arc<dyn JobResolver>) -> Result<Self, QueueError> {
        validate_table_name(&config.table)?;
        let dlq_table = format!("{}_failed", config.table);
        validate_table_name(&dlq_table)?;
        Ok(Self {
            pool,
            table: config.table.clone(),
            dlq_table,
            config,
            clock: Arc::new(SystemClock),
            rand: Arc::new(ThreadRand),
            resolver,
        })
    }

    pub fn with_collaborators(mut self, clock: Arc<dyn Clock>, rand: Arc<dyn RandSource>) -> Self {
        self.clock = clock;
        self.rand = rand;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn timeout_interval(&self) -> String {
        format!("{} seconds", self.config.job_timeout)
    }
}

#[async_trait]
impl QueueDriver for PgQueueDriver {
    async fn enqueue(
        &self,
        task: &str,
        payload: &serde_json::Value,
        queue: &str,
        options: EnqueueOptions,
    ) -> Result<bool, QueueError> {
        let now = self.clock.now_utc();
        let available_at = now + chrono::Duration::seconds(options.delay_seconds as i64);
        let status = if options.delay_seconds > 0 { "delayed" } else { "pending" };
        let priority = JobRecord::clamp_priority(options.priority);
        let tags = serde_json::to_value(&options.tags).map_err(QueueError::Serialization)?;

        let sql = format!(
            r#"
            INSERT INTO {table} (
                queue, task, payload, status, priority, attempts, max_attempts,
                timeout_seconds, backoff_strategy, retry_delay, tags,
                available_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8, $9, $10, $11, $12, $12)
            "#,
            table = self.table
        );

        let result = sqlx::query(&sql)
            .bind(queue)
            .bind(task)
            .bind(payload)
            .bind(status)
            .bind(priority)
            .bind(options.max_attempts as i32)
            .bind(options.timeout_seconds as i32)
            .bind(backoff_name(options.backoff_strategy))
            .bind(options.retry_delay as i32)
            .bind(tags)
            .bind(available_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) => {
                tracing::error!(error = %err, "enqueue failed");
                Ok(false)
            }
        }
    }

    async fn process_one(&self, queue: Option<&str>) -> Result<Option<ProcessOutcome>, QueueError> {
        self.release_delayed().await?;
        self.release_stuck().await?;

        let claimed = match self.claim_one(queue).await? {
            Some(row) => row,
            None => return Ok(None),
        };
        let record: JobRecord = claimed.into();

        let executor = Executor::new(self.resolver.clone());
        let outcome = executor.execute(&record).await;

        let result = match outcome {
            ExecutionOutcome::Completed => {
                self.mark_completed(record.id).await?;
                ProcessOutcome::Completed
            }
            ExecutionOutcome::Failed { message, stack_trace } => {
                self.apply_failure(&record, &message, &stack_trace).await?
            }
        };
        Ok(Some(result))
    }

    async fn stats(&self, queue: Option<&str>) -> Result<QueueStats, QueueError> {
        let sql = format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'delayed') AS delayed,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE priority >= 8) AS high_priority,
                COALESCE(AVG(attempts), 0) AS average_attempts
            FROM {table}
            WHERE $1::text IS NULL OR queue = $1
            "#,
            table = self.table
        );
        let row = sqlx::query(&sql)
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        let dlq_sql = format!(
            "SELECT COUNT(*) AS count FROM {table} WHERE $1::text IS NULL OR queue = $1",
            table = self.dlq_table
        );
        let dlq_row = sqlx::query(&dlq_sql)
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        Ok(QueueStats {
            pending: row.try_get::<i64, _>("pending").unwrap_or(0) as u64,
            delayed: row.try_get::<i64, _>("delayed").unwrap_or(0) as u64,
            processing: row.try_get::<i64, _>("processing").unwrap_or(0) as u64,
            completed: row.try_get::<i64, _>("completed").unwrap_or(0) as u64,
            failed: row.try_get::<i64, _>("failed").unwrap_or(0) as u64,
            high_priority: row.try_get::<i64, _>("high_priority").unwrap_or(0) as u64,
            average_attempts: row.try_get::<f64, _>("average_attempts").unwrap_or(0.0),
            dead_letter: dlq_row.try_get::<i64, _>("count").unwrap_or(0) as u64,
        })
    }

    async fn get_failed_jobs(&self, limit: u32, offset: u32) -> Result<Vec<FailedJobRecord>, QueueError> {
        let sql = format!(
            "SELECT * FROM {table} ORDER BY failed_at DESC LIMIT $1 OFFSET $2",
            table = self.dlq_table
        );
        let rows: Vec<FailedJobRow> = sqlx::query_as(&sql)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_failed_job(&self, id: i64) -> Result<Option<FailedJobRecord>, QueueError> {
        let sql = format!("SELECT * FROM {table} WHERE id = $1", table = self.dlq_table);
        let row: Option<FailedJobRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;
        Ok(row.map(Into::into))
    }

    async fn retry_failed_job(&self, id: i64) -> Result<bool, QueueError> {
        let mut tx = self.pool.begin().await.map_err(|e| QueueError::Storage(e.into()))?;

        let select_sql = format!("SELECT * FROM {table} WHERE id = $1 FOR UPDATE", table = self.dlq_table);
        let row: Option<FailedJobRow> = sqlx::query_as(&select_sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;
        let Some(row) = row else {
            tx.rollback().await.ok();
            return Ok(false);
        };

        let now = self.clock.now_utc();
        let insert_sql = format!(
            r#"
            INSERT INTO {table} (
                queue, task, payload, status, priority, attempts, max_attempts,
                timeout_seconds, backoff_strategy, retry_delay, tags,
                available_at, created_at, updated_at
            ) VALUES ($1, $2, $3, 'pending', $4, 0, $5, $6, $7, $8, $9, $10, $10, $10)
            "#,
            table = self.table
        );
        sqlx::query(&insert_sql)
            .bind(&row.queue)
            .bind(&row.task)
            .bind(&row.payload)
            .bind(row.priority)
            .bind(row.max_attempts)
            .bind(row.timeout_seconds)
            .bind(&row.backoff_strategy)
            .bind(row.retry_delay)
            .bind(&row.tags)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        let delete_sql = format!("DELETE FROM {table} WHERE id = $1", table = self.dlq_table);
        sqlx::query(&delete_sql)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        tx.commit().await.map_err(|e| QueueError::Storage(e.into()))?;
        Ok(true)
    }

    async fn retry_all_failed_jobs(&self, queue: Option<&str>) -> Result<u64, QueueError> {
        let sql = format!(
            "SELECT id FROM {table} WHERE $1::text IS NULL OR queue = $1",
            table = self.dlq_table
        );
        let ids: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(queue)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;
        let mut retried = 0u64;
        for id in ids {
            if self.retry_failed_job(id).await? {
                retried += 1;
            }
        }
        Ok(retried)
    }

    async fn purge_old_jobs(&self, older_than_days: u32) -> Result<u64, QueueError> {
        let cutoff = self.clock.now_utc() - chrono::Duration::days(older_than_days as i64);
        let mut tx = self.pool.begin().await.map_err(|e| QueueError::Storage(e.into()))?;

        let active_sql = format!(
            "DELETE FROM {table} WHERE status IN ('completed', 'failed') AND updated_at < $1",
            table = self.table
        );
        let active_deleted = sqlx::query(&active_sql)
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?
            .rows_affected();

        let dlq_sql = format!("DELETE FROM {table} WHERE failed_at < $1", table = self.dlq_table);
        let dlq_deleted = sqlx::query(&dlq_sql)
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?
            .rows_affected();

        tx.commit().await.map_err(|e| QueueError::Storage(e.into()))?;
        Ok(active_deleted + dlq_deleted)
    }

    async fn purge_failed_jobs(&self, queue: Option<&str>) -> Result<u64, QueueError> {
        let sql = format!(
            "DELETE FROM {table} WHERE $1::text IS NULL OR queue = $1",
            table = self.dlq_table
        );
        let deleted = sqlx::query(&sql)
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?
            .rows_affected();
        Ok(deleted)
    }

    async fn release_delayed(&self) -> Result<u64, QueueError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'pending', updated_at = NOW()
            WHERE status = 'delayed' AND available_at <= NOW()
            "#,
            table = self.table
        );
        match sqlx::query(&sql).execute(&self.pool).await {
            Ok(result) => Ok(result.rows_affected()),
            Err(err) => {
                tracing::error!(error = %err, "release_delayed failed");
                Ok(0)
            }
        }
    }

    async fn release_stuck(&self) -> Result<u64, QueueError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'pending', reserved_at = NULL, updated_at = NOW()
            WHERE status = 'processing'
              AND attempts < max_attempts
              AND updated_at < NOW() - $1::interval
            "#,
            table = self.table
        );
        match sqlx::query(&sql).bind(self.timeout_interval()).execute(&self.pool).await {
            Ok(result) => Ok(result.rows_affected()),
            Err(err) => {
                tracing::error!(error = %err, "release_stuck failed");
                Ok(0)
            }
        }
    }

    async fn fail_exceeded(&self) -> Result<u64, QueueError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'failed', updated_at = NOW()
            WHERE status = 'processing'
              AND attempts >= max_attempts
              AND updated_at < NOW() - $1::interval
            "#,
            table = self.table
        );
        match sqlx::query(&sql).bind(self.timeout_interval()).execute(&self.pool).await {
            Ok(result) => Ok(result.rows_affected()),
            Err(err) => {
                tracing::error!(error = %err, "fail_exceeded failed");
                Ok(0)
            }
        }
    }
}

impl PgQueueDriver {
    /// Claim exactly one eligible job using `FOR UPDATE SKIP LOCKED` so
    /// concurrent claimers never select the same row: a row locked by
    /// another in-flight claim transaction is simply skipped, not waited
    /// on.
    async fn claim_one(&self, queue: Option<&str>) -> Result<Option<JobRow>, QueueError> {
        let mut tx = self.pool.begin().await.map_err(|e| QueueError::Storage(e.into()))?;

        let select_sql = format!(
            r#"
            SELECT * FROM {table}
            WHERE status = 'pending'
              AND available_at <= NOW()
              AND ($1::text IS NULL OR queue = $1)
            ORDER BY priority DESC, created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
            table = self.table
        );
        let candidate: Option<JobRow> = sqlx::query_as(&select_sql)
            .bind(queue)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        let Some(candidate) = candidate else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let update_sql = format!(
            r#"
            UPDATE {table}
            SET status = 'processing', attempts = attempts + 1, reserved_at = NOW(), updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
            table = self.table
        );
        let claimed: JobRow = sqlx::query_as(&update_sql)
            .bind(candidate.id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        tx.commit().await.map_err(|e| QueueError::Storage(e.into()))?;
        Ok(Some(claimed))
    }

    async fn mark_completed(&self, id: i64) -> Result<(), QueueError> {
        let sql = format!(
            "UPDATE {table} SET status = 'completed', updated_at = NOW() WHERE id = $1",
            table = self.table
        );
        sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;
        Ok(())
    }

    /// Decide retry vs. dead-letter and apply it. The DLQ move (insert +
    /// active-row delete) is one transaction, so a crash mid-move can never
    /// leave the job in both tables.
    async fn apply_failure(
        &self,
        record: &JobRecord,
        message: &str,
        stack_trace: &str,
    ) -> Result<ProcessOutcome, QueueError> {
        let truncated = JobRecord::truncate_error(message);
        debug_assert!(truncated.chars().count() <= LAST_ERROR_MAX_CHARS);

        if record.attempts < record.max_attempts {
            let delay = delay_seconds(record.backoff_strategy, record.retry_delay, record.attempts, self.rand.as_ref());
            let sql = format!(
                r#"
                UPDATE {table}
                SET status = 'delayed',
                    available_at = NOW() + $1::interval,
                    reserved_at = NULL,
                    last_error = $2,
                    updated_at = NOW()
                WHERE id = $3
                "#,
                table = self.table
            );
            sqlx::query(&sql)
                .bind(format!("{delay} seconds"))
                .bind(&truncated)
                .bind(record.id)
                .execute(&self.pool)
                .await
                .map_err(|e| QueueError::Storage(e.into()))?;
            Ok(ProcessOutcome::Retried)
        } else {
            let now = self.clock.now_utc();
            let retry_history = serde_json::json!([{
                "attempt": record.attempts,
                "error": truncated,
                "occurred_at": now,
            }]);
            let mut tx = self.pool.begin().await.map_err(|e| QueueError::Storage(e.into()))?;

            let insert_sql = format!(
                r#"
                INSERT INTO {dlq} (
                    original_job_id, queue, task, payload, priority, max_attempts,
                    timeout_seconds, backoff_strategy, retry_delay, tags,
                    exception, stack_trace, total_attempts, retry_history,
                    failed_at, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
                dlq = self.dlq_table
            );
            let payload_json = serde_json::from_slice::<serde_json::Value>(&record.payload)
                .unwrap_or(serde_json::Value::Null);
            sqlx::query(&insert_sql)
                .bind(record.id)
                .bind(&record.queue)
                .bind(&record.task)
                .bind(payload_json)
                .bind(record.priority)
                .bind(record.max_attempts as i32)
                .bind(record.timeout_seconds as i32)
                .bind(backoff_name(record.backoff_strategy))
                .bind(record.retry_delay as i32)
                .bind(serde_json::to_value(&record.tags).unwrap_or_default())
                .bind(&truncated)
                .bind(stack_trace)
                .bind(record.attempts as i32)
                .bind(retry_history)
                .bind(now)
                .bind(record.created_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| QueueError::Storage(e.into()))?;

            let delete_sql = format!("DELETE FROM {table} WHERE id = $1", table = self.table);
            sqlx::query(&delete_sql)
                .bind(record.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| QueueError::Storage(e.into()))?;

            tx.commit().await.map_err(|e| QueueError::Storage(e.into()))?;
            Ok(ProcessOutcome::DeadLettered)
        }
    }
}

fn backoff_name(strategy: queue_core::BackoffStrategy) -> &'static str {
    use queue_core::BackoffStrategy::*;
    match strategy {
        Fixed => "fixed",
        Linear => "linear",
        Exponential => "exponential",
        ExponentialJitter => "exponential_jitter",
    }
}
