//! # queue-sqlite
//!
//! SQLite implementation of the job queue engine's `QueueDriver` contract.
//!
//! # Claim strategy
//!
//! SQLite has no `SKIP LOCKED` — only one writer holds the database lock at
//! a time. When the connected engine is new enough to support `UPDATE ...
//! RETURNING` (SQLite ≥ 3.35, released 2021-03), claiming a job is a single
//! atomic statement: the subselect and the update run under SQLite's own
//! writer-lock serialization, so there is no window for a lost update.  On
//! older engines, the driver falls back to an explicit `BEGIN IMMEDIATE`
//! transaction (acquiring the write lock up front, rather than on first
//! write) wrapping a `SELECT` then an `UPDATE` by id; contending
//! connections are serialized by that write lock, not by row locking.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     queue TEXT NOT NULL,
//!     task TEXT NOT NULL,
//!     payload TEXT NOT NULL,
//!     status TEXT NOT NULL DEFAULT 'pending',
//!     priority INTEGER NOT NULL DEFAULT 5,
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     max_attempts INTEGER NOT NULL DEFAULT 3,
//!     timeout_seconds INTEGER NOT NULL DEFAULT 300,
//!     backoff_strategy TEXT NOT NULL DEFAULT 'exponential',
//!     retry_delay INTEGER NOT NULL DEFAULT 60,
//!     last_error TEXT,
//!     tags TEXT NOT NULL DEFAULT '[]',
//!     available_at TEXT NOT NULL,
//!     reserved_at TEXT,
//!     created_at TEXT NOT NULL,
//!     updated_at TEXT NOT NULL
//! );
//!
//! CREATE TABLE jobs_failed (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     original_job_id INTEGER NOT NULL,
//!     queue TEXT NOT NULL,
//!     task TEXT NOT NULL,
//!     payload TEXT NOT NULL,
//!     priority INTEGER NOT NULL DEFAULT 5,
//!     max_attempts INTEGER NOT NULL DEFAULT 3,
//!     timeout_seconds INTEGER NOT NULL DEFAULT 300,
//!     backoff_strategy TEXT NOT NULL DEFAULT 'exponential',
//!     retry_delay INTEGER NOT NULL DEFAULT 60,
//!     tags TEXT NOT NULL DEFAULT '[]',
//!     exception TEXT NOT NULL,
//!     stack_trace TEXT NOT NULL,
//!     total_attempts INTEGER NOT NULL,
//!     retry_history TEXT NOT NULL DEFAULT '[]',
//!     failed_at TEXT NOT NULL,
//!     created_at TEXT NOT NULL
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
use sqlx::SqlitePool;
use std::sync::Arc;

/// SQLite-backed job queue driver.
#[derive(Clone)]
pub struct SqliteQueueDriver {
    pool: SqlitePool,
    table: String,
    dlq_table: String,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    rand: Arc<dyn RandSource>,
    resolver: Arc<dyn JobResolver>,
    supports_returning: bool,
}

impl SqliteQueueDriver {
    pub async fn new(pool: SqlitePool, config: QueueConfig, resolver: Arc<dyn JobResolver>) -> Result<Self, QueueError> {
        validate_table_name(&config.table)?;
        let dlq_table = format!("{}_failed", config.table);
        validate_table_name(&dlq_table)?;
        let supports_returning = detect_returning_support(&pool).await;
        Ok(Self {
            pool,
            table: config.table.clone(),
            dlq_table,
            config,
            clock: Arc::new(SystemClock),
            rand: Arc::new(ThreadRand),
            resolver,
            supports_returning,
        })
    }

    pub fn with_collaborators(mut self, clock: Arc<dyn Clock>, rand: Arc<dyn RandSource>) -> Self {
        self.clock = clock;
        self.rand = rand;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Whether the connected engine supports the `UPDATE ... RETURNING`
    /// fast path. Exposed for tests that want to assert which claim
    /// strategy actually ran.
    pub fn supports_returning(&self) -> bool {
        self.supports_returning
    }
}

/// SQLite gained `RETURNING` in 3.35.0 (2021-03-12).
async fn detect_returning_support(pool: &SqlitePool) -> bool {
    let version: Result<String, _> = sqlx::query_scalar("SELECT sqlite_version()").fetch_one(pool).await;
    match version {
        Ok(version) => parse_version(&version).map(|v| v >= (3, 35, 0)).unwrap_or(false),
        Err(_) => false,
    }
}

fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.split('.').map(|p| p.parse::<u32>().ok());
    Some((parts.next()??, parts.next()??, parts.next().flatten().unwrap_or(0)))
}

#[async_trait]
impl QueueDriver for SqliteQueueDriver {
    async fn enqueue(
        &self,
        task: &str,
        payload: &serde_json::Value,
        queue: &str,
        options: EnqueueOptions,
    ) -> Result<bool, QueueError> {
        let payload_text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(error = %err, "enqueue failed: payload did not serialize");
                return Err(QueueError::Serialization(err));
            }
        };

        let now = self.clock.now_utc();
        let available_at = now + chrono::Duration::seconds(options.delay_seconds as i64);
        let status = if options.delay_seconds > 0 { "delayed" } else { "pending" };
        let priority = JobRecord::clamp_priority(options.priority);
        let tags = serde_json::to_string(&options.tags).unwrap_or_else(|_| "[]".to_string());

        let sql = format!(
            r#"
            INSERT INTO {table} (
                queue, task, payload, status, priority, attempts, max_attempts,
                timeout_seconds, backoff_strategy, retry_delay, tags,
                available_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            table = self.table
        );

        let result = sqlx::query(&sql)
            .bind(queue)
            .bind(task)
            .bind(payload_text)
            .bind(status)
            .bind(priority)
            .bind(options.max_attempts as i64)
            .bind(options.timeout_seconds as i64)
            .bind(backoff_name(options.backoff_strategy))
            .bind(options.retry_delay as i64)
            .bind(tags)
            .bind(available_at)
            .bind(now)
            .bind(now)
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
                SUM(status = 'pending') AS pending,
                SUM(status = 'delayed') AS delayed,
                SUM(status = 'processing') AS processing,
                SUM(status = 'completed') AS completed,
                SUM(status = 'failed') AS failed,
                SUM(priority >= 8) AS high_priority,
                COALESCE(AVG(attempts), 0.0) AS average_attempts,
                COUNT(*) AS total
            FROM {table}
            WHERE ?1 IS NULL OR queue = ?1
            "#,
            table = self.table
        );
        let row: (Option<i64>, Option<i64>, Option<i64>, Option<i64>, Option<i64>, Option<i64>, f64, i64) =
            sqlx::query_as(&sql)
                .bind(queue)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| QueueError::Storage(e.into()))?;

        let dlq_sql = format!("SELECT COUNT(*) FROM {table} WHERE ?1 IS NULL OR queue = ?1", table = self.dlq_table);
        let dead_letter: i64 = sqlx::query_scalar(&dlq_sql)
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        Ok(QueueStats {
            pending: row.0.unwrap_or(0) as u64,
            delayed: row.1.unwrap_or(0) as u64,
            processing: row.2.unwrap_or(0) as u64,
            completed: row.3.unwrap_or(0) as u64,
            failed: row.4.unwrap_or(0) as u64,
            high_priority: row.5.unwrap_or(0) as u64,
            average_attempts: row.6,
            dead_letter: dead_letter as u64,
        })
    }

    async fn get_failed_jobs(&self, limit: u32, offset: u32) -> Result<Vec<FailedJobRecord>, QueueError> {
        let sql = format!("SELECT * FROM {table} ORDER BY failed_at DESC LIMIT ? OFFSET ?", table = self.dlq_table);
        let rows: Vec<FailedJobRow> = sqlx::query_as(&sql)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_failed_job(&self, id: i64) -> Result<Option<FailedJobRecord>, QueueError> {
        let sql = format!("SELECT * FROM {table} WHERE id = ?", table = self.dlq_table);
        let row: Option<FailedJobRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;
        Ok(row.map(Into::into))
    }

    async fn retry_failed_job(&self, id: i64) -> Result<bool, QueueError> {
        let mut tx = self.pool.begin().await.map_err(|e| QueueError::Storage(e.into()))?;

        let select_sql = format!("SELECT * FROM {table} WHERE id = ?", table = self.dlq_table);
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
            ) VALUES (?, ?, ?, 'pending', ?, 0, ?, ?, ?, ?, ?, ?, ?, ?)
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
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        let delete_sql = format!("DELETE FROM {table} WHERE id = ?", table = self.dlq_table);
        sqlx::query(&delete_sql)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        tx.commit().await.map_err(|e| QueueError::Storage(e.into()))?;
        Ok(true)
    }

    async fn retry_all_failed_jobs(&self, queue: Option<&str>) -> Result<u64, QueueError> {
        let sql = format!("SELECT id FROM {table} WHERE ?1 IS NULL OR queue = ?1", table = self.dlq_table);
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
            "DELETE FROM {table} WHERE status IN ('completed', 'failed') AND updated_at < ?",
            table = self.table
        );
        let active_deleted = sqlx::query(&active_sql)
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?
            .rows_affected();

        let dlq_sql = format!("DELETE FROM {table} WHERE failed_at < ?", table = self.dlq_table);
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
        let sql = format!("DELETE FROM {table} WHERE ?1 IS NULL OR queue = ?1", table = self.dlq_table);
        let deleted = sqlx::query(&sql)
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?
            .rows_affected();
        Ok(deleted)
    }

    async fn release_delayed(&self) -> Result<u64, QueueError> {
        let now = self.clock.now_utc();
        let sql = format!(
            "UPDATE {table} SET status = 'pending', updated_at = ? WHERE status = 'delayed' AND available_at <= ?",
            table = self.table
        );
        match sqlx::query(&sql).bind(now).bind(now).execute(&self.pool).await {
            Ok(result) => Ok(result.rows_affected()),
            Err(err) => {
                tracing::error!(error = %err, "release_delayed failed");
                Ok(0)
            }
        }
    }

    async fn release_stuck(&self) -> Result<u64, QueueError> {
        let now = self.clock.now_utc();
        let cutoff = now - chrono::Duration::seconds(self.config.job_timeout as i64);
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'pending', reserved_at = NULL, updated_at = ?
            WHERE status = 'processing' AND attempts < max_attempts AND updated_at < ?
            "#,
            table = self.table
        );
        match sqlx::query(&sql).bind(now).bind(cutoff).execute(&self.pool).await {
            Ok(result) => Ok(result.rows_affected()),
            Err(err) => {
                tracing::error!(error = %err, "release_stuck failed");
                Ok(0)
            }
        }
    }

    async fn fail_exceeded(&self) -> Result<u64, QueueError> {
        let now = self.clock.now_utc();
        let cutoff = now - chrono::Duration::seconds(self.config.job_timeout as i64);
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'failed', updated_at = ?
            WHERE status = 'processing' AND attempts >= max_attempts AND updated_at < ?
            "#,
            table = self.table
        );
        match sqlx::query(&sql).bind(now).bind(cutoff).execute(&self.pool).await {
            Ok(result) => Ok(result.rows_affected()),
            Err(err) => {
                tracing::error!(error = %err, "fail_exceeded failed");
                Ok(0)
            }
        }
    }
}

impl SqliteQueueDriver {
    async fn claim_one(&self, queue: Option<&str>) -> Result<Option<JobRow>, QueueError> {
        if self.supports_returning {
            self.claim_one_fast_path(queue).await
        } else {
            self.claim_one_exclusive_transaction(queue).await
        }
    }

    /// `UPDATE ... RETURNING` in one statement. SQLite's single-writer lock
    /// makes this atomic with respect to other connections without an
    /// explicit transaction.
    async fn claim_one_fast_path(&self, queue: Option<&str>) -> Result<Option<JobRow>, QueueError> {
        let now = self.clock.now_utc();
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'processing', attempts = attempts + 1, reserved_at = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM {table}
                WHERE status = 'pending'
                  AND available_at <= ?
                  AND (?4 IS NULL OR queue = ?4)
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
            )
            RETURNING *
            "#,
            table = self.table
        );
        let claimed: Option<JobRow> = sqlx::query_as(&sql)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(queue)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;
        Ok(claimed)
    }

    /// `BEGIN IMMEDIATE` acquires the write lock before the `SELECT` runs,
    /// so no other connection can claim the same row between the select
    /// and the update — the serialization point is the write lock, not a
    /// per-row lock.
    async fn claim_one_exclusive_transaction(&self, queue: Option<&str>) -> Result<Option<JobRow>, QueueError> {
        let mut conn = self.pool.acquire().await.map_err(|e| QueueError::Storage(e.into()))?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        let now = self.clock.now_utc();
        let select_sql = format!(
            r#"
            SELECT id FROM {table}
            WHERE status = 'pending' AND available_at <= ? AND (?2 IS NULL OR queue = ?2)
            ORDER BY priority DESC, created_at ASC
            LIMIT 1
            "#,
            table = self.table
        );
        let candidate_id: Option<i64> = sqlx::query_scalar(&select_sql)
            .bind(now)
            .bind(queue)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        let Some(candidate_id) = candidate_id else {
            sqlx::query("ROLLBACK").execute(&mut *conn).await.ok();
            return Ok(None);
        };

        let update_sql = format!(
            "UPDATE {table} SET status = 'processing', attempts = attempts + 1, reserved_at = ?, updated_at = ? WHERE id = ?",
            table = self.table
        );
        sqlx::query(&update_sql)
            .bind(now)
            .bind(now)
            .bind(candidate_id)
            .execute(&mut *conn)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        let select_claimed_sql = format!("SELECT * FROM {table} WHERE id = ?", table = self.table);
        let claimed: JobRow = sqlx::query_as(&select_claimed_sql)
            .bind(candidate_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;

        Ok(Some(claimed))
    }

    async fn mark_completed(&self, id: i64) -> Result<(), QueueError> {
        let now = self.clock.now_utc();
        let sql = format!("UPDATE {table} SET status = 'completed', updated_at = ? WHERE id = ?", table = self.table);
        sqlx::query(&sql)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Storage(e.into()))?;
        Ok(())
    }

    async fn apply_failure(
        &self,
        record: &JobRecord,
        message: &str,
        stack_trace: &str,
    ) -> Result<ProcessOutcome, QueueError> {
        let truncated = JobRecord::truncate_error(message);
        debug_assert!(truncated.chars().count() <= LAST_ERROR_MAX_CHARS);
        let now = self.clock.now_utc();

        if record.attempts < record.max_attempts {
            let delay = delay_seconds(record.backoff_strategy, record.retry_delay, record.attempts, self.rand.as_ref());
            let available_at = now + chrono::Duration::seconds(delay as i64);
            let sql = format!(
                r#"
                UPDATE {table}
                SET status = 'delayed', available_at = ?, reserved_at = NULL, last_error = ?, updated_at = ?
                WHERE id = ?
                "#,
                table = self.table
            );
            sqlx::query(&sql)
                .bind(available_at)
                .bind(&truncated)
                .bind(now)
                .bind(record.id)
                .execute(&self.pool)
                .await
                .map_err(|e| QueueError::Storage(e.into()))?;
            Ok(ProcessOutcome::Retried)
        } else {
            let retry_history = serde_json::to_string(&serde_json::json!([{
                "attempt": record.attempts,
                "error": truncated,
                "occurred_at": now,
            }]))
            .unwrap_or_else(|_| "[]".to_string());
            let mut tx = self.pool.begin().await.map_err(|e| QueueError::Storage(e.into()))?;

            let insert_sql = format!(
                r#"
                INSERT INTO {dlq} (
                    original_job_id, queue, task, payload, priority, max_attempts,
                    timeout_seconds, backoff_strategy, retry_delay, tags,
                    exception, stack_trace, total_attempts, retry_history,
                    failed_at, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                dlq = self.dlq_table
            );
            let tags_json = serde_json::to_string(&record.tags).unwrap_or_else(|_| "[]".to_string());
            sqlx::query(&insert_sql)
                .bind(record.id)
                .bind(&record.queue)
                .bind(&record.task)
                .bind(String::from_utf8_lossy(&record.payload).to_string())
                .bind(record.priority)
                .bind(record.max_attempts as i64)
                .bind(record.timeout_seconds as i64)
                .bind(backoff_name(record.backoff_strategy))
                .bind(record.retry_delay as i64)
                .bind(tags_json)
                .bind(&truncated)
                .bind(stack_trace)
                .bind(record.attempts as i64)
                .bind(retry_history)
                .bind(now)
                .bind(record.created_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| QueueError::Storage(e.into()))?;

            let delete_sql = format!("DELETE FROM {table} WHERE id = ?", table = self.table);
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
