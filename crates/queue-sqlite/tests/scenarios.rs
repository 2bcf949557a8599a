//! Integration tests against a real (in-memory) SQLite database, covering
//! the same end-to-end scenarios as `queue-memory`'s and `queue-postgres`'s
//! test suites, plus the dual claim-strategy switch this backend adds.

use queue_core::{EnqueueOptions, ProcessOutcome, QueueConfig, QueueDriver, StaticResolver};
use queue_sqlite::SqliteQueueDriver;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;

const SCHEMA: &str = r#"
CREATE TABLE jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    task TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 5,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    timeout_seconds INTEGER NOT NULL DEFAULT 300,
    backoff_strategy TEXT NOT NULL DEFAULT 'exponential',
    retry_delay INTEGER NOT NULL DEFAULT 60,
    last_error TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    available_at TEXT NOT NULL,
    reserved_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE jobs_failed (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    original_job_id INTEGER NOT NULL,
    queue TEXT NOT NULL,
    task TEXT NOT NULL,
    payload TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 5,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    timeout_seconds INTEGER NOT NULL DEFAULT 300,
    backoff_strategy TEXT NOT NULL DEFAULT 'exponential',
    retry_delay INTEGER NOT NULL DEFAULT 60,
    tags TEXT NOT NULL DEFAULT '[]',
    exception TEXT NOT NULL,
    stack_trace TEXT NOT NULL,
    total_attempts INTEGER NOT NULL,
    retry_history TEXT NOT NULL DEFAULT '[]',
    failed_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

async fn fresh_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    for statement in SCHEMA.split(';') {
        let statement = statement.trim();
        if !statement.is_empty() {
            sqlx::query(statement).execute(&pool).await.unwrap();
        }
    }
    pool
}

#[tokio::test]
async fn happy_path_completes_a_job() {
    let pool = fresh_pool().await;
    let resolver = Arc::new(StaticResolver::new().with("SendEmail", |_payload: serde_json::Value| async { Ok(()) }));
    let driver = SqliteQueueDriver::new(pool, QueueConfig::default(), resolver).await.unwrap();

    driver
        .enqueue("SendEmail", &serde_json::json!({"to": "a@b"}), "default", EnqueueOptions::default())
        .await
        .unwrap();

    let outcome = driver.process_one(None).await.unwrap();
    assert_eq!(outcome, Some(ProcessOutcome::Completed));

    let stats = driver.stats(None).await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn exhausted_retries_move_the_job_to_the_dead_letter_queue() {
    let pool = fresh_pool().await;
    let resolver = Arc::new(StaticResolver::new().with("AlwaysFails", |_payload: serde_json::Value| async {
        anyhow::bail!("boom")
    }));
    let driver = SqliteQueueDriver::new(pool, QueueConfig::default(), resolver).await.unwrap();

    driver
        .enqueue(
            "AlwaysFails",
            &serde_json::json!({}),
            "default",
            EnqueueOptions { max_attempts: 1, ..Default::default() },
        )
        .await
        .unwrap();

    let outcome = driver.process_one(None).await.unwrap();
    assert_eq!(outcome, Some(ProcessOutcome::DeadLettered));

    let stats = driver.stats(None).await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.dead_letter, 1);

    let failed = driver.get_failed_jobs(10, 0).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].task, "AlwaysFails");
}

#[tokio::test]
async fn retrying_a_dead_lettered_job_moves_it_back_to_pending() {
    let pool = fresh_pool().await;
    let resolver = Arc::new(StaticResolver::new().with("AlwaysFails", |_payload: serde_json::Value| async {
        anyhow::bail!("boom")
    }));
    let driver = SqliteQueueDriver::new(pool, QueueConfig::default(), resolver).await.unwrap();

    driver
        .enqueue(
            "AlwaysFails",
            &serde_json::json!({}),
            "default",
            EnqueueOptions { max_attempts: 1, ..Default::default() },
        )
        .await
        .unwrap();
    driver.process_one(None).await.unwrap();

    let failed = driver.get_failed_jobs(10, 0).await.unwrap();
    let retried = driver.retry_failed_job(failed[0].id).await.unwrap();
    assert!(retried);

    let stats = driver.stats(None).await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.dead_letter, 0);
}

#[tokio::test]
async fn priority_and_age_determine_claim_order() {
    let pool = fresh_pool().await;
    let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let recorded = order.clone();
    let resolver = Arc::new(StaticResolver::new().with("Work", move |payload: serde_json::Value| {
        let recorded = recorded.clone();
        async move {
            recorded.lock().await.push(payload["label"].as_str().unwrap().to_string());
            Ok(())
        }
    }));
    let driver = SqliteQueueDriver::new(pool, QueueConfig::default(), resolver).await.unwrap();

    driver
        .enqueue("Work", &serde_json::json!({"label": "low"}), "default", EnqueueOptions { priority: 1, ..Default::default() })
        .await
        .unwrap();
    driver
        .enqueue("Work", &serde_json::json!({"label": "high"}), "default", EnqueueOptions { priority: 9, ..Default::default() })
        .await
        .unwrap();

    driver.process_one(None).await.unwrap();
    driver.process_one(None).await.unwrap();

    let order = order.lock().await;
    assert_eq!(*order, vec!["high".to_string(), "low".to_string()]);
}

#[tokio::test]
async fn no_eligible_job_returns_none() {
    let pool = fresh_pool().await;
    let resolver = Arc::new(StaticResolver::new());
    let driver = SqliteQueueDriver::new(pool, QueueConfig::default(), resolver).await.unwrap();

    assert_eq!(driver.process_one(None).await.unwrap(), None);
}

#[tokio::test]
async fn in_memory_sqlite_reports_the_fast_returning_path() {
    let pool = fresh_pool().await;
    let resolver = Arc::new(StaticResolver::new());
    let driver = SqliteQueueDriver::new(pool, QueueConfig::default(), resolver).await.unwrap();

    assert!(driver.supports_returning(), "bundled sqlx libsqlite3 is expected to support RETURNING");
}
