//! The six literal end-to-end scenarios from the design document, plus the
//! universal invariants expressed as properties.

use queue_core::{
    BackoffStrategy, Clock, EnqueueOptions, JobStatus, ProcessOutcome, QueueConfig, QueueDriver,
    StaticResolver,
};
use queue_memory::InMemoryDriver;
use queue_testing::FakeClock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn driver_with(resolver: StaticResolver, clock: Arc<FakeClock>) -> InMemoryDriver {
    InMemoryDriver::with_collaborators(
        QueueConfig::default(),
        Arc::new(resolver),
        clock,
        Arc::new(queue_core::ThreadRand),
        Arc::new(queue_core::NullLogger),
    )
}

#[tokio::test]
async fn scenario_1_happy_path() {
    let clock = Arc::new(FakeClock::starting_now());
    let resolver = StaticResolver::new().with("SendEmail", |_payload: serde_json::Value| async {
        Ok(())
    });
    let driver = driver_with(resolver, clock);

    driver
        .enqueue(
            "SendEmail",
            &serde_json::json!({"to": "a@b"}),
            "default",
            EnqueueOptions {
                priority: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let outcome = driver.process_one(None).await.unwrap();
    assert_eq!(outcome, Some(ProcessOutcome::Completed));

    let stats = driver.stats(None).await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn scenario_2_retry_with_exponential_backoff_then_success() {
    let clock = Arc::new(FakeClock::starting_now());
    let call_count = Arc::new(AtomicU32::new(0));
    let handler_calls = call_count.clone();
    let resolver = StaticResolver::new().with("Flaky", move |_payload: serde_json::Value| {
        let handler_calls = handler_calls.clone();
        async move {
            let attempt = handler_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < 3 {
                anyhow::bail!("not yet")
            } else {
                Ok(())
            }
        }
    });
    let driver = driver_with(resolver, clock.clone());

    driver
        .enqueue(
            "Flaky",
            &serde_json::json!({}),
            "default",
            EnqueueOptions {
                max_attempts: 3,
                backoff_strategy: BackoffStrategy::Exponential,
                retry_delay: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Attempt 1 fails -> delayed.
    assert_eq!(driver.process_one(None).await.unwrap(), Some(ProcessOutcome::Retried));
    assert_eq!(driver.process_one(None).await.unwrap(), None); // still delayed
    clock.advance(chrono::Duration::seconds(2));

    // Attempt 2 fails -> delayed again.
    assert_eq!(driver.process_one(None).await.unwrap(), Some(ProcessOutcome::Retried));
    clock.advance(chrono::Duration::seconds(4));

    // Attempt 3 succeeds.
    assert_eq!(driver.process_one(None).await.unwrap(), Some(ProcessOutcome::Completed));

    let stats = driver.stats(None).await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.dead_letter, 0);
}

#[tokio::test]
async fn scenario_3_dlq_move_on_exhausted_attempts() {
    let clock = Arc::new(FakeClock::starting_now());
    let resolver = StaticResolver::new().with("AlwaysFails", |_payload: serde_json::Value| async {
        anyhow::bail!("nope")
    });
    let driver = driver_with(resolver, clock.clone());

    driver
        .enqueue(
            "AlwaysFails",
            &serde_json::json!({}),
            "default",
            EnqueueOptions {
                max_attempts: 2,
                retry_delay: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(driver.process_one(None).await.unwrap(), Some(ProcessOutcome::Retried));
    clock.advance(chrono::Duration::seconds(5));
    assert_eq!(driver.process_one(None).await.unwrap(), Some(ProcessOutcome::DeadLettered));

    let stats = driver.stats(None).await.unwrap();
    assert_eq!(stats.pending + stats.delayed + stats.processing + stats.completed + stats.failed, 0);
    assert_eq!(stats.dead_letter, 1);

    let dlq = driver.get_failed_jobs(10, 0).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].total_attempts, 2);
    assert!(!dlq[0].stack_trace.is_empty());
    assert!(dlq[0].retry_history.len() >= 1);
}

#[tokio::test]
async fn scenario_4_stuck_release_recovers_a_dead_workers_claim() {
    let clock = Arc::new(FakeClock::starting_now());
    let mut config = QueueConfig::default();
    config.job_timeout = 30;
    let driver = InMemoryDriver::with_collaborators(
        config,
        Arc::new(StaticResolver::new()),
        clock.clone() as Arc<dyn Clock>,
        Arc::new(queue_core::ThreadRand),
        Arc::new(queue_core::NullLogger),
    );

    // Simulate a worker that claimed a job (status=processing, attempts
    // incremented, reserved_at set) and then crashed before reporting an
    // outcome — a case the public claim path cannot reach synchronously
    // since it awaits the handler to completion.
    let mut record = queue_testing::job_record(1, "Noop", serde_json::json!({}));
    record.status = JobStatus::Processing;
    record.attempts = 1;
    record.reserved_at = Some(clock.now_utc());
    driver.seed_job(record);

    clock.advance(chrono::Duration::seconds(31));
    let released = driver.release_stuck().await.unwrap();
    assert_eq!(released, 1);

    let job = driver.snapshot().into_iter().find(|j| j.id == 1).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn fail_exceeded_marks_stuck_jobs_past_attempts_as_failed() {
    let clock = Arc::new(FakeClock::starting_now());
    let mut config = QueueConfig::default();
    config.job_timeout = 30;
    let driver = InMemoryDriver::with_collaborators(
        config,
        Arc::new(StaticResolver::new()),
        clock.clone() as Arc<dyn Clock>,
        Arc::new(queue_core::ThreadRand),
        Arc::new(queue_core::NullLogger),
    );

    let mut record = queue_testing::job_record(1, "Noop", serde_json::json!({}));
    record.status = JobStatus::Processing;
    record.attempts = record.max_attempts;
    record.reserved_at = Some(clock.now_utc());
    driver.seed_job(record);

    clock.advance(chrono::Duration::seconds(31));
    assert_eq!(driver.release_stuck().await.unwrap(), 0);
    assert_eq!(driver.fail_exceeded().await.unwrap(), 1);

    let job = driver.snapshot().into_iter().find(|j| j.id == 1).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn scenario_5_priority_then_oldest_ordering() {
    let clock = Arc::new(FakeClock::starting_now());
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorded = order.clone();
    let resolver = StaticResolver::new().with("Record", move |payload: serde_json::Value| {
        let recorded = recorded.clone();
        async move {
            recorded.lock().unwrap().push(payload["name"].as_str().unwrap().to_string());
            Ok(())
        }
    });
    let driver = driver_with(resolver, clock.clone());

    driver
        .enqueue(
            "Record",
            &serde_json::json!({"name": "A"}),
            "default",
            EnqueueOptions { priority: 5, ..Default::default() },
        )
        .await
        .unwrap();
    clock.advance(chrono::Duration::milliseconds(1));
    driver
        .enqueue(
            "Record",
            &serde_json::json!({"name": "B"}),
            "default",
            EnqueueOptions { priority: 9, ..Default::default() },
        )
        .await
        .unwrap();
    clock.advance(chrono::Duration::milliseconds(1));
    driver
        .enqueue(
            "Record",
            &serde_json::json!({"name": "C"}),
            "default",
            EnqueueOptions { priority: 9, ..Default::default() },
        )
        .await
        .unwrap();

    for _ in 0..3 {
        driver.process_one(None).await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec!["B", "C", "A"]);
}

#[tokio::test]
async fn scenario_6_concurrent_claim_is_exclusive() {
    let clock = Arc::new(FakeClock::starting_now());
    let resolver = StaticResolver::new().with("Work", |_payload: serde_json::Value| async { Ok(()) });
    let driver = driver_with(resolver, clock);

    driver
        .enqueue("Work", &serde_json::json!({}), "default", EnqueueOptions::default())
        .await
        .unwrap();

    let driver_a = driver.clone();
    let driver_b = driver.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { driver_a.process_one(None).await.unwrap() }),
        tokio::spawn(async move { driver_b.process_one(None).await.unwrap() }),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let completions = [a, b].into_iter().filter(|o| *o == Some(ProcessOutcome::Completed)).count();
    let nothings = [a, b].into_iter().filter(|o| o.is_none()).count();
    assert_eq!(completions, 1);
    assert_eq!(nothings, 1);
}

#[tokio::test]
async fn delayed_job_is_never_observed_before_its_available_at() {
    let clock = Arc::new(FakeClock::starting_now());
    let resolver = StaticResolver::new().with("Later", |_payload: serde_json::Value| async { Ok(()) });
    let driver = driver_with(resolver, clock.clone());

    driver
        .enqueue(
            "Later",
            &serde_json::json!({}),
            "default",
            EnqueueOptions { delay_seconds: 60, ..Default::default() },
        )
        .await
        .unwrap();

    assert_eq!(driver.process_one(None).await.unwrap(), None);
    clock.advance(chrono::Duration::seconds(59));
    assert_eq!(driver.process_one(None).await.unwrap(), None);
    clock.advance(chrono::Duration::seconds(2));
    assert_eq!(driver.process_one(None).await.unwrap(), Some(ProcessOutcome::Completed));
}

#[tokio::test]
async fn retry_round_trip_moves_a_dlq_row_back_to_pending() {
    let clock = Arc::new(FakeClock::starting_now());
    let resolver = StaticResolver::new().with("Doomed", |_payload: serde_json::Value| async {
        anyhow::bail!("always")
    });
    let driver = driver_with(resolver, clock.clone());

    driver
        .enqueue(
            "Doomed",
            &serde_json::json!({}),
            "default",
            EnqueueOptions { max_attempts: 1, ..Default::default() },
        )
        .await
        .unwrap();
    driver.process_one(None).await.unwrap();

    let dlq = driver.get_failed_jobs(10, 0).await.unwrap();
    assert_eq!(dlq.len(), 1);

    let retried = driver.retry_failed_job(dlq[0].id).await.unwrap();
    assert!(retried);
    assert!(driver.get_failed_job(dlq[0].id).await.unwrap().is_none());

    let stats = driver.stats(None).await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.dead_letter, 0);
}

#[tokio::test]
async fn table_name_validation_is_independent_of_the_driver() {
    assert!(queue_core::config::validate_table_name("jobs").is_ok());
    assert!(queue_core::config::validate_table_name("jobs; DROP TABLE x;").is_err());
}
