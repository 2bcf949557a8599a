//! # queue-cli
//!
//! A thin CLI wrapper over the job queue engine's operational surface. It
//! contains no engine logic of its own — every subcommand is a direct call
//! into `queue-core`/`queue-worker`/one of the driver crates, selected by the
//! `QUEUE_DRIVER` environment variable.
//!
//! Handler registration is the embedding application's responsibility: this
//! crate exposes [`run`] as a library entry point taking a [`JobResolver`],
//! so a real deployment links `queue-cli` into its own binary and passes its
//! own `StaticResolver`. `main.rs` here runs with an empty resolver, which is
//! enough to exercise every subcommand except job execution itself.

use clap::{Parser, Subcommand};
use queue_core::{JobResolver, QueueConfig, QueueDriver};
use queue_worker::BatchWorker;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "queue-cli", about = "Operate a durable job queue")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Invoke processBatch once with defaults.
    Run {
        queue: Option<String>,
    },
    /// Invoke processBatch with an explicit size/queue/budget.
    Batch {
        #[arg(default_value_t = 10)]
        size: usize,
        queue: Option<String>,
        #[arg(default_value_t = 55)]
        budget: u64,
    },
    Stats {
        queue: Option<String>,
    },
    #[command(name = "failed:list")]
    FailedList {
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    #[command(name = "failed:retry")]
    FailedRetry {
        id: i64,
    },
    #[command(name = "failed:retry-all")]
    FailedRetryAll {
        queue: Option<String>,
    },
    #[command(name = "purge:old")]
    PurgeOld {
        #[arg(default_value_t = 7)]
        days: u32,
    },
    #[command(name = "purge:failed")]
    PurgeFailed {
        queue: Option<String>,
    },
}

/// Which backend `QUEUE_DRIVER` selects. Matches the three literal values
/// named in the engine's configuration surface.
enum DriverKind {
    Memory,
    SkipLock,
    Transactional,
}

impl DriverKind {
    fn from_env() -> Self {
        match std::env::var("QUEUE_DRIVER").as_deref() {
            Ok("skip_lock") => Self::SkipLock,
            Ok("transactional") => Self::Transactional,
            _ => Self::Memory,
        }
    }
}

async fn build_driver(resolver: Arc<dyn JobResolver>) -> anyhow::Result<Arc<dyn QueueDriver>> {
    let config = QueueConfig::from_env()?;
    match DriverKind::from_env() {
        DriverKind::Memory => Ok(Arc::new(queue_memory::InMemoryDriver::new(config, resolver))),
        DriverKind::SkipLock => {
            let url = std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("QUEUE_DRIVER=skip_lock requires DATABASE_URL"))?;
            let pool = sqlx::PgPool::connect(&url).await?;
            Ok(Arc::new(queue_postgres::PgQueueDriver::new(pool, config, resolver)?))
        }
        DriverKind::Transactional => {
            let url = std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite::memory:".to_string());
            let pool = sqlx::SqlitePool::connect(&url).await?;
            Ok(Arc::new(queue_sqlite::SqliteQueueDriver::new(pool, config, resolver).await?))
        }
    }
}

/// Run the CLI. `resolver` is whatever the embedding application wants to
/// execute jobs with; `queue-cli`'s own `main` passes an empty one.
pub async fn run(cli: Cli, resolver: Arc<dyn JobResolver>) -> anyhow::Result<()> {
    let driver = build_driver(resolver).await?;

    match cli.command {
        Command::Run { queue } => {
            let worker = BatchWorker::new();
            let result = worker
                .run_batch(driver.as_ref(), 10, queue.as_deref(), Duration::from_secs(55))
                .await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "processed": result.processed,
                "successful": result.successful,
                "failed": result.failed,
                "execution_time_ms": result.execution_time.as_millis() as u64,
            }))?);
        }
        Command::Batch { size, queue, budget } => {
            let worker = BatchWorker::new();
            let result = worker
                .run_batch(driver.as_ref(), size, queue.as_deref(), Duration::from_secs(budget))
                .await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "processed": result.processed,
                "successful": result.successful,
                "failed": result.failed,
                "execution_time_ms": result.execution_time.as_millis() as u64,
            }))?);
        }
        Command::Stats { queue } => {
            let stats = driver.stats(queue.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::FailedList { limit, offset } => {
            let failed = driver.get_failed_jobs(limit, offset).await?;
            println!("{}", serde_json::to_string_pretty(&failed)?);
        }
        Command::FailedRetry { id } => {
            let retried = driver.retry_failed_job(id).await?;
            if !retried {
                anyhow::bail!("no failed job with id {id}");
            }
            println!("retried job {id}");
        }
        Command::FailedRetryAll { queue } => {
            let count = driver.retry_all_failed_jobs(queue.as_deref()).await?;
            println!("retried {count} jobs");
        }
        Command::PurgeOld { days } => {
            let count = driver.purge_old_jobs(days).await?;
            println!("purged {count} rows");
        }
        Command::PurgeFailed { queue } => {
            let count = driver.purge_failed_jobs(queue.as_deref()).await?;
            println!("purged {count} rows");
        }
    }

    Ok(())
}
