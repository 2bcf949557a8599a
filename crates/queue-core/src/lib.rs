//! # queue-core
//!
//! Shared contracts for the durable job queue engine: the [`Clock`]
//! abstraction, the [`retry`] delay formulas, the [`JobRecord`] data shape
//! and its state machine, the [`QueueDriver`] contract every backend
//! implements, and the [`Executor`]/[`JobResolver`] pair that turns a
//! record into a handler invocation.
//!
//! This crate has no storage backend of its own — see `queue-memory`,
//! `queue-postgres`, and `queue-sqlite` for concrete drivers, and
//! `queue-worker` for the batch loop that drives them.

pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod logger;
pub mod record;
pub mod resolver;
pub mod retry;

pub use clock::{Clock, RandSource, SystemClock, ThreadRand};
pub use config::{BatchConfig, QueueConfig};
pub use driver::{EnqueueOptions, ProcessOutcome, QueueDriver, QueueStats};
pub use error::{QueueError, QueueResult};
pub use logger::{InMemoryLogger, NullLogger, QueueLogger};
pub use record::{FailedJobRecord, JobLog, JobRecord, JobStatus, RetryEvent};
pub use resolver::{Executor, ExecutionOutcome, JobHandler, JobResolver, StaticResolver};
pub use retry::BackoffStrategy;
