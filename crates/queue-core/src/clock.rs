//! Time source abstraction.
//!
//! All scheduling math in this crate goes through a [`Clock`] rather than
//! calling `Utc::now()` or `Instant::now()` directly, so tests can inject a
//! deterministic time source. See `queue-testing::FakeClock` for the test
//! double.

use chrono::{DateTime, Utc};
use std::time::Instant;

/// A source of wall-clock and monotonic time.
///
/// Wall time is used for persisted timestamps (`available_at`, `reserved_at`,
/// `created_at`, ...); monotonic time is used only for measuring elapsed
/// durations (e.g. the batch worker's wall-clock budget) and is never
/// persisted.
pub trait Clock: Send + Sync {
    /// Current wall-clock time, UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// A monotonic instant suitable for measuring elapsed durations.
    fn monotonic(&self) -> Instant;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// A source of uniform randomness in `[0, 1)`, used for jitter.
///
/// Split out from [`Clock`] because jitter is not a time concern, but tests
/// that want deterministic retry delays need to control both.
pub trait RandSource: Send + Sync {
    fn uniform(&self) -> f64;
}

/// Jitter backed by `fastrand`'s thread-local generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRand;

impl RandSource for ThreadRand {
    fn uniform(&self) -> f64 {
        fastrand::f64()
    }
}
