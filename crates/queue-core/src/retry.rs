//! Retry delay computation.
//!
//! `delay_seconds` is a pure, total function: given a strategy, a base delay,
//! and the (1-based) attempt about to be retried, it returns the number of
//! seconds to wait before the job becomes eligible again. It never fails and
//! never reads the clock.

use crate::clock::RandSource;
use serde::{Deserialize, Serialize};

/// Backoff strategy selected at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
    ExponentialJitter,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential
    }
}

const MIN_DELAY_SECONDS: u32 = 1;
const MAX_DELAY_SECONDS: u32 = 86_400;

/// Compute the retry delay, in seconds, for `attempt` (1-based: the attempt
/// that just failed and is about to be retried).
///
/// | strategy | formula |
/// |---|---|
/// | fixed | `base` |
/// | linear | `base * attempt` |
/// | exponential | `base * 2^(attempt-1)` |
/// | exponential_jitter | `exponential * (0.5 + rand[0,1))` |
///
/// All results are clamped to `[1, 86400]` seconds.
pub fn delay_seconds(
    strategy: BackoffStrategy,
    base: u32,
    attempt: u32,
    rand: &dyn RandSource,
) -> u32 {
    let attempt = attempt.max(1);
    let raw: f64 = match strategy {
        BackoffStrategy::Fixed => base as f64,
        BackoffStrategy::Linear => base as f64 * attempt as f64,
        BackoffStrategy::Exponential => exponential(base, attempt),
        BackoffStrategy::ExponentialJitter => {
            exponential(base, attempt) * (0.5 + rand.uniform())
        }
    };
    clamp(raw.round() as i64)
}

fn exponential(base: u32, attempt: u32) -> f64 {
    // attempt is 1-based; exponent is attempt-1 so the first retry uses base * 2^0.
    base as f64 * 2f64.powi((attempt - 1) as i32)
}

fn clamp(seconds: i64) -> u32 {
    seconds.clamp(MIN_DELAY_SECONDS as i64, MAX_DELAY_SECONDS as i64) as u32
}
