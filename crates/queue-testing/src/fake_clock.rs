use chrono::{DateTime, Duration, Utc};
use queue_core::Clock;
use std::sync::Mutex;
use std::time::Instant;

/// A deterministic [`Clock`] for tests: `now_utc` starts at construction
/// time (or an explicit instant) and only moves forward when `advance` is
/// called.
pub struct FakeClock {
    wall: Mutex<DateTime<Utc>>,
    started_monotonic: Instant,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            wall: Mutex::new(start),
            started_monotonic: Instant::now(),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, duration: Duration) {
        let mut wall = self.wall.lock().expect("fake clock mutex poisoned");
        *wall += duration;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.wall.lock().expect("fake clock mutex poisoned") = at;
    }
}

impl Clock for FakeClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.wall.lock().expect("fake clock mutex poisoned")
    }

    fn monotonic(&self) -> Instant {
        self.started_monotonic
    }
}
