//! Monotonic time sources for the limiters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::{Interval, MissedTickBehavior};

/// Background maintenance tasks never tick faster than this.
pub(crate) const MIN_MAINTENANCE_PERIOD: Duration = Duration::from_millis(1);

/// A source of monotonic instants.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The process monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can hand one clone to a limiter
/// and advance another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// A ticker for periodic maintenance, `every` raised to at least
/// [`MIN_MAINTENANCE_PERIOD`].
pub(crate) fn maintenance_interval(every: Duration) -> Interval {
    let mut ticker = tokio::time::interval(every.max(MIN_MAINTENANCE_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
