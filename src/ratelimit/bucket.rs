//! Token bucket state for a single tier.

use std::time::{Duration, Instant};

use super::rules::RateLimitEntry;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// How a tier gets its tokens back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefillMode {
    /// Tokens trickle back continuously at `capacity / duration` per second.
    Greedy,
    /// The whole capacity comes back at once when a full window has passed.
    Interval,
}

impl RefillMode {
    /// Map the boolean "refill intervally" flag used by call sites.
    pub fn from_interval_flag(interval_refill: bool) -> Self {
        if interval_refill {
            RefillMode::Interval
        } else {
            RefillMode::Greedy
        }
    }
}

/// Refill state for one tier.
///
/// The level is kept in fixed point so greedy refill never drops fractions:
/// one token is `scale` units, where `scale` is the window length in
/// nanoseconds for greedy tiers and `1` for interval tiers.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    capacity: u64,
    period_nanos: u128,
    mode: RefillMode,
    scale: u128,
    level: u128,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket for `entry`, last refilled at `now`.
    ///
    /// `entry` comes from the parser, which only yields tiers whose full
    /// greedy level fits in a `u128`.
    pub(crate) fn new(entry: RateLimitEntry, mode: RefillMode, now: Instant) -> Self {
        let period_nanos = entry.window_nanos();
        let scale = match mode {
            RefillMode::Greedy => period_nanos,
            RefillMode::Interval => 1,
        };
        Self {
            capacity: entry.capacity,
            period_nanos,
            mode,
            scale,
            level: u128::from(entry.capacity) * scale,
            last_refill: now,
        }
    }

    /// Bring the level up to date with `now`.
    ///
    /// This only restores tokens the elapsed time has already earned, so it
    /// is safe to run whether or not the caller goes on to consume.
    pub(crate) fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_nanos();
        let full = self.full_level();

        match self.mode {
            RefillMode::Greedy => {
                if elapsed == 0 {
                    return;
                }
                // One nanosecond earns `capacity` units of a `period_nanos` token.
                let earned = elapsed.saturating_mul(u128::from(self.capacity));
                self.level = self.level.saturating_add(earned).min(full);
                self.last_refill = now;
            }
            RefillMode::Interval => {
                if elapsed < self.period_nanos {
                    return;
                }
                let windows = elapsed / self.period_nanos;
                self.level = full;
                self.last_refill += nanos_to_duration(windows * self.period_nanos);
            }
        }
    }

    /// Whole tokens available as of the last refill.
    pub(crate) fn available(&self) -> u64 {
        u64::try_from(self.level / self.scale).unwrap_or(u64::MAX)
    }

    /// Remove `tokens`. The caller has checked `available() >= tokens`.
    pub(crate) fn consume(&mut self, tokens: u64) {
        let units = u128::from(tokens) * self.scale;
        debug_assert!(self.level >= units);
        self.level = self.level.saturating_sub(units);
    }

    fn full_level(&self) -> u128 {
        u128::from(self.capacity) * self.scale
    }
}

fn nanos_to_duration(nanos: u128) -> Duration {
    let secs = nanos / NANOS_PER_SECOND;
    let subsec = (nanos % NANOS_PER_SECOND) as u32;
    Duration::new(u64::try_from(secs).unwrap_or(u64::MAX), subsec)
}
