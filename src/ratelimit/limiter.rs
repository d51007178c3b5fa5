//! Multi-tier token bucket limiter.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::bucket::{RefillMode, TokenBucket};
use super::clock::{Clock, SystemClock};
use super::rules::{self, RateLimitEntry};
use crate::error::Result;

/// A synchronous, non-blocking limiter over one or more tiers.
///
/// Every tier must hold enough tokens for a request to be admitted, and an
/// admitted request is charged against all of them. The check and the
/// deduction happen under one lock, so concurrent callers never share out
/// more than the buckets hold.
pub struct TokenBucketLimiter {
    /// The configuration exactly as it was given
    configuration: String,
    entries: Vec<RateLimitEntry>,
    mode: RefillMode,
    clock: Arc<dyn Clock>,
    buckets: Mutex<Vec<TokenBucket>>,
}

impl TokenBucketLimiter {
    /// Create a limiter from a configuration string such as `"10:1,300:60"`.
    ///
    /// `interval_refill` selects interval refill; otherwise refill is greedy.
    pub fn new(configuration: &str, interval_refill: bool) -> Result<Self> {
        Self::with_clock(
            configuration,
            RefillMode::from_interval_flag(interval_refill),
            Arc::new(SystemClock),
        )
    }

    /// Create a limiter that reads time from `clock`.
    pub fn with_clock(
        configuration: &str,
        mode: RefillMode,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let entries = rules::parse_limits(configuration)?;
        let now = clock.now();
        let buckets = entries
            .iter()
            .map(|entry| TokenBucket::new(*entry, mode, now))
            .collect();

        debug!(
            configuration = %configuration,
            tiers = entries.len(),
            mode = ?mode,
            "Creating token bucket limiter"
        );

        Ok(Self {
            configuration: configuration.to_string(),
            entries,
            mode,
            clock,
            buckets: Mutex::new(buckets),
        })
    }

    /// Try to take a single token.
    pub fn try_consume(&self) -> bool {
        self.try_consume_n(1)
    }

    /// Try to take `tokens` from every tier at once.
    ///
    /// Either every tier is charged or none is.
    ///
    /// # Panics
    ///
    /// Panics if `tokens` is zero.
    pub fn try_consume_n(&self, tokens: u64) -> bool {
        assert!(tokens > 0, "token count must be positive");

        let now = self.clock.now();
        let mut buckets = self.buckets.lock();

        for bucket in buckets.iter_mut() {
            bucket.refill(now);
        }

        if let Some(tier) = buckets.iter().position(|b| b.available() < tokens) {
            trace!(
                configuration = %self.configuration,
                tokens = tokens,
                tier = %self.entries[tier],
                "Tier exhausted"
            );
            return false;
        }

        for bucket in buckets.iter_mut() {
            bucket.consume(tokens);
        }
        true
    }

    /// The configuration string this limiter was built from.
    pub fn configuration(&self) -> &str {
        &self.configuration
    }

    /// The parsed tiers, in configuration order.
    pub fn entries(&self) -> &[RateLimitEntry] {
        &self.entries
    }

    pub fn refill_mode(&self) -> RefillMode {
        self.mode
    }

    /// Whole tokens available right now in each tier.
    pub fn available_tokens(&self) -> Vec<u64> {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock();
        buckets
            .iter_mut()
            .map(|bucket| {
                bucket.refill(now);
                bucket.available()
            })
            .collect()
    }
}

impl fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("configuration", &self.configuration)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
