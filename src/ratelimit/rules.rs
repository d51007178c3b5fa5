//! Rate limit configuration strings.
//!
//! A configuration is a comma separated list of tiers, each written as
//! `capacity:duration_seconds`, for example `"10:1,300:60"` for a burst of
//! 10 per second and a sustained 300 per minute. A request has to satisfy
//! every tier.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigErrorReason, FloodgateError, Result};

const TIER_SEPARATOR: char = ',';
const FIELD_SEPARATOR: char = ':';
const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// One tier of a rate limit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitEntry {
    /// Units allowed per window
    pub capacity: u64,
    /// Window length in seconds
    pub duration_seconds: u64,
}

impl RateLimitEntry {
    pub fn new(capacity: u64, duration_seconds: u64) -> Self {
        Self {
            capacity,
            duration_seconds,
        }
    }

    /// The window length as a `Duration`.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds)
    }

    /// The window length in nanoseconds.
    pub(crate) fn window_nanos(&self) -> u128 {
        u128::from(self.duration_seconds) * NANOS_PER_SECOND
    }

    /// A full greedy bucket's level: `capacity` tokens of `window_nanos`
    /// units each. `None` if that does not fit in a `u128`.
    pub(crate) fn greedy_units(&self) -> Option<u128> {
        u128::from(self.capacity).checked_mul(self.window_nanos())
    }
}

impl fmt::Display for RateLimitEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.capacity, FIELD_SEPARATOR, self.duration_seconds)
    }
}

/// Parse a configuration string into its tiers.
///
/// `None` and the empty string mean "no limiting" and yield no tiers.
pub fn parse_config(raw: Option<&str>) -> Result<Vec<RateLimitEntry>> {
    let raw = match raw {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Ok(Vec::new()),
    };

    raw.split(TIER_SEPARATOR)
        .map(|segment| parse_entry(raw, segment))
        .collect()
}

/// Parse a configuration that must contain at least one tier.
///
/// This is what limiter construction uses: an empty string is an error
/// here rather than "no limiting".
pub fn parse_limits(raw: &str) -> Result<Vec<RateLimitEntry>> {
    let entries = parse_config(Some(raw))?;
    if entries.is_empty() {
        return Err(FloodgateError::invalid_config(raw, ConfigErrorReason::Empty));
    }
    Ok(entries)
}

/// Whether `raw` is a usable, non-empty configuration.
pub fn is_valid(raw: &str) -> bool {
    parse_limits(raw).is_ok()
}

/// Combine two configurations.
///
/// Tiers with the same duration have their capacities summed. The result
/// is sorted by ascending duration.
pub fn merge(first: &str, second: &str) -> Result<String> {
    let mut by_duration: BTreeMap<u64, u64> = BTreeMap::new();

    for raw in [first, second] {
        for entry in parse_config(Some(raw))? {
            let capacity = by_duration.entry(entry.duration_seconds).or_insert(0);
            *capacity = capacity.saturating_add(entry.capacity);
        }
    }

    let merged: Vec<RateLimitEntry> = by_duration
        .into_iter()
        .map(|(duration_seconds, capacity)| RateLimitEntry::new(capacity, duration_seconds))
        .collect();

    let formatted = format_config(&merged);
    if merged.iter().any(|entry| entry.greedy_units().is_none()) {
        return Err(FloodgateError::invalid_config(
            &formatted,
            ConfigErrorReason::FieldOutOfRange,
        ));
    }
    Ok(formatted)
}

/// Serialize tiers back into `capacity:duration,...` form.
pub fn format_config(entries: &[RateLimitEntry]) -> String {
    entries
        .iter()
        .map(RateLimitEntry::to_string)
        .collect::<Vec<_>>()
        .join(&TIER_SEPARATOR.to_string())
}

fn parse_entry(raw: &str, segment: &str) -> Result<RateLimitEntry> {
    let mut fields = segment.split(FIELD_SEPARATOR);
    let (capacity, duration) = match (fields.next(), fields.next(), fields.next()) {
        (Some(capacity), Some(duration), None) => (capacity, duration),
        _ => {
            return Err(FloodgateError::invalid_config(
                raw,
                ConfigErrorReason::MalformedPair,
            ))
        }
    };

    let entry = RateLimitEntry::new(parse_field(raw, capacity)?, parse_field(raw, duration)?);
    if entry.greedy_units().is_none() {
        return Err(FloodgateError::invalid_config(
            raw,
            ConfigErrorReason::FieldOutOfRange,
        ));
    }
    Ok(entry)
}

fn parse_field(raw: &str, field: &str) -> Result<u64> {
    match field.parse::<u64>() {
        Ok(0) => Err(FloodgateError::invalid_config(
            raw,
            ConfigErrorReason::NonPositiveField,
        )),
        Ok(value) => Ok(value),
        // Negative integers are numeric, just not allowed.
        Err(_) if field.parse::<i64>().is_ok() => Err(FloodgateError::invalid_config(
            raw,
            ConfigErrorReason::NonPositiveField,
        )),
        Err(_) => Err(FloodgateError::invalid_config(
            raw,
            ConfigErrorReason::NonNumericField,
        )),
    }
}
