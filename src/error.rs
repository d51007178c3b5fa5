//! Error types for Floodgate.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::profile::TenantId;

/// Why a rate limit configuration string was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigErrorReason {
    /// The string was empty where at least one tier is required.
    Empty,
    /// A segment was not of the form `capacity:duration`.
    MalformedPair,
    /// A capacity or duration was not an integer.
    NonNumericField,
    /// A capacity or duration was zero.
    NonPositiveField,
    /// A tier's capacity and duration together are too large to track.
    FieldOutOfRange,
}

impl ConfigErrorReason {
    /// Returns a static string label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::MalformedPair => "malformed_pair",
            Self::NonNumericField => "non_numeric_field",
            Self::NonPositiveField => "non_positive_field",
            Self::FieldOutOfRange => "field_out_of_range",
        }
    }
}

impl fmt::Display for ConfigErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// A rate limit configuration string could not be parsed
    #[error("Failed to parse rate limits configuration '{config}': {reason}")]
    InvalidRateLimitConfig {
        config: String,
        reason: ConfigErrorReason,
    },

    /// Both the permit pool and the wait queue are exhausted
    #[error("Buffer full: {max_permits} permits in use and {max_queue} requests queued")]
    BufferFull { max_permits: usize, max_queue: usize },

    /// A queued request was not serviced in time
    #[error("Timed out waiting for a permit after {timeout:?}")]
    AcquireTimeout { timeout: Duration },

    /// A queued request was cancelled before it was serviced
    #[error("Permit request cancelled")]
    AcquireCancelled,

    /// No profile settings are known for the tenant
    #[error("Tenant profile not found for tenant {0}")]
    TenantProfileNotFound(TenantId),

    /// Service configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FloodgateError {
    pub(crate) fn invalid_config(config: &str, reason: ConfigErrorReason) -> Self {
        Self::InvalidRateLimitConfig {
            config: config.to_string(),
            reason,
        }
    }

    /// The config parse failure reason, if this is a configuration error.
    pub fn config_reason(&self) -> Option<ConfigErrorReason> {
        match self {
            Self::InvalidRateLimitConfig { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Whether this error is an admission rejection rather than a setup error.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::BufferFull { .. } | Self::AcquireTimeout { .. } | Self::AcquireCancelled
        )
    }
}

impl From<::config::ConfigError> for FloodgateError {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
