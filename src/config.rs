//! Configuration management for Floodgate.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::profile::TenantProfileSettings;
use crate::ratelimit::BufferedAsyncLimiter;

/// Prefix of environment variables that override file settings,
/// e.g. `FLOODGATE_BUFFERED__MAX_PERMITS=32`.
const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for Floodgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Registry configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Defaults for buffered limiters
    #[serde(default)]
    pub buffered: BufferedConfig,

    /// Profile applied to tenants without their own settings
    #[serde(default)]
    pub default_profile: TenantProfileSettings,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of plain text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Admit tenants that have no profile instead of failing
    #[serde(default)]
    pub ignore_missing_profiles: bool,

    /// Drop limiters unused for this many seconds (0 keeps them forever).
    /// Applied by `RateLimitRegistry::evict_idle`, or periodically by
    /// `RateLimitRegistry::spawn_evictor`.
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ignore_missing_profiles: false,
            idle_ttl_secs: default_idle_ttl(),
        }
    }
}

fn default_idle_ttl() -> u64 {
    3600
}

/// Buffered limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedConfig {
    /// Permits handed out concurrently
    #[serde(default = "default_max_permits")]
    pub max_permits: usize,

    /// Requests allowed to wait for a permit
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,

    /// Queue timeout in milliseconds (0 waits forever)
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_ms: u64,
}

impl Default for BufferedConfig {
    fn default() -> Self {
        Self {
            max_permits: default_max_permits(),
            max_queue_depth: default_max_queue_depth(),
            queue_timeout_ms: default_queue_timeout(),
        }
    }
}

impl BufferedConfig {
    /// Build a limiter with these settings.
    pub fn build(&self) -> BufferedAsyncLimiter {
        BufferedAsyncLimiter::new(self.max_permits, self.max_queue_depth, self.queue_timeout_ms)
    }
}

fn default_max_permits() -> usize {
    100
}

fn default_max_queue_depth() -> usize {
    1000
}

fn default_queue_timeout() -> u64 {
    30_000
}

impl FloodgateConfig {
    /// Load configuration from a file, with `FLOODGATE_*` environment
    /// variables layered on top.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        if !path.exists() {
            return Err(FloodgateError::Config(format!(
                "configuration file {} not found",
                path.display()
            )));
        }

        let config = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(environment())
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Defaults with `FLOODGATE_*` environment variables layered on top.
    pub fn from_env() -> Result<Self> {
        let config = ::config::Config::builder().add_source(environment()).build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse configuration: {}", e)))
    }
}

fn environment() -> ::config::Environment {
    ::config::Environment::with_prefix(ENV_PREFIX)
        .try_parsing(true)
        .prefix_separator("_")
        .separator("__")
}
