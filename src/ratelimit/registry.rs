//! Per-key limiter registry.
//!
//! Call sites ask the registry whether an operation on an [`LimitedApi`] may
//! proceed for a tenant (or a finer level such as a customer or a session).
//! The registry reads the applicable configuration from the tenant's
//! profile, keeps one [`TokenBucketLimiter`] per `(api, level)` and
//! rebuilds it whenever the configuration string changes.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::api::LimitedApi;
use super::clock::{maintenance_interval, Clock, SystemClock};
use super::limiter::TokenBucketLimiter;
use crate::config::RegistryConfig;
use crate::error::{FloodgateError, Result};
use crate::profile::{CustomerId, ProfileProvider, TenantId};

/// The entity a limit is tracked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LimitLevel {
    Tenant(TenantId),
    Customer(CustomerId),
    /// A device, edge, rule or any other entity
    Entity(Uuid),
    Session(String),
}

impl fmt::Display for LimitLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitLevel::Tenant(id) => write!(f, "tenant:{}", id),
            LimitLevel::Customer(id) => write!(f, "customer:{}", id),
            LimitLevel::Entity(id) => write!(f, "entity:{}", id),
            LimitLevel::Session(id) => write!(f, "session:{}", id),
        }
    }
}

/// Key of one limiter in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub api: LimitedApi,
    pub level: LimitLevel,
}

impl RateLimitKey {
    pub fn new(api: LimitedApi, level: LimitLevel) -> Self {
        Self { api, level }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.api, self.level)
    }
}

/// Told about every rejected request.
pub trait ExceededListener: Send + Sync {
    fn on_rate_limit_exceeded(
        &self,
        api: LimitedApi,
        tenant: Option<TenantId>,
        level: &LimitLevel,
    );
}

struct TrackedLimiter {
    limiter: Arc<TokenBucketLimiter>,
    last_access: Mutex<Instant>,
}

impl TrackedLimiter {
    fn new(limiter: Arc<TokenBucketLimiter>, now: Instant) -> Self {
        Self {
            limiter,
            last_access: Mutex::new(now),
        }
    }

    fn touch(&self, now: Instant) {
        *self.last_access.lock() = now;
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_access.lock())
    }
}

/// Owns the limiter for every `(api, level)` pair in use.
pub struct RateLimitRegistry {
    limiters: DashMap<RateLimitKey, TrackedLimiter>,
    profiles: Arc<dyn ProfileProvider>,
    listener: Option<Arc<dyn ExceededListener>>,
    clock: Arc<dyn Clock>,
    ignore_missing_profiles: bool,
    idle_ttl: Option<Duration>,
}

impl RateLimitRegistry {
    /// Create a registry that reads limits from `profiles`.
    pub fn new(profiles: Arc<dyn ProfileProvider>) -> Self {
        Self {
            limiters: DashMap::new(),
            profiles,
            listener: None,
            clock: Arc::new(SystemClock),
            ignore_missing_profiles: false,
            idle_ttl: None,
        }
    }

    /// Create a registry with options from the service configuration.
    pub fn from_config(config: &RegistryConfig, profiles: Arc<dyn ProfileProvider>) -> Self {
        let registry = Self::new(profiles).ignore_missing_profiles(config.ignore_missing_profiles);
        match config.idle_ttl_secs {
            0 => registry,
            secs => registry.with_idle_ttl(Duration::from_secs(secs)),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ExceededListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Admit requests for tenants without a profile instead of failing.
    pub fn ignore_missing_profiles(mut self, ignore: bool) -> Self {
        self.ignore_missing_profiles = ignore;
        self
    }

    /// Limiters unused for `ttl` are dropped by [`evict_idle`](Self::evict_idle).
    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = Some(ttl);
        self
    }

    /// Check a tenant-wide limit.
    pub fn check_rate_limit(&self, api: LimitedApi, tenant: TenantId) -> Result<bool> {
        self.check_rate_limit_for(api, tenant, LimitLevel::Tenant(tenant))
    }

    /// Check a limit configured in `tenant`'s profile, tracked for `level`.
    ///
    /// The system tenant is always admitted.
    ///
    /// # Errors
    ///
    /// Returns [`FloodgateError::TenantProfileNotFound`] when the tenant has
    /// no profile and missing profiles are not ignored, and
    /// [`FloodgateError::InvalidRateLimitConfig`] when the profile holds an
    /// unparsable configuration.
    pub fn check_rate_limit_for(
        &self,
        api: LimitedApi,
        tenant: TenantId,
        level: LimitLevel,
    ) -> Result<bool> {
        if tenant.is_system() {
            return Ok(true);
        }

        let Some(profile) = self.profiles.profile(tenant) else {
            if self.ignore_missing_profiles {
                trace!(tenant = %tenant, "No tenant profile, admitting");
                return Ok(true);
            }
            return Err(FloodgateError::TenantProfileNotFound(tenant));
        };

        let allowed = self.admit(api, &level, api.limit_config(&profile))?;
        if !allowed {
            self.notify_exceeded(api, Some(tenant), &level);
        }
        Ok(allowed)
    }

    /// Check `level` against an explicitly supplied configuration.
    ///
    /// A missing or empty configuration means "no limit": the request is
    /// admitted and any limiter kept for the key is dropped.
    pub fn check_with_config(
        &self,
        api: LimitedApi,
        level: LimitLevel,
        config: Option<&str>,
    ) -> Result<bool> {
        let allowed = self.admit(api, &level, config)?;
        if !allowed {
            self.notify_exceeded(api, None, &level);
        }
        Ok(allowed)
    }

    /// The limiter currently kept for a key, if any.
    pub fn get(&self, api: LimitedApi, level: &LimitLevel) -> Option<Arc<TokenBucketLimiter>> {
        let key = RateLimitKey::new(api, level.clone());
        self.limiters
            .get(&key)
            .map(|tracked| Arc::clone(&tracked.limiter))
    }

    /// Drop the limiter for one key.
    pub fn remove(&self, api: LimitedApi, level: &LimitLevel) -> bool {
        let key = RateLimitKey::new(api, level.clone());
        self.limiters.remove(&key).is_some()
    }

    /// Drop every limiter tracked for `level`, across all apis.
    pub fn remove_level(&self, level: &LimitLevel) -> usize {
        let before = self.limiters.len();
        self.limiters.retain(|key, _| &key.level != level);
        before.saturating_sub(self.limiters.len())
    }

    /// Drop the limiters that have not been used for the idle TTL.
    ///
    /// Does nothing when no TTL is configured. Returns how many were dropped.
    pub fn evict_idle(&self) -> usize {
        let Some(ttl) = self.idle_ttl else {
            return 0;
        };
        let now = self.clock.now();
        let before = self.limiters.len();
        self.limiters.retain(|_, tracked| tracked.idle_for(now) < ttl);
        let evicted = before.saturating_sub(self.limiters.len());
        if evicted > 0 {
            debug!(evicted = evicted, ttl = ?ttl, "Evicted idle rate limiters");
        }
        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every `every` on the current
    /// tokio runtime. Periods shorter than a millisecond are raised to one.
    ///
    /// The task ends on its own once the registry is dropped.
    pub fn spawn_evictor(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = maintenance_interval(every);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.evict_idle();
            }
        })
    }

    /// Drop every limiter.
    pub fn clear(&self) {
        self.limiters.clear();
    }

    /// Number of limiters currently kept.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    fn admit(&self, api: LimitedApi, level: &LimitLevel, config: Option<&str>) -> Result<bool> {
        let key = RateLimitKey::new(api, level.clone());

        let Some(config) = config.filter(|config| !config.is_empty()) else {
            if self.limiters.remove(&key).is_some() {
                debug!(key = %key, "Limit removed from configuration, dropping limiter");
            }
            return Ok(true);
        };

        let limiter = self.limiter_for(key.clone(), config)?;
        let allowed = limiter.try_consume();
        trace!(key = %key, allowed = allowed, "Checked rate limit");
        Ok(allowed)
    }

    /// The limiter for `key`, built or rebuilt if its configuration changed.
    fn limiter_for(&self, key: RateLimitKey, config: &str) -> Result<Arc<TokenBucketLimiter>> {
        let now = self.clock.now();

        if let Some(tracked) = self.limiters.get(&key) {
            if tracked.limiter.configuration() == config {
                tracked.touch(now);
                return Ok(Arc::clone(&tracked.limiter));
            }
        }

        // A parse failure must leave the map untouched.
        let limiter = Arc::new(TokenBucketLimiter::with_clock(
            config,
            key.api.refill_mode(),
            Arc::clone(&self.clock),
        )?);

        match self.limiters.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().limiter.configuration() == config {
                    // Another caller installed the same configuration first.
                    occupied.get().touch(now);
                    return Ok(Arc::clone(&occupied.get().limiter));
                }
                debug!(
                    key = %occupied.key(),
                    old = %occupied.get().limiter.configuration(),
                    new = %config,
                    "Rate limit configuration changed, replacing limiter"
                );
                occupied.insert(TrackedLimiter::new(Arc::clone(&limiter), now));
            }
            Entry::Vacant(vacant) => {
                debug!(key = %vacant.key(), config = %config, "Creating rate limiter");
                vacant.insert(TrackedLimiter::new(Arc::clone(&limiter), now));
            }
        }
        Ok(limiter)
    }

    fn notify_exceeded(&self, api: LimitedApi, tenant: Option<TenantId>, level: &LimitLevel) {
        warn!(
            api = %api,
            level = %level,
            "Rate limit exceeded"
        );
        if let Some(listener) = &self.listener {
            listener.on_rate_limit_exceeded(api, tenant, level);
        }
    }
}

impl fmt::Debug for RateLimitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitRegistry")
            .field("limiters", &self.limiters.len())
            .field("ignore_missing_profiles", &self.ignore_missing_profiles)
            .field("idle_ttl", &self.idle_ttl)
            .finish_non_exhaustive()
    }
}
