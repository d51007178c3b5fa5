//! Tenant identities and the profile settings rate limits are read from.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a tenant.
///
/// The nil UUID is the system tenant, which is never rate limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub const SYSTEM: TenantId = TenantId(Uuid::nil());

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_system(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a customer within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CustomerId(pub Uuid);

impl CustomerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CustomerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rate limit configuration strings from a tenant profile.
///
/// Every field is a `capacity:duration,...` string; `None` or an empty
/// string disables that limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantProfileSettings {
    pub tenant_server_rest_limits: Option<String>,
    pub customer_server_rest_limits: Option<String>,
    pub ws_updates_per_session_rate_limit: Option<String>,
    pub cassandra_query_tenant_rate_limits: Option<String>,
    pub transport_tenant_msg_rate_limit: Option<String>,
    pub transport_device_msg_rate_limit: Option<String>,
    pub edge_event_rate_limits: Option<String>,
    pub edge_event_rate_limits_per_edge: Option<String>,
    pub edge_uplink_messages_rate_limits: Option<String>,
    pub edge_uplink_messages_rate_limits_per_edge: Option<String>,
    pub tenant_notification_requests_rate_limit: Option<String>,
    pub tenant_notification_requests_per_rule_rate_limit: Option<String>,
    pub tenant_entity_export_rate_limit: Option<String>,
    pub tenant_entity_import_rate_limit: Option<String>,
    pub password_reset_rate_limit: Option<String>,
    pub two_fa_verification_code_send_rate_limit: Option<String>,
    pub two_fa_verification_code_check_rate_limit: Option<String>,
}

/// Looks up the profile settings that apply to a tenant.
pub trait ProfileProvider: Send + Sync {
    fn profile(&self, tenant: TenantId) -> Option<Arc<TenantProfileSettings>>;
}

/// A [`ProfileProvider`] backed by an in-memory map.
///
/// Tenants without their own entry fall back to the default profile, if one
/// is set.
#[derive(Debug, Default)]
pub struct InMemoryProfileProvider {
    profiles: DashMap<TenantId, Arc<TenantProfileSettings>>,
    default_profile: Option<Arc<TenantProfileSettings>>,
}

impl InMemoryProfileProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider that answers every tenant with `settings` unless overridden.
    pub fn with_default(settings: TenantProfileSettings) -> Self {
        Self {
            profiles: DashMap::new(),
            default_profile: Some(Arc::new(settings)),
        }
    }

    /// Set or replace a tenant's settings.
    pub fn set(&self, tenant: TenantId, settings: TenantProfileSettings) {
        self.profiles.insert(tenant, Arc::new(settings));
    }

    pub fn remove(&self, tenant: TenantId) {
        self.profiles.remove(&tenant);
    }
}

impl ProfileProvider for InMemoryProfileProvider {
    fn profile(&self, tenant: TenantId) -> Option<Arc<TenantProfileSettings>> {
        self.profiles
            .get(&tenant)
            .map(|entry| Arc::clone(entry.value()))
            .or_else(|| self.default_profile.clone())
    }
}
