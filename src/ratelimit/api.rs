//! The resource categories that can be rate limited.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::bucket::RefillMode;
use crate::profile::TenantProfileSettings;

/// Reads one limit's configuration string out of a tenant profile.
pub type ConfigExtractor = fn(&TenantProfileSettings) -> Option<&str>;

/// A rate-limited resource category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitedApi {
    RestRequestsPerTenant,
    RestRequestsPerCustomer,
    WsUpdatesPerSession,
    CassandraQueries,
    TransportMessagesPerTenant,
    TransportMessagesPerDevice,
    EdgeEvents,
    EdgeEventsPerEdge,
    EdgeUplinkMessages,
    EdgeUplinkMessagesPerEdge,
    NotificationRequests,
    NotificationRequestsPerRule,
    EntityExport,
    EntityImport,
    PasswordReset,
    TwoFaVerificationCodeSend,
    TwoFaVerificationCodeCheck,
}

impl LimitedApi {
    pub const ALL: [LimitedApi; 17] = [
        LimitedApi::RestRequestsPerTenant,
        LimitedApi::RestRequestsPerCustomer,
        LimitedApi::WsUpdatesPerSession,
        LimitedApi::CassandraQueries,
        LimitedApi::TransportMessagesPerTenant,
        LimitedApi::TransportMessagesPerDevice,
        LimitedApi::EdgeEvents,
        LimitedApi::EdgeEventsPerEdge,
        LimitedApi::EdgeUplinkMessages,
        LimitedApi::EdgeUplinkMessagesPerEdge,
        LimitedApi::NotificationRequests,
        LimitedApi::NotificationRequestsPerRule,
        LimitedApi::EntityExport,
        LimitedApi::EntityImport,
        LimitedApi::PasswordReset,
        LimitedApi::TwoFaVerificationCodeSend,
        LimitedApi::TwoFaVerificationCodeCheck,
    ];

    /// The function that reads this limit from a tenant profile.
    pub fn config_extractor(&self) -> ConfigExtractor {
        match self {
            Self::RestRequestsPerTenant => |s| s.tenant_server_rest_limits.as_deref(),
            Self::RestRequestsPerCustomer => |s| s.customer_server_rest_limits.as_deref(),
            Self::WsUpdatesPerSession => |s| s.ws_updates_per_session_rate_limit.as_deref(),
            Self::CassandraQueries => |s| s.cassandra_query_tenant_rate_limits.as_deref(),
            Self::TransportMessagesPerTenant => |s| s.transport_tenant_msg_rate_limit.as_deref(),
            Self::TransportMessagesPerDevice => |s| s.transport_device_msg_rate_limit.as_deref(),
            Self::EdgeEvents => |s| s.edge_event_rate_limits.as_deref(),
            Self::EdgeEventsPerEdge => |s| s.edge_event_rate_limits_per_edge.as_deref(),
            Self::EdgeUplinkMessages => |s| s.edge_uplink_messages_rate_limits.as_deref(),
            Self::EdgeUplinkMessagesPerEdge => {
                |s| s.edge_uplink_messages_rate_limits_per_edge.as_deref()
            }
            Self::NotificationRequests => {
                |s| s.tenant_notification_requests_rate_limit.as_deref()
            }
            Self::NotificationRequestsPerRule => {
                |s| s.tenant_notification_requests_per_rule_rate_limit.as_deref()
            }
            Self::EntityExport => |s| s.tenant_entity_export_rate_limit.as_deref(),
            Self::EntityImport => |s| s.tenant_entity_import_rate_limit.as_deref(),
            Self::PasswordReset => |s| s.password_reset_rate_limit.as_deref(),
            Self::TwoFaVerificationCodeSend => {
                |s| s.two_fa_verification_code_send_rate_limit.as_deref()
            }
            Self::TwoFaVerificationCodeCheck => {
                |s| s.two_fa_verification_code_check_rate_limit.as_deref()
            }
        }
    }

    /// This limit's configuration in `settings`, if it is set and non-empty.
    pub fn limit_config<'a>(&self, settings: &'a TenantProfileSettings) -> Option<&'a str> {
        (self.config_extractor())(settings).filter(|config| !config.is_empty())
    }

    /// Security limits hand out their whole budget once per window; the
    /// rest trickle tokens back continuously.
    pub fn refill_mode(&self) -> RefillMode {
        match self {
            Self::PasswordReset
            | Self::TwoFaVerificationCodeSend
            | Self::TwoFaVerificationCodeCheck => RefillMode::Interval,
            _ => RefillMode::Greedy,
        }
    }

    /// Whether the limit is shared by the whole tenant rather than kept per
    /// customer, device, session, edge or rule.
    pub fn is_per_tenant(&self) -> bool {
        matches!(
            self,
            Self::RestRequestsPerTenant
                | Self::CassandraQueries
                | Self::TransportMessagesPerTenant
                | Self::EdgeEvents
                | Self::EdgeUplinkMessages
                | Self::NotificationRequests
                | Self::EntityExport
                | Self::EntityImport
        )
    }

    /// The upper snake case name, as used in configuration files.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RestRequestsPerTenant => "REST_REQUESTS_PER_TENANT",
            Self::RestRequestsPerCustomer => "REST_REQUESTS_PER_CUSTOMER",
            Self::WsUpdatesPerSession => "WS_UPDATES_PER_SESSION",
            Self::CassandraQueries => "CASSANDRA_QUERIES",
            Self::TransportMessagesPerTenant => "TRANSPORT_MESSAGES_PER_TENANT",
            Self::TransportMessagesPerDevice => "TRANSPORT_MESSAGES_PER_DEVICE",
            Self::EdgeEvents => "EDGE_EVENTS",
            Self::EdgeEventsPerEdge => "EDGE_EVENTS_PER_EDGE",
            Self::EdgeUplinkMessages => "EDGE_UPLINK_MESSAGES",
            Self::EdgeUplinkMessagesPerEdge => "EDGE_UPLINK_MESSAGES_PER_EDGE",
            Self::NotificationRequests => "NOTIFICATION_REQUESTS",
            Self::NotificationRequestsPerRule => "NOTIFICATION_REQUESTS_PER_RULE",
            Self::EntityExport => "ENTITY_EXPORT",
            Self::EntityImport => "ENTITY_IMPORT",
            Self::PasswordReset => "PASSWORD_RESET",
            Self::TwoFaVerificationCodeSend => "TWO_FA_VERIFICATION_CODE_SEND",
            Self::TwoFaVerificationCodeCheck => "TWO_FA_VERIFICATION_CODE_CHECK",
        }
    }

    /// Human readable name used in logs and notifications.
    pub fn label(&self) -> &'static str {
        match self {
            Self::RestRequestsPerTenant => "REST API requests",
            Self::RestRequestsPerCustomer => "REST API requests per customer",
            Self::WsUpdatesPerSession => "WS updates per session",
            Self::CassandraQueries => "Cassandra queries",
            Self::TransportMessagesPerTenant => "Transport messages",
            Self::TransportMessagesPerDevice => "Transport messages per device",
            Self::EdgeEvents => "Edge events",
            Self::EdgeEventsPerEdge => "Edge events per edge",
            Self::EdgeUplinkMessages => "Edge uplink messages",
            Self::EdgeUplinkMessagesPerEdge => "Edge uplink messages per edge",
            Self::NotificationRequests => "Notification requests",
            Self::NotificationRequestsPerRule => "Notification requests per rule",
            Self::EntityExport => "Entity version creation",
            Self::EntityImport => "Entity version load",
            Self::PasswordReset => "Password reset",
            Self::TwoFaVerificationCodeSend => "2FA verification code send",
            Self::TwoFaVerificationCodeCheck => "2FA verification code check",
        }
    }
}

impl fmt::Display for LimitedApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for LimitedApi {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LimitedApi::ALL
            .iter()
            .copied()
            .find(|api| api.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown rate limited api '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extractors_read_their_own_field() {
        let settings = TenantProfileSettings {
            tenant_server_rest_limits: Some("1:1".to_string()),
            customer_server_rest_limits: Some("2:1".to_string()),
            password_reset_rate_limit: Some("3:60".to_string()),
            ..Default::default()
        };

        assert_eq!(
            LimitedApi::RestRequestsPerTenant.limit_config(&settings),
            Some("1:1")
        );
        assert_eq!(
            LimitedApi::RestRequestsPerCustomer.limit_config(&settings),
            Some("2:1")
        );
        assert_eq!(LimitedApi::PasswordReset.limit_config(&settings), Some("3:60"));
        assert_eq!(LimitedApi::CassandraQueries.limit_config(&settings), None);
    }

    #[test]
    fn test_empty_config_is_unset() {
        let settings = TenantProfileSettings {
            edge_event_rate_limits: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(LimitedApi::EdgeEvents.limit_config(&settings), None);
    }

    #[test]
    fn test_every_api_reads_a_distinct_field() {
        // Give every field a unique value and check each api finds one.
        let settings = TenantProfileSettings {
            tenant_server_rest_limits: Some("1:1".into()),
            customer_server_rest_limits: Some("2:1".into()),
            ws_updates_per_session_rate_limit: Some("3:1".into()),
            cassandra_query_tenant_rate_limits: Some("4:1".into()),
            transport_tenant_msg_rate_limit: Some("5:1".into()),
            transport_device_msg_rate_limit: Some("6:1".into()),
            edge_event_rate_limits: Some("7:1".into()),
            edge_event_rate_limits_per_edge: Some("8:1".into()),
            edge_uplink_messages_rate_limits: Some("9:1".into()),
            edge_uplink_messages_rate_limits_per_edge: Some("10:1".into()),
            tenant_notification_requests_rate_limit: Some("11:1".into()),
            tenant_notification_requests_per_rule_rate_limit: Some("12:1".into()),
            tenant_entity_export_rate_limit: Some("13:1".into()),
            tenant_entity_import_rate_limit: Some("14:1".into()),
            password_reset_rate_limit: Some("15:1".into()),
            two_fa_verification_code_send_rate_limit: Some("16:1".into()),
            two_fa_verification_code_check_rate_limit: Some("17:1".into()),
        };

        let mut seen: Vec<&str> = LimitedApi::ALL
            .iter()
            .map(|api| api.limit_config(&settings).unwrap())
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), LimitedApi::ALL.len());
    }

    #[test]
    fn test_refill_modes() {
        assert_eq!(LimitedApi::PasswordReset.refill_mode(), RefillMode::Interval);
        assert_eq!(
            LimitedApi::RestRequestsPerTenant.refill_mode(),
            RefillMode::Greedy
        );
    }

    #[test]
    fn test_per_tenant_flag() {
        assert!(LimitedApi::RestRequestsPerTenant.is_per_tenant());
        assert!(!LimitedApi::RestRequestsPerCustomer.is_per_tenant());
        assert!(!LimitedApi::WsUpdatesPerSession.is_per_tenant());
    }

    #[test]
    fn test_serde_names_match_name() {
        for api in LimitedApi::ALL {
            let yaml = serde_yaml::to_string(&api).unwrap();
            assert_eq!(yaml.trim(), api.name());
        }
    }

    #[test]
    fn test_from_str() {
        assert_eq!(
            "WS_UPDATES_PER_SESSION".parse::<LimitedApi>().unwrap(),
            LimitedApi::WsUpdatesPerSession
        );
        assert_eq!(
            "password_reset".parse::<LimitedApi>().unwrap(),
            LimitedApi::PasswordReset
        );
        assert!("NOPE".parse::<LimitedApi>().is_err());
    }
}
