//! Discovery configuration
//!
//! Read once at startup; the registry never re-reads configuration
//! dynamically.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default TCP health check interval in seconds
pub const CHECK_INTERVAL_SECS_DEFAULT: u64 = 10;

/// Default TCP health check timeout in seconds
pub const CHECK_TIMEOUT_SECS_DEFAULT: u64 = 1;

/// Default "deregister after this long critical" policy in seconds
pub const CHECK_DEREGISTER_AFTER_SECS_DEFAULT: u64 = 20;

/// Default server-side watch (long-poll) timeout in seconds
pub const WATCH_TIMEOUT_SECS_DEFAULT: u64 = 60;

/// Default heartbeat re-registration period in seconds
pub const HEARTBEAT_PERIOD_SECS_DEFAULT: u64 = 60;

/// Cluster name used when none is configured
pub const CLUSTER_NAME_DEFAULT: &str = "default";

/// TCP health check parameters advertised to the catalog at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Interval between catalog-side TCP probes in seconds
    pub interval_secs: u64,
    /// Probe timeout in seconds
    pub timeout_secs: u64,
    /// Deregister the record after this long in critical state, in seconds
    pub deregister_after_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: CHECK_INTERVAL_SECS_DEFAULT,
            timeout_secs: CHECK_TIMEOUT_SECS_DEFAULT,
            deregister_after_secs: CHECK_DEREGISTER_AFTER_SECS_DEFAULT,
        }
    }
}

/// Configuration for the Consul-backed registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Catalog (Consul agent) HTTP address, e.g. `http://127.0.0.1:8500`
    pub catalog_addr: String,
    /// Cluster this process registers under and resolves its own peers from
    pub cluster: String,
    /// Optional ACL token sent with every catalog call
    pub acl_token: Option<String>,
    /// Lookup key (transaction service group) to cluster name mapping
    pub service_groups: HashMap<String, String>,
    /// Health check parameters attached to registrations
    pub health_check: HealthCheckConfig,
    /// Server-side watch timeout for long-poll health queries, in seconds
    pub watch_timeout_secs: u64,
    /// Period between heartbeat re-registrations, in seconds
    pub heartbeat_period_secs: u64,
}

impl DiscoveryConfig {
    /// Create a configuration with defaults for everything but the catalog
    /// address.
    pub fn new(catalog_addr: impl Into<String>) -> Self {
        Self {
            catalog_addr: catalog_addr.into(),
            cluster: CLUSTER_NAME_DEFAULT.to_string(),
            acl_token: None,
            service_groups: HashMap::new(),
            health_check: HealthCheckConfig::default(),
            watch_timeout_secs: WATCH_TIMEOUT_SECS_DEFAULT,
            heartbeat_period_secs: HEARTBEAT_PERIOD_SECS_DEFAULT,
        }
    }

    /// Resolve a lookup key to its cluster name, if mapped.
    pub fn service_group(&self, key: &str) -> Option<&str> {
        self.service_groups.get(key).map(String::as_str)
    }

    /// Create config for testing with short timeouts
    #[cfg(test)]
    pub fn for_testing() -> Self {
        let mut config = Self::new("http://127.0.0.1:8500");
        config.watch_timeout_secs = 1;
        config.heartbeat_period_secs = 1;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = DiscoveryConfig::new("http://127.0.0.1:8500");
        assert_eq!(config.cluster, CLUSTER_NAME_DEFAULT);
        assert_eq!(config.acl_token, None);
        assert_eq!(config.watch_timeout_secs, WATCH_TIMEOUT_SECS_DEFAULT);
        assert_eq!(config.health_check.interval_secs, CHECK_INTERVAL_SECS_DEFAULT);
        assert_eq!(config.health_check.timeout_secs, CHECK_TIMEOUT_SECS_DEFAULT);
        assert_eq!(
            config.health_check.deregister_after_secs,
            CHECK_DEREGISTER_AFTER_SECS_DEFAULT
        );
    }

    #[test]
    fn test_service_group_mapping() {
        let mut config = DiscoveryConfig::new("http://127.0.0.1:8500");
        config
            .service_groups
            .insert("my_tx_group".to_string(), "cluster-a".to_string());

        assert_eq!(config.service_group("my_tx_group"), Some("cluster-a"));
        assert_eq!(config.service_group("unmapped"), None);
    }
}
