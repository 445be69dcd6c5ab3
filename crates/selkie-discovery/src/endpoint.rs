//! Endpoint value type and its catalog wire form
//!
//! TigerStyle: Validated value type, stable catalog record ids.

use crate::error::{DiscoveryError, DiscoveryResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum host length in bytes (DNS name limit)
pub const ENDPOINT_HOST_LENGTH_BYTES_MAX: usize = 253;

/// A peer service address: host and port.
///
/// Immutable value type; equality is by `(host, port)`. The wire form used
/// by the catalog (health check target, record ids) is `host:port`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create a new Endpoint with validation
    ///
    /// # Errors
    /// Returns `InvalidAddress` if the host is empty, too long, or contains
    /// whitespace, or if the port is 0.
    pub fn new(host: impl Into<String>, port: u16) -> DiscoveryResult<Self> {
        let host = host.into();

        if host.is_empty() {
            return Err(DiscoveryError::invalid_address(
                format!(":{port}"),
                "host cannot be empty",
            ));
        }

        if host.len() > ENDPOINT_HOST_LENGTH_BYTES_MAX {
            return Err(DiscoveryError::invalid_address(
                &host,
                format!(
                    "host length {} exceeds limit {}",
                    host.len(),
                    ENDPOINT_HOST_LENGTH_BYTES_MAX
                ),
            ));
        }

        if host.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(DiscoveryError::invalid_address(
                &host,
                "host contains invalid characters",
            ));
        }

        if port == 0 {
            return Err(DiscoveryError::invalid_address(&host, "port cannot be 0"));
        }

        Ok(Self { host, port })
    }

    /// Get the host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Catalog record id for this endpoint within a cluster.
    ///
    /// Stable across process restarts for the same endpoint, so that
    /// re-registration replaces the existing record instead of duplicating it.
    pub fn service_id(&self, cluster: &str) -> String {
        format!("{cluster}-{self}")
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = DiscoveryError;

    /// Parse the `host:port` wire form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| DiscoveryError::invalid_address(s, "expected host:port"))?;

        let port: u16 = port
            .parse()
            .map_err(|_| DiscoveryError::invalid_address(s, "port must be in 1..=65535"))?;

        Self::new(host, port)
    }
}
