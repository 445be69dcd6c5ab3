//! Discovery error types
//!
//! TigerStyle: Explicit error variants with context.

use thiserror::Error;

/// Discovery-specific errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Malformed endpoint, rejected before any network call
    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// No cluster mapping configured for a lookup key
    #[error("no cluster mapping configured for key: {key}")]
    ConfigurationMissing { key: String },

    /// Catalog unreachable or returned a malformed response
    #[error("catalog transport error: {reason}")]
    Transport { reason: String },
}

impl DiscoveryError {
    /// Create an InvalidAddress error
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a ConfigurationMissing error
    pub fn configuration_missing(key: impl Into<String>) -> Self {
        Self::ConfigurationMissing { key: key.into() }
    }

    /// Create a Transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Transient errors are retried inside background loops; everything else
    /// surfaces to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl From<reqwest::Error> for DiscoveryError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            reason: err.to_string(),
        }
    }
}

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
