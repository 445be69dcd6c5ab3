//! Selkie Discovery
//!
//! Consul-backed service registry for selkie clusters.
//!
//! Registers the local coordinator instance with the Consul catalog,
//! discovers the healthy members of named clusters, and keeps that view
//! fresh with blocking (long-poll) health queries. One background notifier
//! task watches each subscribed cluster and fans membership changes out to
//! listeners; a heartbeat loop re-issues registrations so the catalog's
//! liveness record never lapses.
//!
//! # Overview
//!
//! - [`ConsulRegistry`] - the public facade: register, subscribe, lookup
//! - [`CatalogClient`] - pluggable catalog transport ([`ConsulCatalog`] in
//!   production, [`MockCatalog`] in tests)
//! - [`MembershipListener`] - observer of cluster membership changes

pub mod cache;
pub mod catalog;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod heartbeat;
pub mod listener;
pub mod notifier;
pub mod registry;

pub use cache::ClusterAddressCache;
pub use catalog::{CatalogClient, ConsulCatalog, HealthSnapshot, MockCatalog};
pub use config::{DiscoveryConfig, HealthCheckConfig};
pub use endpoint::Endpoint;
pub use error::{DiscoveryError, DiscoveryResult};
pub use listener::{FnListener, ListenerRegistry, MembershipListener};
pub use registry::ConsulRegistry;
