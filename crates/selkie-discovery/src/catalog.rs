//! Catalog client: facade over the Consul agent/health HTTP API
//!
//! Provides a trait-based abstraction over the catalog transport, allowing
//! the real Consul agent in production and a scripted mock in tests.
//!
//! TigerStyle: Explicit trait bounds, explicit error handling.

use crate::config::{DiscoveryConfig, HealthCheckConfig};
use crate::endpoint::Endpoint;
use crate::error::{DiscoveryError, DiscoveryResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tag attached to every registration and used to filter health queries
pub const SERVICE_TAG: &str = "services";

/// Connect timeout for catalog calls in seconds
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default request timeout in seconds, bounding every catalog call that is
/// not a blocking query
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Client-side grace on top of the server-side wait. Consul may hold a
/// blocking query slightly past the requested wait.
const WAIT_GRACE_SECS: u64 = 10;

/// Result of a health query: the full current membership plus the catalog
/// version it was observed at.
///
/// The catalog always returns the whole healthy set, never a diff; callers
/// replace their view wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Healthy members of the queried cluster
    pub endpoints: Vec<Endpoint>,
    /// Catalog index the snapshot was taken at. `None` when the catalog
    /// omitted it: the version is unknown and must not advance the watcher.
    pub version: Option<u64>,
}

// =============================================================================
// CatalogClient Trait
// =============================================================================

/// Facade over the external catalog.
///
/// The core never speaks the catalog protocol directly; everything goes
/// through this trait. Production uses [`ConsulCatalog`]; tests use
/// [`MockCatalog`].
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Upsert the record for `endpoint` in `cluster`, attaching a TCP health
    /// check against the endpoint itself.
    ///
    /// Keyed by the endpoint's stable service id, so registering the same
    /// endpoint twice replaces rather than duplicates.
    async fn register(
        &self,
        endpoint: &Endpoint,
        cluster: &str,
        check: &HealthCheckConfig,
    ) -> DiscoveryResult<()>;

    /// Remove the record for `endpoint` in `cluster`.
    ///
    /// Idempotent: removing an absent record is not an error.
    async fn deregister(&self, endpoint: &Endpoint, cluster: &str) -> DiscoveryResult<()>;

    /// Query the healthy members of `cluster`.
    ///
    /// With `wait_secs == 0` this returns immediately with the current set
    /// and version. Otherwise the catalog blocks server-side for up to
    /// `wait_secs`, returning early if its version advances past `since`;
    /// an unchanged version after the wait is a normal no-op, not an error.
    async fn query_healthy(
        &self,
        cluster: &str,
        since: Option<u64>,
        wait_secs: u64,
    ) -> DiscoveryResult<HealthSnapshot>;
}

// =============================================================================
// Consul wire types
// =============================================================================

/// Registration payload for `PUT /v1/agent/service/register`
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: String,
    name: &'a str,
    tags: Vec<&'a str>,
    address: &'a str,
    port: u16,
    check: TcpCheck,
}

/// TCP check block of a registration payload
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TcpCheck {
    #[serde(rename = "TCP")]
    tcp: String,
    interval: String,
    timeout: String,
    deregister_critical_service_after: String,
}

/// One entry of a `GET /v1/health/service/{name}` response
#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Service")]
    service: ServiceEntry,
}

#[derive(Debug, Deserialize)]
struct ServiceEntry {
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
}

// =============================================================================
// ConsulCatalog
// =============================================================================

/// Production catalog client speaking the Consul HTTP API via reqwest.
pub struct ConsulCatalog {
    base_url: String,
    acl_token: Option<String>,
    client: reqwest::Client,
}

impl ConsulCatalog {
    /// Create a client for the catalog address in `config`.
    pub fn new(config: &DiscoveryConfig) -> DiscoveryResult<Self> {
        Self::with_request_timeout(config, Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    /// Create a client with a custom default request timeout.
    ///
    /// The timeout bounds register/deregister and any call that does not set
    /// its own deadline; long-poll queries override it per request. Without
    /// it, a catalog that accepts the connection but never answers would hang
    /// the caller indefinitely.
    pub fn with_request_timeout(
        config: &DiscoveryConfig,
        timeout: Duration,
    ) -> DiscoveryResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(timeout)
            .build()
            .map_err(|err| {
                DiscoveryError::transport(format!("failed to build catalog http client: {err}"))
            })?;

        Ok(Self {
            base_url: normalize_base_url(&config.catalog_addr),
            acl_token: config.acl_token.clone(),
            client,
        })
    }

    fn register_url(&self) -> String {
        format!("{}/v1/agent/service/register", self.base_url)
    }

    fn deregister_url(&self, service_id: &str) -> String {
        format!("{}/v1/agent/service/deregister/{service_id}", self.base_url)
    }

    /// Health query URL. A positive `wait_secs` turns the query into a
    /// blocking one: `index` is the version to wait past, `wait` the
    /// server-side timeout.
    fn health_url(&self, cluster: &str, since: Option<u64>, wait_secs: u64) -> String {
        let mut url = format!(
            "{}/v1/health/service/{cluster}?passing=true&tag={SERVICE_TAG}",
            self.base_url
        );
        if wait_secs > 0 {
            url.push_str(&format!("&index={}&wait={}s", since.unwrap_or(0), wait_secs));
        }
        url
    }

    fn apply_token(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.acl_token {
            Some(token) => request.header("X-Consul-Token", token),
            None => request,
        }
    }
}

#[async_trait]
impl CatalogClient for ConsulCatalog {
    async fn register(
        &self,
        endpoint: &Endpoint,
        cluster: &str,
        check: &HealthCheckConfig,
    ) -> DiscoveryResult<()> {
        let payload = ServiceRegistration {
            id: endpoint.service_id(cluster),
            name: cluster,
            tags: vec![SERVICE_TAG],
            address: endpoint.host(),
            port: endpoint.port(),
            check: TcpCheck {
                tcp: endpoint.to_string(),
                interval: format!("{}s", check.interval_secs),
                timeout: format!("{}s", check.timeout_secs),
                deregister_critical_service_after: format!("{}s", check.deregister_after_secs),
            },
        };

        let response = self
            .apply_token(self.client.put(self.register_url()))
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DiscoveryError::transport(format!(
                "register {} failed with status {}",
                payload.id,
                response.status()
            )));
        }
        Ok(())
    }

    async fn deregister(&self, endpoint: &Endpoint, cluster: &str) -> DiscoveryResult<()> {
        let service_id = endpoint.service_id(cluster);
        let response = self
            .apply_token(self.client.put(self.deregister_url(&service_id)))
            .send()
            .await?;

        // An absent record is fine: deregister is idempotent.
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(DiscoveryError::transport(format!(
                "deregister {service_id} failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn query_healthy(
        &self,
        cluster: &str,
        since: Option<u64>,
        wait_secs: u64,
    ) -> DiscoveryResult<HealthSnapshot> {
        let url = self.health_url(cluster, since, wait_secs);
        let response = self
            .apply_token(self.client.get(url))
            .timeout(Duration::from_secs(wait_secs + WAIT_GRACE_SECS))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DiscoveryError::transport(format!(
                "health query for {cluster} failed with status {}",
                response.status()
            )));
        }

        let version = parse_catalog_index(response.headers());
        let entries: Vec<HealthEntry> = response.json().await?;

        let mut endpoints = Vec::with_capacity(entries.len());
        for entry in entries {
            let endpoint = Endpoint::new(entry.service.address, entry.service.port)
                .map_err(|err| {
                    DiscoveryError::transport(format!("malformed catalog entry: {err}"))
                })?;
            endpoints.push(endpoint);
        }

        Ok(HealthSnapshot { endpoints, version })
    }
}

/// Extract the catalog version from the `X-Consul-Index` response header.
///
/// A missing or unparsable header yields `None` (unknown version).
fn parse_catalog_index(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get("X-Consul-Index")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
}

fn normalize_base_url(addr: &str) -> String {
    let addr = addr.trim_end_matches('/');
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

// =============================================================================
// MockCatalog (for tests)
// =============================================================================

/// In-memory catalog for tests.
///
/// Health queries pop scripted responses in order. With no script queued, a
/// watch query sleeps for its wait and then repeats the last served snapshot
/// (the long-poll timeout case), while a one-shot query returns it
/// immediately.
#[derive(Default)]
pub struct MockCatalog {
    records: std::sync::Mutex<std::collections::HashMap<String, Endpoint>>,
    responses: std::sync::Mutex<std::collections::VecDeque<DiscoveryResult<HealthSnapshot>>>,
    idle: std::sync::Mutex<HealthSnapshot>,
    queries: std::sync::Mutex<Vec<(String, Option<u64>, u64)>>,
    register_calls: std::sync::atomic::AtomicUsize,
    fail_register: std::sync::atomic::AtomicBool,
}

impl MockCatalog {
    /// Create an empty mock catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful health query response
    pub fn push_healthy(&self, endpoints: Vec<Endpoint>, version: Option<u64>) {
        self.responses
            .lock()
            .expect("mock lock poisoned")
            .push_back(Ok(HealthSnapshot { endpoints, version }));
    }

    /// Queue a transport failure for the next health query
    pub fn push_error(&self, reason: &str) {
        self.responses
            .lock()
            .expect("mock lock poisoned")
            .push_back(Err(DiscoveryError::transport(reason)));
    }

    /// Make subsequent register calls fail (or succeed again)
    pub fn set_fail_register(&self, fail: bool) {
        self.fail_register
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Total register calls observed, including failed ones
    pub fn register_calls(&self) -> usize {
        self.register_calls
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Service ids currently registered
    pub fn registered_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .lock()
            .expect("mock lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Every health query observed: (cluster, since, wait_secs)
    pub fn query_log(&self) -> Vec<(String, Option<u64>, u64)> {
        self.queries.lock().expect("mock lock poisoned").clone()
    }
}

#[async_trait]
impl CatalogClient for MockCatalog {
    async fn register(
        &self,
        endpoint: &Endpoint,
        cluster: &str,
        _check: &HealthCheckConfig,
    ) -> DiscoveryResult<()> {
        self.register_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.fail_register.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DiscoveryError::transport("injected register failure"));
        }
        self.records
            .lock()
            .expect("mock lock poisoned")
            .insert(endpoint.service_id(cluster), endpoint.clone());
        Ok(())
    }

    async fn deregister(&self, endpoint: &Endpoint, cluster: &str) -> DiscoveryResult<()> {
        self.records
            .lock()
            .expect("mock lock poisoned")
            .remove(&endpoint.service_id(cluster));
        Ok(())
    }

    async fn query_healthy(
        &self,
        cluster: &str,
        since: Option<u64>,
        wait_secs: u64,
    ) -> DiscoveryResult<HealthSnapshot> {
        self.queries
            .lock()
            .expect("mock lock poisoned")
            .push((cluster.to_string(), since, wait_secs));

        let scripted = self
            .responses
            .lock()
            .expect("mock lock poisoned")
            .pop_front();

        match scripted {
            Some(Ok(snapshot)) => {
                *self.idle.lock().expect("mock lock poisoned") = snapshot.clone();
                Ok(snapshot)
            }
            Some(Err(err)) => Err(err),
            None => {
                let snapshot = self.idle.lock().expect("mock lock poisoned").clone();
                if wait_secs > 0 {
                    // Simulate the server-side wait elapsing with no change.
                    tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                }
                Ok(snapshot)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;

    fn test_catalog() -> ConsulCatalog {
        ConsulCatalog::new(&DiscoveryConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("127.0.0.1:8500"), "http://127.0.0.1:8500");
        assert_eq!(
            normalize_base_url("http://127.0.0.1:8500/"),
            "http://127.0.0.1:8500"
        );
        assert_eq!(
            normalize_base_url("https://consul.internal"),
            "https://consul.internal"
        );
    }

    #[test]
    fn test_health_url_one_shot_has_no_wait() {
        let catalog = test_catalog();
        let url = catalog.health_url("default", Some(42), 0);
        assert_eq!(
            url,
            "http://127.0.0.1:8500/v1/health/service/default?passing=true&tag=services"
        );
    }

    #[test]
    fn test_health_url_watch() {
        let catalog = test_catalog();
        let url = catalog.health_url("default", Some(42), 60);
        assert!(url.ends_with("&index=42&wait=60s"));

        // Unknown version watches from index 0.
        let url = catalog.health_url("default", None, 60);
        assert!(url.ends_with("&index=0&wait=60s"));
    }

    #[test]
    fn test_registration_payload() {
        let endpoint = Endpoint::new("10.0.0.1", 8091).unwrap();
        let check = HealthCheckConfig::default();
        let payload = ServiceRegistration {
            id: endpoint.service_id("default"),
            name: "default",
            tags: vec![SERVICE_TAG],
            address: endpoint.host(),
            port: endpoint.port(),
            check: TcpCheck {
                tcp: endpoint.to_string(),
                interval: format!("{}s", check.interval_secs),
                timeout: format!("{}s", check.timeout_secs),
                deregister_critical_service_after: format!("{}s", check.deregister_after_secs),
            },
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["ID"], "default-10.0.0.1:8091");
        assert_eq!(json["Name"], "default");
        assert_eq!(json["Tags"][0], "services");
        assert_eq!(json["Address"], "10.0.0.1");
        assert_eq!(json["Port"], 8091);
        assert_eq!(json["Check"]["TCP"], "10.0.0.1:8091");
        assert_eq!(json["Check"]["Interval"], "10s");
        assert_eq!(json["Check"]["Timeout"], "1s");
        assert_eq!(json["Check"]["DeregisterCriticalServiceAfter"], "20s");
    }

    #[test]
    fn test_parse_catalog_index() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(parse_catalog_index(&headers), None);

        headers.insert("X-Consul-Index", "57".parse().unwrap());
        assert_eq!(parse_catalog_index(&headers), Some(57));

        headers.insert("X-Consul-Index", "not-a-number".parse().unwrap());
        assert_eq!(parse_catalog_index(&headers), None);
    }

    #[tokio::test]
    async fn test_register_is_bounded_against_stalled_catalog() {
        // A half-open catalog: accepts connections, never answers. Register
        // must fail within its request timeout instead of hanging (a hang
        // here would also wedge the heartbeat guard lock and unregister).
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let config = DiscoveryConfig::new(format!("http://{addr}"));
        let catalog =
            ConsulCatalog::with_request_timeout(&config, Duration::from_millis(200)).unwrap();
        let endpoint = Endpoint::new("10.0.0.1", 8091).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            catalog.register(&endpoint, "default", &HealthCheckConfig::default()),
        )
        .await
        .expect("register must not hang");
        assert!(result.unwrap_err().is_transient());

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            catalog.deregister(&endpoint, "default"),
        )
        .await
        .expect("deregister must not hang");
        assert!(result.unwrap_err().is_transient());

        server.abort();
    }

    #[tokio::test]
    async fn test_mock_register_deregister_idempotent() {
        let mock = MockCatalog::new();
        let endpoint = Endpoint::new("10.0.0.1", 8091).unwrap();
        let check = HealthCheckConfig::default();

        mock.register(&endpoint, "default", &check).await.unwrap();
        mock.register(&endpoint, "default", &check).await.unwrap();
        assert_eq!(mock.registered_ids(), vec!["default-10.0.0.1:8091"]);

        mock.deregister(&endpoint, "default").await.unwrap();
        mock.deregister(&endpoint, "default").await.unwrap();
        assert!(mock.registered_ids().is_empty());
    }

    #[tokio::test]
    async fn test_mock_one_shot_query_never_blocks() {
        let mock = MockCatalog::new();
        // No scripted responses and no prior state: returns empty immediately.
        let snapshot = mock.query_healthy("default", None, 0).await.unwrap();
        assert!(snapshot.endpoints.is_empty());
        assert_eq!(snapshot.version, None);
    }

    #[tokio::test]
    async fn test_mock_scripted_responses_in_order() {
        let mock = MockCatalog::new();
        let a = Endpoint::new("10.0.0.1", 8091).unwrap();
        mock.push_healthy(vec![a.clone()], Some(5));
        mock.push_error("connection refused");

        let snapshot = mock.query_healthy("default", None, 0).await.unwrap();
        assert_eq!(snapshot.version, Some(5));
        assert_eq!(snapshot.endpoints, vec![a.clone()]);

        let err = mock.query_healthy("default", Some(5), 0).await.unwrap_err();
        assert!(err.is_transient());

        // Script exhausted: one-shot repeats the last served snapshot.
        let snapshot = mock.query_healthy("default", Some(5), 0).await.unwrap();
        assert_eq!(snapshot.endpoints, vec![a]);
    }
}
