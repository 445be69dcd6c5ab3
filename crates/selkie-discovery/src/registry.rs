//! Registry facade
//!
//! `ConsulRegistry` is the context object that owns everything: the
//! lazily-built shared catalog handle, the address cache, the listener
//! registry, the per-cluster notifier tasks, and the heartbeat registrar.
//! There is no process-global state; construct one at startup and share it.

use crate::cache::ClusterAddressCache;
use crate::catalog::{CatalogClient, ConsulCatalog};
use crate::config::DiscoveryConfig;
use crate::endpoint::Endpoint;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::heartbeat::HeartbeatRegistrar;
use crate::listener::{FnListener, ListenerRegistry, MembershipListener};
use crate::notifier::{ClusterNotifier, NotifierHandle};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Registry type tag, matching the coordinator's registry selection config
pub const REGISTRY_TYPE: &str = "consul";

/// Consul-backed service registry.
///
/// Public operations mirror the coordinator's registry SPI: `register`,
/// `unregister`, `subscribe`, `unsubscribe`, `lookup`, `cluster_nodes`,
/// `close`.
///
/// # Concurrency
/// Every subscribed cluster gets its own notifier task, so subscriptions
/// never starve each other. Per-cluster state (cache entry, listener set,
/// notifier) is keyed independently; there is no global lock across
/// clusters.
pub struct ConsulRegistry {
    config: DiscoveryConfig,
    /// Shared catalog handle, built lazily on first use and released by
    /// `close`
    catalog: Mutex<Option<Arc<dyn CatalogClient>>>,
    cache: Arc<ClusterAddressCache>,
    listeners: Arc<ListenerRegistry>,
    notifiers: Mutex<HashMap<String, NotifierHandle>>,
    heartbeat: Mutex<Option<HeartbeatRegistrar>>,
    /// Listeners installed by `lookup`'s implicit subscription; they pin the
    /// cluster's notifier so the cache stays fresh
    internal: Mutex<HashMap<String, Arc<dyn MembershipListener>>>,
}

impl ConsulRegistry {
    /// Create a registry for the given configuration. The catalog connection
    /// is not opened until the first operation needs it.
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            catalog: Mutex::new(None),
            cache: Arc::new(ClusterAddressCache::new()),
            listeners: Arc::new(ListenerRegistry::new()),
            notifiers: Mutex::new(HashMap::new()),
            heartbeat: Mutex::new(None),
            internal: Mutex::new(HashMap::new()),
        }
    }

    /// Create a registry backed by a specific catalog client (alternate
    /// transports, tests).
    pub fn with_catalog(config: DiscoveryConfig, catalog: Arc<dyn CatalogClient>) -> Self {
        Self {
            catalog: Mutex::new(Some(catalog)),
            ..Self::new(config)
        }
    }

    /// Shared catalog handle, lazily constructed once under the lock.
    async fn catalog(&self) -> DiscoveryResult<Arc<dyn CatalogClient>> {
        let mut slot = self.catalog.lock().await;
        if let Some(catalog) = slot.as_ref() {
            return Ok(catalog.clone());
        }
        debug!(catalog_addr = %self.config.catalog_addr, "connecting to catalog");
        let built: Arc<dyn CatalogClient> = Arc::new(ConsulCatalog::new(&self.config)?);
        *slot = Some(built.clone());
        Ok(built)
    }

    /// Register the local `endpoint` under this process's cluster and arm
    /// the heartbeat guarding the record.
    ///
    /// # Errors
    /// `Transport` if the catalog call fails; the caller should retry.
    /// (`InvalidAddress` is ruled out by construction of [`Endpoint`].)
    pub async fn register(&self, endpoint: &Endpoint) -> DiscoveryResult<()> {
        let catalog = self.catalog().await?;
        catalog
            .register(endpoint, &self.config.cluster, &self.config.health_check)
            .await?;

        let mut heartbeat = self.heartbeat.lock().await;
        let registrar = heartbeat.get_or_insert_with(|| {
            HeartbeatRegistrar::spawn(
                catalog.clone(),
                self.config.cluster.clone(),
                self.config.health_check.clone(),
                Duration::from_secs(self.config.heartbeat_period_secs),
            )
        });
        registrar.arm(endpoint.clone()).await;

        info!(%endpoint, cluster = %self.config.cluster, "registered with catalog");
        Ok(())
    }

    /// Disarm the heartbeat for `endpoint` and remove its catalog record.
    ///
    /// Disarming first guarantees a concurrent heartbeat tick cannot undo
    /// the removal.
    pub async fn unregister(&self, endpoint: &Endpoint) -> DiscoveryResult<()> {
        if let Some(registrar) = self.heartbeat.lock().await.as_ref() {
            registrar.disarm(endpoint).await;
        }
        self.catalog()
            .await?
            .deregister(endpoint, &self.config.cluster)
            .await?;
        info!(%endpoint, cluster = %self.config.cluster, "unregistered from catalog");
        Ok(())
    }

    /// Subscribe `listener` to membership changes of `cluster`.
    ///
    /// The first subscription for a cluster seeds the cache with a one-shot
    /// query and starts the cluster's notifier at the seeded version;
    /// further subscriptions only attach the listener (one notifier per
    /// cluster, regardless of listener count).
    pub async fn subscribe(
        &self,
        cluster: &str,
        listener: Arc<dyn MembershipListener>,
    ) -> DiscoveryResult<()> {
        self.listeners.add(cluster, listener).await;
        self.ensure_notifier(cluster).await
    }

    /// Detach `listener` from `cluster`. Removing the last listener stops
    /// and discards the cluster's notifier; removing a non-last listener
    /// leaves the feed running for the others.
    pub async fn unsubscribe(&self, cluster: &str, listener: &Arc<dyn MembershipListener>) {
        let remaining = self.listeners.remove(cluster, listener).await;
        if remaining == 0 {
            if let Some(handle) = self.notifiers.lock().await.remove(cluster) {
                handle.stop();
                debug!(cluster, "last listener removed, notifier stopping");
            }
        }
    }

    /// Resolve `key` through the service-group mapping and return the
    /// current membership of its cluster.
    ///
    /// A cluster that was never watched is subscribed implicitly (with an
    /// internal listener) so the returned view keeps refreshing afterwards.
    ///
    /// # Errors
    /// `ConfigurationMissing` if no cluster is mapped for `key`;
    /// `Transport` if the first-time seed query fails.
    pub async fn lookup(&self, key: &str) -> DiscoveryResult<Arc<Vec<Endpoint>>> {
        let cluster = self
            .config
            .service_group(key)
            .ok_or_else(|| DiscoveryError::configuration_missing(key))?
            .to_string();
        self.lookup_cluster(&cluster).await
    }

    /// Membership of this process's own cluster (server role discovering its
    /// peers).
    pub async fn cluster_nodes(&self) -> DiscoveryResult<Arc<Vec<Endpoint>>> {
        let cluster = self.config.cluster.clone();
        self.lookup_cluster(&cluster).await
    }

    /// Release the shared catalog handle and stop the heartbeat loop.
    ///
    /// Active notifiers hold their own clone of the handle and keep
    /// watching; they stop through `unsubscribe`. A later operation on this
    /// registry lazily reconnects.
    pub async fn close(&self) {
        if let Some(registrar) = self.heartbeat.lock().await.take() {
            registrar.shutdown();
        }
        self.catalog.lock().await.take();
        info!("registry closed");
    }

    /// Start the notifier for `cluster` if it is not already running.
    ///
    /// The seed query runs outside the notifiers lock: a slow seed for one
    /// cluster must not block first-time subscribes of other clusters.
    async fn ensure_notifier(&self, cluster: &str) -> DiscoveryResult<()> {
        if self.notifiers.lock().await.contains_key(cluster) {
            return Ok(());
        }

        let catalog = self.catalog().await?;
        // One-shot seed: current membership and the version to watch from.
        let seed = catalog.query_healthy(cluster, None, 0).await?;

        let mut notifiers = self.notifiers.lock().await;
        if notifiers.contains_key(cluster) {
            // Lost the race to a concurrent subscribe; its notifier already
            // watches and seeded the cache.
            return Ok(());
        }
        self.cache.replace(cluster, seed.endpoints.clone()).await;

        let handle = ClusterNotifier::spawn(
            cluster.to_string(),
            catalog,
            self.cache.clone(),
            self.listeners.clone(),
            self.config.watch_timeout_secs,
            seed.version,
        );
        notifiers.insert(cluster.to_string(), handle);
        info!(cluster, members = seed.endpoints.len(), version = ?seed.version, "cluster watch established");
        Ok(())
    }

    async fn lookup_cluster(&self, cluster: &str) -> DiscoveryResult<Arc<Vec<Endpoint>>> {
        let watched = self.notifiers.lock().await.contains_key(cluster);
        if !watched {
            let listener = {
                let mut internal = self.internal.lock().await;
                internal
                    .entry(cluster.to_string())
                    // The notifier itself mirrors results into the cache; the
                    // internal listener only pins the subscription.
                    .or_insert_with(|| Arc::new(FnListener::new(|_| {})))
                    .clone()
            };
            self.subscribe(cluster, listener).await?;
        }
        Ok(self.cache.get(cluster).await)
    }
}
