//! Per-cluster address cache

use crate::endpoint::Endpoint;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Cluster name to current full membership.
///
/// `replace` is the only mutator and swaps the whole set atomically; readers
/// never observe a partially-updated set. Deciding *whether* a set changed is
/// the notifier's concern, not the cache's.
#[derive(Debug, Default)]
pub struct ClusterAddressCache {
    clusters: RwLock<HashMap<String, Arc<Vec<Endpoint>>>>,
}

impl ClusterAddressCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Current set for `cluster`. Empty if the cluster was never refreshed;
    /// never an error.
    pub async fn get(&self, cluster: &str) -> Arc<Vec<Endpoint>> {
        self.clusters
            .read()
            .await
            .get(cluster)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the whole set for `cluster`. Last successful refresh wins.
    pub async fn replace(&self, cluster: &str, endpoints: Vec<Endpoint>) {
        self.clusters
            .write()
            .await
            .insert(cluster.to_string(), Arc::new(endpoints));
    }
}
