//! Membership listeners and the per-cluster fan-out registry

use crate::endpoint::Endpoint;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Observer of cluster membership changes.
///
/// Invoked synchronously by the cluster's notifier with the full new set;
/// the notifier does not poll again until every listener of the cycle has
/// returned. Implementations should return quickly and must not block on
/// the notifier itself.
pub trait MembershipListener: Send + Sync {
    /// Called with the complete new membership of the watched cluster
    fn on_membership_change(&self, endpoints: &[Endpoint]);
}

/// Closure adapter for [`MembershipListener`]
pub struct FnListener<F>(F);

impl<F> FnListener<F>
where
    F: Fn(&[Endpoint]) + Send + Sync,
{
    /// Wrap a closure as a listener
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> MembershipListener for FnListener<F>
where
    F: Fn(&[Endpoint]) + Send + Sync,
{
    fn on_membership_change(&self, endpoints: &[Endpoint]) {
        (self.0)(endpoints)
    }
}

/// Cluster name to the set of registered listeners.
///
/// Listeners are identified by `Arc` pointer identity: adding the same `Arc`
/// twice is a no-op, and removal detaches exactly that `Arc`. Counts returned
/// by `add`/`remove` let the facade ref-count the cluster's notifier.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<String, Vec<Arc<dyn MembershipListener>>>>,
}

impl ListenerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener for `cluster`; returns the listener count afterwards.
    pub async fn add(&self, cluster: &str, listener: Arc<dyn MembershipListener>) -> usize {
        let mut map = self.listeners.write().await;
        let entries = map.entry(cluster.to_string()).or_default();
        if !entries.iter().any(|existing| Arc::ptr_eq(existing, &listener)) {
            entries.push(listener);
        }
        entries.len()
    }

    /// Remove a listener by identity; returns the count remaining for
    /// `cluster`. Removing an unknown listener is a no-op.
    pub async fn remove(&self, cluster: &str, listener: &Arc<dyn MembershipListener>) -> usize {
        let mut map = self.listeners.write().await;
        let Some(entries) = map.get_mut(cluster) else {
            return 0;
        };
        entries.retain(|existing| !Arc::ptr_eq(existing, listener));
        let remaining = entries.len();
        if remaining == 0 {
            map.remove(cluster);
        }
        remaining
    }

    /// Number of listeners registered for `cluster`
    pub async fn count(&self, cluster: &str) -> usize {
        self.listeners
            .read()
            .await
            .get(cluster)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Snapshot of the listeners for one fan-out cycle
    pub async fn snapshot(&self, cluster: &str) -> Vec<Arc<dyn MembershipListener>> {
        self.listeners
            .read()
            .await
            .get(cluster)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn noop() -> Arc<dyn MembershipListener> {
        Arc::new(FnListener::new(|_| {}))
    }

    #[tokio::test]
    async fn test_add_is_deduplicated_by_identity() {
        let registry = ListenerRegistry::new();
        let listener = noop();

        assert_eq!(registry.add("default", listener.clone()).await, 1);
        assert_eq!(registry.add("default", listener.clone()).await, 1);
        assert_eq!(registry.count("default").await, 1);

        // A distinct Arc with identical behavior is a different listener.
        assert_eq!(registry.add("default", noop()).await, 2);
    }

    #[tokio::test]
    async fn test_remove_detaches_only_that_listener() {
        let registry = ListenerRegistry::new();
        let first = noop();
        let second = noop();
        registry.add("default", first.clone()).await;
        registry.add("default", second.clone()).await;

        assert_eq!(registry.remove("default", &first).await, 1);
        assert_eq!(registry.count("default").await, 1);

        assert_eq!(registry.remove("default", &second).await, 0);
        assert_eq!(registry.count("default").await, 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_is_noop() {
        let registry = ListenerRegistry::new();
        assert_eq!(registry.remove("default", &noop()).await, 0);
    }

    #[tokio::test]
    async fn test_snapshot_fan_out() {
        let registry = ListenerRegistry::new();
        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

        for tag in [1usize, 2] {
            let seen = seen.clone();
            registry
                .add(
                    "default",
                    Arc::new(FnListener::new(move |endpoints: &[Endpoint]| {
                        seen.lock().unwrap().push(tag * endpoints.len());
                    })),
                )
                .await;
        }

        let endpoints = vec![Endpoint::new("10.0.0.1", 8091).unwrap()];
        for listener in registry.snapshot("default").await {
            listener.on_membership_change(&endpoints);
        }

        let mut invoked = seen.lock().unwrap().clone();
        invoked.sort();
        assert_eq!(invoked, vec![1, 2]);
    }
}
