//! Heartbeat re-registration
//!
//! The catalog ties liveness to a side-channel TCP probe; the registrar
//! additionally re-issues the registration itself on a fixed period, so a
//! record the catalog silently expired (or a registration call that was
//! dropped) comes back on the next tick. Failures are logged and retried on
//! the next tick, never surfaced to callers.

use crate::catalog::CatalogClient;
use crate::config::HealthCheckConfig;
use crate::endpoint::Endpoint;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Periodic re-registration loop over a guarded set of local endpoints.
///
/// The guard set is the coordination point between heartbeats and explicit
/// unregistration: a tick holds the set's lock while re-registering, and
/// `disarm` takes that same lock, so once `disarm` returns no tick can
/// re-register the endpoint again.
pub struct HeartbeatRegistrar {
    endpoints: Arc<Mutex<HashSet<Endpoint>>>,
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl HeartbeatRegistrar {
    /// Spawn the re-registration loop. The first tick fires one period after
    /// spawn; `register` has already been called directly by then.
    pub fn spawn(
        catalog: Arc<dyn CatalogClient>,
        cluster: String,
        check: HealthCheckConfig,
        period: Duration,
    ) -> Self {
        let endpoints: Arc<Mutex<HashSet<Endpoint>>> = Arc::new(Mutex::new(HashSet::new()));
        let running = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn({
            let endpoints = endpoints.clone();
            let running = running.clone();
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The interval's first tick completes immediately; skip it.
                ticker.tick().await;

                while running.load(Ordering::Acquire) {
                    ticker.tick().await;
                    if !running.load(Ordering::Acquire) {
                        break;
                    }

                    // Hold the guard across the calls so a concurrent disarm
                    // cannot race an in-flight re-registration.
                    let guard = endpoints.lock().await;
                    for endpoint in guard.iter() {
                        match catalog.register(endpoint, &cluster, &check).await {
                            Ok(()) => {
                                debug!(%endpoint, cluster = %cluster, "heartbeat re-registered")
                            }
                            Err(err) => warn!(
                                %endpoint,
                                cluster = %cluster,
                                error = %err,
                                "heartbeat re-registration failed, retrying next tick"
                            ),
                        }
                    }
                }
            }
        });

        Self {
            endpoints,
            running,
            task,
        }
    }

    /// Start guarding `endpoint`: it will be re-registered every tick until
    /// disarmed.
    pub async fn arm(&self, endpoint: Endpoint) {
        self.endpoints.lock().await.insert(endpoint);
    }

    /// Stop guarding `endpoint`. Waits out any in-flight tick; after this
    /// returns, no heartbeat will re-register the endpoint.
    pub async fn disarm(&self, endpoint: &Endpoint) {
        self.endpoints.lock().await.remove(endpoint);
    }

    /// Request a cooperative stop of the loop (takes effect at the next tick)
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Whether the loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MockCatalog;

    fn ep(host: &str, port: u16) -> Endpoint {
        Endpoint::new(host, port).unwrap()
    }

    fn spawn_fast(catalog: Arc<MockCatalog>) -> HeartbeatRegistrar {
        HeartbeatRegistrar::spawn(
            catalog,
            "default".to_string(),
            HealthCheckConfig::default(),
            Duration::from_millis(50),
        )
    }

    async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        for _ in 0..250 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    #[tokio::test]
    async fn test_armed_endpoint_is_reregistered_every_tick() {
        let catalog = Arc::new(MockCatalog::new());
        let registrar = spawn_fast(catalog.clone());

        registrar.arm(ep("10.0.0.1", 8091)).await;

        let probe = catalog.clone();
        wait_until("repeated re-registration", || probe.register_calls() >= 3).await;
        assert_eq!(catalog.registered_ids(), vec!["default-10.0.0.1:8091"]);

        registrar.shutdown();
    }

    #[tokio::test]
    async fn test_disarm_stops_resurrection() {
        let catalog = Arc::new(MockCatalog::new());
        let registrar = spawn_fast(catalog.clone());

        let endpoint = ep("10.0.0.1", 8091);
        registrar.arm(endpoint.clone()).await;

        let probe = catalog.clone();
        wait_until("first heartbeat", || probe.register_calls() >= 1).await;

        registrar.disarm(&endpoint).await;
        catalog.deregister(&endpoint, "default").await.unwrap();

        // No tick may bring the record back after disarm returned.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(catalog.registered_ids().is_empty());

        registrar.shutdown();
    }

    #[tokio::test]
    async fn test_failures_are_swallowed_and_retried() {
        let catalog = Arc::new(MockCatalog::new());
        catalog.set_fail_register(true);
        let registrar = spawn_fast(catalog.clone());

        registrar.arm(ep("10.0.0.1", 8091)).await;

        // Ticks keep coming despite failures.
        let probe = catalog.clone();
        wait_until("failed attempts", || probe.register_calls() >= 2).await;
        assert!(catalog.registered_ids().is_empty());

        // Next tick after recovery re-registers.
        catalog.set_fail_register(false);
        let probe = catalog.clone();
        wait_until("recovered registration", || {
            !probe.registered_ids().is_empty()
        })
        .await;

        registrar.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let catalog = Arc::new(MockCatalog::new());
        let registrar = spawn_fast(catalog);

        registrar.shutdown();
        wait_until("loop exit", || registrar.is_finished()).await;
    }
}
