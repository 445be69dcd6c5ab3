//! Cluster watch loop
//!
//! One notifier task per subscribed cluster. The task long-polls the catalog
//! at the version it last observed; a strictly newer version - or the first
//! success after a transport error - replaces the cached set and fans out to
//! every listener before the next poll. The blocking query itself paces the
//! happy path, so no sleep is needed there; transport errors back off
//! exponentially with jitter.
//!
//! TigerStyle: Cooperative cancellation at loop boundaries, bounded backoff.

use crate::cache::ClusterAddressCache;
use crate::catalog::{CatalogClient, HealthSnapshot};
use crate::listener::ListenerRegistry;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// First retry delay after a transport error, in milliseconds
pub const BACKOFF_BASE_MS: u64 = 100;

/// Retry delay cap in milliseconds
pub const BACKOFF_MAX_MS: u64 = 10_000;

// =============================================================================
// RetryBackoff
// =============================================================================

/// Bounded exponential backoff with jitter.
///
/// Delays double from `base_ms` up to `max_ms`; each value is jittered by
/// +/-50% so that watchers recovering from a shared outage do not stampede
/// the catalog. `reset` on success.
#[derive(Debug)]
pub struct RetryBackoff {
    base_ms: u64,
    max_ms: u64,
    current_ms: u64,
}

impl RetryBackoff {
    /// Create a backoff starting at `base_ms`, capped at `max_ms`
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        debug_assert!(base_ms > 0);
        debug_assert!(max_ms >= base_ms);
        Self {
            base_ms,
            max_ms,
            current_ms: 0,
        }
    }

    /// Forget accumulated failures; the next delay starts at the base again.
    pub fn reset(&mut self) {
        self.current_ms = 0;
    }

    /// Next delay in milliseconds, jittered.
    pub fn next_delay_ms(&mut self) -> u64 {
        let raw = if self.current_ms == 0 {
            self.base_ms
        } else {
            (self.current_ms.saturating_mul(2)).min(self.max_ms)
        };
        self.current_ms = raw;

        let span = raw / 2;
        rand::thread_rng().gen_range(raw - span..=raw + span)
    }
}

// =============================================================================
// ClusterNotifier
// =============================================================================

/// Handle to a running notifier task.
///
/// Dropping the handle does not stop the task; call [`NotifierHandle::stop`].
pub struct NotifierHandle {
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl NotifierHandle {
    /// Request a cooperative stop.
    ///
    /// Takes effect at the next loop boundary; an in-flight long poll is
    /// allowed to return first, not cancelled mid-call.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Whether the watch loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// The watch loop state for one cluster.
pub struct ClusterNotifier {
    cluster: String,
    catalog: Arc<dyn CatalogClient>,
    cache: Arc<ClusterAddressCache>,
    listeners: Arc<ListenerRegistry>,
    watch_timeout_secs: u64,
    /// Last catalog version observed; `None` until the catalog reports one
    last_version: Option<u64>,
    /// Set on transport error; forces a refresh on the next success
    had_error: bool,
    backoff: RetryBackoff,
    running: Arc<AtomicBool>,
}

impl ClusterNotifier {
    /// Spawn the watch loop for `cluster` as an independent tokio task.
    ///
    /// `seed_version` is the version returned by the subscribe-time seed
    /// query; the first watch call blocks until the catalog moves past it.
    pub fn spawn(
        cluster: String,
        catalog: Arc<dyn CatalogClient>,
        cache: Arc<ClusterAddressCache>,
        listeners: Arc<ListenerRegistry>,
        watch_timeout_secs: u64,
        seed_version: Option<u64>,
    ) -> NotifierHandle {
        let running = Arc::new(AtomicBool::new(true));
        let mut notifier = Self {
            cluster,
            catalog,
            cache,
            listeners,
            watch_timeout_secs,
            last_version: seed_version,
            had_error: false,
            backoff: RetryBackoff::new(BACKOFF_BASE_MS, BACKOFF_MAX_MS),
            running: running.clone(),
        };
        let task = tokio::spawn(async move { notifier.run().await });
        NotifierHandle { running, task }
    }

    async fn run(&mut self) {
        debug!(cluster = %self.cluster, version = ?self.last_version, "cluster watch started");
        while self.running.load(Ordering::Acquire) {
            let result = self
                .catalog
                .query_healthy(&self.cluster, self.last_version, self.watch_timeout_secs)
                .await;

            match result {
                Ok(snapshot) => self.process(snapshot).await,
                Err(err) => {
                    self.had_error = true;
                    let delay_ms = self.backoff.next_delay_ms();
                    warn!(
                        cluster = %self.cluster,
                        error = %err,
                        delay_ms,
                        "health watch failed, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
        debug!(cluster = %self.cluster, "cluster watch stopped");
    }

    /// Handle one successful poll.
    ///
    /// A strictly newer version, or any success directly after an error, is
    /// a change: the cache is replaced and listeners are invoked exactly
    /// once with the new set. An unchanged version with no prior error is
    /// the long-poll timeout case and a no-op.
    async fn process(&mut self, snapshot: HealthSnapshot) {
        self.backoff.reset();

        let advanced = match (snapshot.version, self.last_version) {
            (Some(new), Some(old)) => new > old,
            (Some(_), None) => true,
            // Unknown version never advances the watch position.
            (None, _) => false,
        };

        if !advanced && !self.had_error {
            return;
        }
        self.had_error = false;
        if advanced {
            self.last_version = snapshot.version;
        }

        info!(
            cluster = %self.cluster,
            members = snapshot.endpoints.len(),
            version = ?snapshot.version,
            "cluster membership refreshed"
        );
        self.cache
            .replace(&self.cluster, snapshot.endpoints.clone())
            .await;
        for listener in self.listeners.snapshot(&self.cluster).await {
            listener.on_membership_change(&snapshot.endpoints);
        }
    }
}
