//! Heartbeat-based membership over a shared registry.
//!
//! [`SharedRegistry`] plays the role of the coordination store that every
//! process in a group can see: each live node keeps refreshing a heartbeat
//! entry under its service name, and entries that stop being refreshed for
//! longer than the stale threshold are treated as dead and pruned on read.
//!
//! [`RegistryDriver`] is the [`MembershipSource`] that registers one process
//! in the registry and reads the live member list back out of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::driver::{DriverOption, DriverOptions, MembershipSource};
use crate::error::DriverError;

/// Heartbeat age after which a node is considered gone.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5);

/// Prefix prepended to generated node ids.
pub const DEFAULT_NODE_PREFIX: &str = "jobring-";

/// Shortest heartbeat period a driver will use.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Per-service heartbeat table: node id -> last heartbeat.
type Heartbeats = HashMap<String, Instant>;

struct RegistryInner {
    services: RwLock<HashMap<String, Heartbeats>>,
    stale_after: Duration,
    available: AtomicBool,
    latency_nanos: AtomicU64,
}

/// Shared membership registry.
///
/// Cloning is cheap and every clone sees the same table.
#[derive(Clone)]
pub struct SharedRegistry {
    inner: Arc<RegistryInner>,
}

impl SharedRegistry {
    /// Create a registry that expires heartbeats older than `stale_after`.
    pub fn new(stale_after: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                services: RwLock::new(HashMap::new()),
                stale_after,
                available: AtomicBool::new(true),
                latency_nanos: AtomicU64::new(0),
            }),
        }
    }

    /// Heartbeat age after which a node is considered gone.
    pub fn stale_after(&self) -> Duration {
        self.inner.stale_after
    }

    /// Record a heartbeat for `node_id` in `service`.
    pub fn heartbeat(&self, service: &str, node_id: &str) {
        let mut services = self.inner.services.write().expect("lock poisoned");
        services
            .entry(service.to_string())
            .or_default()
            .insert(node_id.to_string(), Instant::now());
    }

    /// Remove `node_id` from `service` immediately.
    pub fn deregister(&self, service: &str, node_id: &str) {
        let mut services = self.inner.services.write().expect("lock poisoned");
        if let Some(nodes) = services.get_mut(service) {
            nodes.remove(node_id);
        }
    }

    /// Return the live nodes of `service`, sorted.
    ///
    /// Stale entries are pruned as a side effect.
    pub async fn live_nodes(&self, service: &str) -> Result<Vec<String>, DriverError> {
        let latency = Duration::from_nanos(self.inner.latency_nanos.load(Ordering::Relaxed));
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if !self.inner.available.load(Ordering::Acquire) {
            return Err(DriverError::Unavailable("registry offline".to_string()));
        }

        let now = Instant::now();
        let mut services = self.inner.services.write().expect("lock poisoned");
        let Some(nodes) = services.get_mut(service) else {
            return Ok(Vec::new());
        };

        nodes.retain(|node_id, last| {
            let alive = now.duration_since(*last) < self.inner.stale_after;
            if !alive {
                debug!(service, node_id = %node_id, "pruning stale heartbeat");
            }
            alive
        });

        let mut live: Vec<String> = nodes.keys().cloned().collect();
        live.sort();
        Ok(live)
    }

    /// Simulate the store going offline (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
    }

    /// Delay every read by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.inner.latency_nanos.store(nanos, Ordering::Relaxed);
    }
}

impl Default for SharedRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

impl std::fmt::Debug for SharedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegistry")
            .field("stale_after", &self.inner.stale_after)
            .finish_non_exhaustive()
    }
}

/// Running heartbeat task and the token that stops it.
struct Heartbeat {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// [`MembershipSource`] backed by a [`SharedRegistry`].
///
/// The node id is generated in [`init`](MembershipSource::init) and stays
/// fixed for the lifetime of the driver, across any number of start/stop
/// cycles. Dropping a started driver ends its heartbeat and deregisters it.
pub struct RegistryDriver {
    registry: SharedRegistry,
    prefix: String,
    service: String,
    node_id: String,
    options: DriverOptions,
    heartbeat: Mutex<Option<Heartbeat>>,
}

impl RegistryDriver {
    /// Create a driver over `registry` using [`DEFAULT_NODE_PREFIX`].
    pub fn new(registry: SharedRegistry) -> Self {
        Self::with_prefix(registry, DEFAULT_NODE_PREFIX)
    }

    /// Create a driver whose node ids start with `prefix`.
    pub fn with_prefix(registry: SharedRegistry, prefix: impl Into<String>) -> Self {
        Self {
            registry,
            prefix: prefix.into(),
            service: String::new(),
            node_id: String::new(),
            options: DriverOptions::default(),
            heartbeat: Mutex::new(None),
        }
    }

    fn is_started(&self) -> bool {
        self.heartbeat.lock().expect("lock poisoned").is_some()
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.registry.stale_after() / 3).max(MIN_HEARTBEAT_INTERVAL)
    }
}

#[async_trait::async_trait]
impl MembershipSource for RegistryDriver {
    fn init(&mut self, service_name: &str, options: Vec<DriverOption>) {
        self.service = service_name.to_string();
        self.options = DriverOptions::from_options(options);
        self.node_id = format!(
            "{}{}-{}",
            self.prefix,
            service_name,
            node_suffix(service_name)
        );

        let _enter = self.options.span.enter();
        debug!(node_id = %self.node_id, timeout = ?self.options.timeout, "registry driver initialised");
    }

    fn node_id(&self) -> String {
        self.node_id.clone()
    }

    async fn get_nodes(&self) -> Result<Vec<String>, DriverError> {
        if !self.is_started() {
            return Err(DriverError::NotStarted);
        }

        let timeout = self.options.timeout;
        tokio::time::timeout(timeout, self.registry.live_nodes(&self.service))
            .await
            .map_err(|_| DriverError::Timeout(timeout))?
    }

    async fn start(&self) -> Result<(), DriverError> {
        let mut heartbeat = self.heartbeat.lock().expect("lock poisoned");
        if heartbeat.is_some() {
            return Ok(());
        }

        // Register synchronously so we are visible before start returns.
        self.registry.heartbeat(&self.service, &self.node_id);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let registry = self.registry.clone();
        let service = self.service.clone();
        let node_id = self.node_id.clone();
        let period = self.heartbeat_interval();

        let task = tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = interval.tick() => registry.heartbeat(&service, &node_id),
                    }
                }
                debug!("heartbeat task stopped");
            }
            .instrument(self.options.span.clone()),
        );

        *heartbeat = Some(Heartbeat { cancel, task });

        let _enter = self.options.span.enter();
        info!(node_id = %self.node_id, service = %self.service, "registered in membership registry");
        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        let running = self.heartbeat.lock().expect("lock poisoned").take();

        if let Some(Heartbeat { cancel, task }) = running {
            cancel.cancel();
            if let Err(e) = task.await {
                let _enter = self.options.span.enter();
                warn!(%e, "heartbeat task ended abnormally");
            }
        }

        self.registry.deregister(&self.service, &self.node_id);

        let _enter = self.options.span.enter();
        info!(node_id = %self.node_id, "deregistered from membership registry");
        Ok(())
    }
}

impl Drop for RegistryDriver {
    fn drop(&mut self) {
        let running = self
            .heartbeat
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Heartbeat { cancel, task }) = running {
            cancel.cancel();
            task.abort();
            self.registry.deregister(&self.service, &self.node_id);
            debug!(parent: &self.options.span, node_id = %self.node_id, "driver dropped while registered");
        }
    }
}

impl std::fmt::Debug for RegistryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryDriver")
            .field("service", &self.service)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Short unique suffix: first 12 hex chars of blake3(service, pid, time, seq).
fn node_suffix(service: &str) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);

    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    let mut hasher = blake3::Hasher::new();
    hasher.update(service.as_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&SEQ.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    hasher.finalize().to_hex()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(registry: &SharedRegistry, service: &str) -> RegistryDriver {
        let mut d = RegistryDriver::new(registry.clone());
        d.init(service, vec![DriverOption::Timeout(Duration::from_millis(200))]);
        d
    }

    #[test]
    fn test_node_ids_are_unique_and_prefixed() {
        let registry = SharedRegistry::default();
        let a = driver(&registry, "billing");
        let b = driver(&registry, "billing");

        assert!(a.node_id().starts_with("jobring-billing-"));
        assert_ne!(a.node_id(), b.node_id());
    }

    #[tokio::test]
    async fn test_get_nodes_before_start_fails() {
        let registry = SharedRegistry::default();
        let d = driver(&registry, "svc");
        assert_eq!(d.get_nodes().await, Err(DriverError::NotStarted));
    }

    #[tokio::test]
    async fn test_started_drivers_see_each_other_sorted() {
        let registry = SharedRegistry::default();
        let a = driver(&registry, "svc");
        let b = driver(&registry, "svc");
        let other = driver(&registry, "other-svc");

        a.start().await.unwrap();
        b.start().await.unwrap();
        other.start().await.unwrap();

        let mut expected = vec![a.node_id(), b.node_id()];
        expected.sort();
        assert_eq!(a.get_nodes().await.unwrap(), expected);
        assert_eq!(b.get_nodes().await.unwrap(), expected);

        b.stop().await.unwrap();
        assert_eq!(a.get_nodes().await.unwrap(), vec![a.node_id()]);

        a.stop().await.unwrap();
        other.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_stop_cycles_keep_node_id() {
        let registry = SharedRegistry::default();
        let d = driver(&registry, "svc");
        let id = d.node_id();

        for _ in 0..3 {
            d.start().await.unwrap();
            d.start().await.unwrap();
            assert_eq!(d.get_nodes().await.unwrap(), vec![id.clone()]);
            d.stop().await.unwrap();
            d.stop().await.unwrap();
        }
        assert_eq!(d.node_id(), id);
    }

    #[tokio::test]
    async fn test_unavailable_registry_surfaces_error() {
        let registry = SharedRegistry::default();
        let d = driver(&registry, "svc");
        d.start().await.unwrap();

        registry.set_available(false);
        assert!(matches!(
            d.get_nodes().await,
            Err(DriverError::Unavailable(_))
        ));

        registry.set_available(true);
        assert_eq!(d.get_nodes().await.unwrap().len(), 1);
        d.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_registry_times_out() {
        let registry = SharedRegistry::default();
        let d = driver(&registry, "svc");
        d.start().await.unwrap();

        registry.set_latency(Duration::from_secs(1));
        assert_eq!(
            d.get_nodes().await,
            Err(DriverError::Timeout(Duration::from_millis(200)))
        );
        d.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_millisecond_latency_is_applied() {
        let registry = SharedRegistry::default();
        registry.set_latency(Duration::from_micros(500));

        let started = Instant::now();
        registry.live_nodes("svc").await.unwrap();
        assert!(started.elapsed() >= Duration::from_micros(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_heartbeats_are_pruned() {
        let registry = SharedRegistry::new(Duration::from_secs(1));
        registry.heartbeat("svc", "ghost");
        registry.heartbeat("svc", "alive");

        tokio::time::advance(Duration::from_millis(600)).await;
        registry.heartbeat("svc", "alive");
        tokio::time::advance(Duration::from_millis(600)).await;

        assert_eq!(registry.live_nodes("svc").await.unwrap(), vec!["alive"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_node_alive() {
        let registry = SharedRegistry::new(Duration::from_millis(300));
        let d = driver(&registry, "svc");
        d.start().await.unwrap();

        // Several stale windows pass; the heartbeat task keeps us registered.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(d.get_nodes().await.unwrap(), vec![d.node_id()]);

        d.stop().await.unwrap();
        assert!(registry.live_nodes("svc").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_driver_stops_heartbeating() {
        let registry = SharedRegistry::new(Duration::from_millis(300));
        let d = driver(&registry, "svc");
        d.start().await.unwrap();
        assert_eq!(registry.live_nodes("svc").await.unwrap().len(), 1);

        drop(d);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(registry.live_nodes("svc").await.unwrap().is_empty());
    }
}
