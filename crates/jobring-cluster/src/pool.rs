//! Node pool: keeps a ring snapshot current and answers ownership queries.
//!
//! [`NodePool`] owns one [`MembershipSource`] and one background refresh
//! task. The task re-fetches membership every `refresh_interval` and, when
//! the member list actually changed, builds a brand-new [`HashRing`] outside
//! any lock and swaps it in under the write lock. Ownership queries take the
//! read lock for a single lookup, so they always see one complete ring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use jobring_placement::HashRing;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::config::PoolConfig;
use crate::driver::{DriverOption, MembershipSource};
use crate::error::{ClusterError, DriverError};

/// Lifecycle of a [`NodePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Constructed, or a previous `start` failed or was cancelled.
    Created,
    /// `start` in progress.
    Starting,
    /// Refresh task active; ownership queries are meaningful.
    Running,
    /// `stop` in progress.
    Stopping,
    /// Stopped for good. Construct a new pool to run again.
    Stopped,
}

/// Events published by a pool to its subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A new ring snapshot was swapped in, built from `members`.
    RingRebuilt {
        /// The member list the ring was built from.
        members: Vec<String>,
    },
    /// A scheduled membership fetch failed; the previous ring was kept.
    RefreshFailed {
        /// Why the fetch failed.
        error: DriverError,
    },
}

/// The state guarded by the pool's reader-writer lock.
#[derive(Debug, Default)]
struct Snapshot {
    /// This process's identifier, fixed at start.
    node_id: String,
    /// Active ring; `None` until the first successful fetch.
    ring: Option<Arc<HashRing>>,
    /// Member list the active ring was built from.
    members: Vec<String>,
}

/// State shared between the pool handle and its refresh task.
struct Shared {
    config: PoolConfig,
    snapshot: RwLock<Snapshot>,
    event_tx: broadcast::Sender<PoolEvent>,
}

impl Shared {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Snapshot> {
        self.snapshot.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a fetched member list. Returns whether the ring was replaced.
    ///
    /// Only the refresh task calls this once the pool is running, so the
    /// comparison and the build can happen outside the lock.
    fn update(&self, members: Vec<String>) -> bool {
        let unchanged = {
            let current = self.read();
            self.config.comparison.unchanged(&current.members, &members)
        };
        if unchanged {
            debug!(members = ?members, "membership unchanged");
            return false;
        }

        self.install(members);
        true
    }

    /// Build a ring from `members` and swap it in unconditionally.
    fn install(&self, members: Vec<String>) {
        let ring = HashRing::build(
            self.config.hash_replicas,
            self.config.hasher.clone(),
            &members,
        );

        {
            let mut snapshot = self.write();
            snapshot.ring = Some(Arc::new(ring));
            snapshot.members = members.clone();
        }

        info!(members = ?members, "hash ring rebuilt");
        let _ = self.event_tx.send(PoolEvent::RingRebuilt { members });
    }

    /// Drop the ring and the membership history.
    fn clear(&self) {
        let mut snapshot = self.write();
        snapshot.ring = None;
        snapshot.members.clear();
    }
}

/// Handle to the running refresh task.
struct RefreshTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Background membership refresher for one pool.
struct RefreshLoop {
    shared: Arc<Shared>,
    driver: Arc<dyn MembershipSource>,
    cancel: CancellationToken,
}

impl RefreshLoop {
    /// Run until cancelled.
    async fn run(self) {
        let period = self.shared.config.refresh_interval;
        debug!(?period, "refresh loop started");

        // The initial ring was built by `start`; first tick is one period out.
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            // A stalled fetch must not delay shutdown.
            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.driver.get_nodes() => result,
            };

            match fetched {
                Ok(members) => {
                    self.shared.update(members);
                }
                Err(e) => {
                    warn!(%e, "membership fetch failed; keeping current ring");
                    let _ = self
                        .shared
                        .event_tx
                        .send(PoolEvent::RefreshFailed { error: e });
                }
            }
        }

        debug!("refresh loop stopped");
    }
}

/// Resets a pool whose `start` did not complete.
///
/// Dropping the `start` future mid-bootstrap leaves the pool in `Created`
/// with no ring, so it can be retried or stopped.
struct StartGuard<'a> {
    pool: &'a NodePool,
    armed: bool,
}

impl<'a> StartGuard<'a> {
    fn new(pool: &'a NodePool) -> Self {
        Self { pool, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let reset = {
            let mut state = self.pool.lock_state();
            if *state == PoolState::Starting {
                *state = PoolState::Created;
                true
            } else {
                false
            }
        };
        if reset {
            self.pool.shared.clear();
        }
    }
}

/// Decides which jobs this process owns.
///
/// One pool per process per service. Lifecycle:
/// `Created -> Starting -> Running -> Stopping -> Stopped`; a failed `start`
/// returns to `Created` and may be retried, a stopped pool cannot restart.
pub struct NodePool {
    shared: Arc<Shared>,
    driver: Arc<dyn MembershipSource>,
    state: Mutex<PoolState>,
    refresh: Mutex<Option<RefreshTask>>,
    /// Set while the driver may be running; `stop` uses it to clean up
    /// after a cancelled `start`.
    driver_started: AtomicBool,
    span: Span,
}

impl NodePool {
    /// Create a pool and initialise `driver` for `config.service_name`.
    ///
    /// The driver receives the refresh interval as its fetch timeout and the
    /// pool's span as its diagnostic sink.
    pub fn new<D>(config: PoolConfig, mut driver: D) -> Self
    where
        D: MembershipSource + 'static,
    {
        let span = tracing::info_span!("node_pool", service = %config.service_name);
        driver.init(
            &config.service_name,
            vec![
                DriverOption::Timeout(config.refresh_interval),
                DriverOption::Span(span.clone()),
            ],
        );

        let (event_tx, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                config,
                snapshot: RwLock::new(Snapshot::default()),
                event_tx,
            }),
            driver: Arc::new(driver),
            state: Mutex::new(PoolState::Created),
            refresh: Mutex::new(None),
            driver_started: AtomicBool::new(false),
            span,
        }
    }

    /// Start the driver, build the initial ring and spawn the refresh task.
    ///
    /// On error no task is spawned and the pool returns to
    /// [`PoolState::Created`], so `start` may be retried. The same holds when
    /// the returned future is dropped before it completes; the driver may
    /// still be running then, and [`stop`](Self::stop) shuts it down.
    pub async fn start(&self) -> Result<(), ClusterError> {
        self.transition(|state| match state {
            PoolState::Created => Ok(PoolState::Starting),
            PoolState::Running => Err(ClusterError::AlreadyRunning),
            PoolState::Stopped => Err(ClusterError::Stopped),
            other => Err(ClusterError::InvalidState(other)),
        })?;

        let guard = StartGuard::new(self);
        self.bootstrap().instrument(self.span.clone()).await?;

        // `stop` may have run while the driver was bootstrapping.
        let superseded = {
            let mut state = self.lock_state();
            if *state == PoolState::Starting {
                let cancel = CancellationToken::new();
                let refresh = RefreshLoop {
                    shared: self.shared.clone(),
                    driver: self.driver.clone(),
                    cancel: cancel.clone(),
                };
                let handle = tokio::spawn(refresh.run().instrument(self.span.clone()));
                *self.refresh.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(RefreshTask { cancel, handle });
                *state = PoolState::Running;
                false
            } else {
                true
            }
        };
        guard.disarm();

        if superseded {
            warn!(parent: &self.span, "node pool stopped during start");
            if let Err(e) = self.stop_driver().await {
                warn!(parent: &self.span, %e, "failed to stop driver after aborted start");
            }
            self.shared.clear();
            return Err(ClusterError::Stopped);
        }

        let _enter = self.span.enter();
        info!(node_id = %self.node_id(), "node pool started");
        Ok(())
    }

    async fn bootstrap(&self) -> Result<(), ClusterError> {
        if let Err(e) = self.driver.start().await {
            error!(%e, "failed to start membership driver");
            return Err(e.into());
        }
        self.driver_started.store(true, Ordering::Release);

        let node_id = self.driver.node_id();
        self.shared.write().node_id = node_id;

        match self.driver.get_nodes().await {
            Ok(members) => {
                self.shared.install(members);
                Ok(())
            }
            Err(e) => {
                error!(%e, "initial membership fetch failed");
                if let Err(stop_err) = self.stop_driver().await {
                    warn!(%stop_err, "failed to stop driver after startup error");
                }
                Err(e.into())
            }
        }
    }

    /// Stop the driver and record that it is no longer running.
    async fn stop_driver(&self) -> Result<(), DriverError> {
        let result = self.driver.stop().await;
        if result.is_ok() {
            self.driver_started.store(false, Ordering::Release);
        }
        result
    }

    /// Whether this node owns `job_name` under the current ring.
    ///
    /// Returns `false` before the first ring is built, after `stop`, and
    /// when membership is empty: denying ownership under ambiguity avoids
    /// running a job twice.
    pub fn check_job_available(&self, job_name: &str) -> bool {
        let snapshot = self.shared.read();

        let Some(ring) = snapshot.ring.as_ref() else {
            let _enter = self.span.enter();
            if self.state() == PoolState::Stopped {
                debug!(job = job_name, "ownership queried on a stopped pool");
            } else {
                error!(node_id = %snapshot.node_id, job = job_name, "ownership queried with no hash ring");
            }
            return false;
        };
        if ring.is_empty() {
            return false;
        }

        let owned = ring.get(job_name) == Some(snapshot.node_id.as_str());
        if owned {
            let _enter = self.span.enter();
            debug!(job = job_name, node_id = %snapshot.node_id, "job owned by this node");
        }
        owned
    }

    /// Return the member that owns `job_name`, if any ring is active.
    pub fn owner_of(&self, job_name: &str) -> Option<String> {
        let snapshot = self.shared.read();
        snapshot
            .ring
            .as_ref()
            .and_then(|ring| ring.get(job_name))
            .map(str::to_string)
    }

    /// Stop the refresh task and the driver, and clear membership history.
    ///
    /// Calling `stop` on a pool that never started (or whose start failed)
    /// is a no-op. After a cancelled `start` it stops the driver and leaves
    /// the pool in `Created`. A `start` still in flight is aborted and the
    /// pool ends `Stopped`. A driver stop error is returned after local
    /// cleanup.
    pub async fn stop(&self) -> Result<(), ClusterError> {
        let proceed = self.transition(|state| match state {
            PoolState::Running | PoolState::Starting => Ok(PoolState::Stopping),
            PoolState::Created | PoolState::Stopped => Ok(state),
            other => Err(ClusterError::InvalidState(other)),
        })?;

        match proceed {
            PoolState::Stopping => self.shutdown().instrument(self.span.clone()).await,
            PoolState::Created if self.driver_started.load(Ordering::Acquire) => {
                self.shared.clear();
                let result = self.stop_driver().instrument(self.span.clone()).await;
                let _enter = self.span.enter();
                match &result {
                    Ok(()) => info!("stopped driver left running by a cancelled start"),
                    Err(e) => error!(%e, "failed to stop membership driver"),
                }
                result.map_err(ClusterError::from)
            }
            _ => Ok(()),
        }
    }

    async fn shutdown(&self) -> Result<(), ClusterError> {
        let task = self
            .refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut task_result = Ok(());
        if let Some(RefreshTask { cancel, handle }) = task {
            cancel.cancel();
            if let Err(e) = handle.await {
                error!(%e, "refresh task ended abnormally");
                task_result = Err(ClusterError::Task(e));
            }
        }

        let driver_result = self.stop_driver().await;
        if let Err(e) = &driver_result {
            error!(%e, "failed to stop membership driver");
        }

        self.shared.clear();
        self.set_state(PoolState::Stopped);
        info!("node pool stopped");

        driver_result.map_err(ClusterError::from).and(task_result)
    }

    /// This process's identifier (empty before the first `start`).
    pub fn node_id(&self) -> String {
        self.shared.read().node_id.clone()
    }

    /// Member list the active ring was built from.
    pub fn members(&self) -> Vec<String> {
        self.shared.read().members.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        *self.lock_state()
    }

    /// The configured refresh period.
    pub fn refresh_interval(&self) -> Duration {
        self.shared.config.refresh_interval
    }

    /// Subscribe to ring rebuilds and refresh failures.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.event_tx.subscribe()
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PoolState) {
        *self.lock_state() = state;
    }

    /// Atomically move to the state chosen by `f`, returning it.
    fn transition<F>(&self, f: F) -> Result<PoolState, ClusterError>
    where
        F: FnOnce(PoolState) -> Result<PoolState, ClusterError>,
    {
        let mut state = self.lock_state();
        let next = f(*state)?;
        *state = next;
        Ok(next)
    }
}

impl Drop for NodePool {
    fn drop(&mut self) {
        // The refresh task never outlives its pool.
        if let Some(task) = self
            .refresh
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for NodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePool")
            .field("service", &self.shared.config.service_name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
