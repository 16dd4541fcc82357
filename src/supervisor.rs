//! Worker process supervision.
//!
//! The supervisor launches the worker, polls it on a fixed interval, and
//! restarts it when it stops answering. Automatic restarts are limited by a
//! sliding-window budget; once that is exhausted the worker is reported down
//! until an operator restarts it by hand. A worker that answers but reports no
//! homes is a platform problem and is never restarted.

use crate::cache::StateCache;
use crate::clock::SharedClock;
use crate::config::SharedConfig;
use crate::error::{DaemonError, Result};
use crate::events::EventLog;
use crate::warm::warm_cache;
use crate::worker::{HomeInfo, WorkerClient, WorkerLauncher, WorkerStatus};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// Consecutive failed checks before an automatic restart.
pub const FAILURE_THRESHOLD: u32 = 3;
/// Automatic restarts allowed per window.
pub const MAX_RESTARTS: usize = 5;
pub const RESTART_WINDOW_SECS: i64 = 15 * 60;

const NO_HOMES_REASON: &str =
    "No homes available. Check that the platform account is signed in and access is granted.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum WorkerPhase {
    Starting,
    Connected,
    WorkerDown,
    PlatformUnavailable { reason: String },
}

/// Observable supervisor state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerState {
    #[serde(flatten)]
    pub phase: WorkerPhase,
    /// Display names of the selected home(s); meaningful while connected.
    pub home_names: Vec<String>,
    pub consecutive_failures: u32,
    /// Instants of automatic restarts inside the budget window.
    pub restart_timestamps: Vec<DateTime<Utc>>,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self {
            phase: WorkerPhase::Starting,
            home_names: Vec::new(),
            consecutive_failures: 0,
            restart_timestamps: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Inner {
    state: WorkerState,
    /// Home count from the last successful ready check.
    last_home_count: Option<usize>,
    /// Cleared on every (re)launch so names are resolved again on connect.
    names_resolved: bool,
}

struct Monitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ProcessSupervisor {
    client: Arc<dyn WorkerClient>,
    launcher: Arc<dyn WorkerLauncher>,
    config: SharedConfig,
    clock: SharedClock,
    cache: Option<Arc<StateCache>>,
    events: Option<Arc<EventLog>>,
    /// Single writer for the state machine: health checks and manual
    /// restarts both run under it.
    inner: Mutex<Inner>,
    state_tx: watch::Sender<WorkerState>,
    monitor: parking_lot::Mutex<Option<Monitor>>,
}

impl ProcessSupervisor {
    pub fn new(
        client: Arc<dyn WorkerClient>,
        launcher: Arc<dyn WorkerLauncher>,
        config: SharedConfig,
        clock: SharedClock,
    ) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::default());
        Self {
            client,
            launcher,
            config,
            clock,
            cache: None,
            events: None,
            inner: Mutex::new(Inner::default()),
            state_tx,
            monitor: parking_lot::Mutex::new(None),
        }
    }

    /// Warm and invalidate `cache` as the worker connects and its topology changes.
    pub fn with_cache(mut self, cache: Arc<StateCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Record `homes_updated` events in `events`.
    pub fn with_event_log(mut self, events: Arc<EventLog>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> WorkerState {
        self.state_tx.borrow().clone()
    }

    /// Receiver notified after every state transition.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Launch the worker and start the health loop. A second call while
    /// monitoring is a no-op.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            debug!("[Supervisor] Already monitoring");
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.clone().run(cancel.clone()));
        *monitor = Some(Monitor { cancel, handle });
    }

    /// Stop the health loop and kill the worker. Safe to call repeatedly.
    pub async fn stop_monitoring(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(Monitor { cancel, handle }) = monitor {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("[Supervisor] Health loop ended abnormally: {}", e);
            }
            info!("[Supervisor] Monitoring stopped");
        }
        let _inner = self.inner.lock().await;
        self.launcher.kill().await;
    }

    /// Operator restart. Resets the failure count and never consumes the
    /// automatic restart budget.
    pub async fn restart_helper(&self) {
        let mut inner = self.inner.lock().await;
        info!("[Supervisor] Manual worker restart");
        inner.state.phase = WorkerPhase::Starting;
        inner.state.consecutive_failures = 0;
        inner.names_resolved = false;
        self.publish(&inner);
        self.relaunch().await;
    }

    /// Run one health check and apply the resulting transition.
    pub async fn check_health(&self) {
        let mut inner = self.inner.lock().await;
        let result = self.bounded(self.client.status_query()).await;
        match result {
            Ok(status) if status.ready => self.on_ready(&mut inner, status).await,
            Ok(status) if status.home_count == 0 => {
                if !matches!(inner.state.phase, WorkerPhase::PlatformUnavailable { .. }) {
                    warn!("[Supervisor] Worker is up but the platform reports no homes");
                }
                inner.state.phase = WorkerPhase::PlatformUnavailable {
                    reason: NO_HOMES_REASON.to_string(),
                };
            }
            Ok(status) => {
                debug!(
                    "[Supervisor] Worker still initializing ({} homes)",
                    status.home_count
                );
                inner.state.phase = WorkerPhase::Starting;
            }
            Err(e) => self.on_failure(&mut inner, e).await,
        }
        self.publish(&inner);
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        {
            let _inner = self.inner.lock().await;
            if let Err(e) = self.launcher.launch().await {
                warn!(
                    "[Supervisor] Worker not launched ({}); monitoring an external worker",
                    e
                );
            }
        }

        let (initial_delay, check_interval) = {
            let config = self.config.read();
            (
                config.supervisor.initial_delay(),
                config.supervisor.check_interval(),
            )
        };
        info!(
            "[Supervisor] Health checks every {:?} after {:?}",
            check_interval, initial_delay
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(initial_delay) => {}
        }

        let mut ticker = interval(check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.check_health() => {}
                    }
                }
            }
        }
    }

    async fn on_ready(&self, inner: &mut Inner, status: WorkerStatus) {
        if inner.state.phase != WorkerPhase::Connected {
            info!("[Supervisor] Worker connected ({} homes)", status.home_count);
        }
        inner.state.phase = WorkerPhase::Connected;
        inner.state.consecutive_failures = 0;

        let previous = inner.last_home_count.replace(status.home_count);
        let homes_changed = previous != Some(status.home_count);

        if (homes_changed || !inner.names_resolved)
            && let Some(names) = self.resolve_home_names().await
        {
            inner.state.home_names = names;
            inner.names_resolved = true;
        }

        if homes_changed {
            if let (Some(previous), Some(cache)) = (previous, &self.cache) {
                info!(
                    "[Supervisor] Home count changed {} -> {}",
                    previous, status.home_count
                );
                cache.invalidate_values();
            }
            let accessory_count = self.warm().await;
            if let Some(events) = &self.events {
                events.log_homes_updated(status.home_count, accessory_count);
            }
        } else if self.cache.as_ref().is_some_and(|cache| cache.is_stale()) {
            self.warm().await;
        }
    }

    async fn on_failure(&self, inner: &mut Inner, error: DaemonError) {
        inner.state.consecutive_failures = inner.state.consecutive_failures.saturating_add(1);
        warn!(
            "[Supervisor] Health check failed ({} in a row): {}",
            inner.state.consecutive_failures, error
        );
        if inner.state.phase == WorkerPhase::Connected {
            inner.state.phase = WorkerPhase::Starting;
        }

        if inner.state.consecutive_failures < FAILURE_THRESHOLD
            || inner.state.phase == WorkerPhase::WorkerDown
        {
            return;
        }

        let now = self.clock.now();
        let window = chrono::Duration::seconds(RESTART_WINDOW_SECS);
        inner
            .state
            .restart_timestamps
            .retain(|restarted| now.signed_duration_since(*restarted) < window);

        if inner.state.restart_timestamps.len() >= MAX_RESTARTS {
            error!(
                "[Supervisor] {} restarts in {} minutes; worker marked down until restarted manually",
                inner.state.restart_timestamps.len(),
                RESTART_WINDOW_SECS / 60
            );
            inner.state.phase = WorkerPhase::WorkerDown;
            return;
        }

        inner.state.restart_timestamps.push(now);
        inner.state.phase = WorkerPhase::Starting;
        inner.state.consecutive_failures = 0;
        inner.names_resolved = false;
        info!(
            "[Supervisor] Restarting worker ({}/{} in window)",
            inner.state.restart_timestamps.len(),
            MAX_RESTARTS
        );
        self.publish(inner);
        self.relaunch().await;
    }

    async fn relaunch(&self) {
        self.launcher.kill().await;
        if let Err(e) = self.launcher.launch().await {
            warn!("[Supervisor] Worker relaunch failed: {}", e);
        }
    }

    /// Names to display: the default home if the worker has one and it
    /// exists, otherwise every home. `None` if the homes could not be listed.
    async fn resolve_home_names(&self) -> Option<Vec<String>> {
        let homes = match self.bounded(self.client.list_homes()).await {
            Ok(homes) => homes,
            Err(e) => {
                warn!("[Supervisor] Failed to list homes: {}", e);
                return None;
            }
        };
        let default_home = match self.bounded(self.client.get_config()).await {
            Ok(config) => config.default_home_id,
            Err(e) => {
                debug!("[Supervisor] Worker config unavailable: {}", e);
                None
            }
        }
        .or_else(|| self.config.read().home_id.clone());

        Some(select_home_names(&homes, default_home.as_deref()))
    }

    /// Warm the cache if there is one. Returns the cached accessory count.
    async fn warm(&self) -> usize {
        let Some(cache) = &self.cache else {
            return 0;
        };
        match self
            .bounded(warm_cache(cache, self.client.as_ref(), &self.config))
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!("[Supervisor] Cache warm failed: {}", e);
                cache.cached_accessory_count()
            }
        }
    }

    async fn bounded<T>(&self, query: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.query_timeout();
        tokio::time::timeout(timeout, query)
            .await
            .unwrap_or(Err(DaemonError::WorkerTimeout(timeout)))
    }

    fn query_timeout(&self) -> Duration {
        self.config.read().supervisor.query_timeout()
    }

    fn publish(&self, inner: &Inner) {
        self.state_tx.send_replace(inner.state.clone());
    }
}

fn select_home_names(homes: &[HomeInfo], default_home: Option<&str>) -> Vec<String> {
    if let Some(id) = default_home
        && let Some(home) = homes.iter().find(|home| home.id == id)
    {
        return vec![home.name.clone()];
    }
    homes.iter().map(|home| home.name.clone()).collect()
}
