//! Owns and wires every long-lived component.

use crate::cache::{DEFAULT_TTL_SECS, StateCache};
use crate::clock::{SharedClock, system_clock};
use crate::config::{Config, Paths, SharedConfig, TemperatureUnit};
use crate::error::Result;
use crate::events::EventLog;
use crate::notify::{DELIVERY_TIMEOUT, HttpTransport, NotificationDispatcher, WebhookTransport};
use crate::supervisor::ProcessSupervisor;
use crate::worker::{ProcessLauncher, SocketWorkerClient, WorkerClient, WorkerLauncher};
use log::{info, warn};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// How long shutdown waits for in-flight webhook deliveries.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Daemon {
    paths: Paths,
    config: SharedConfig,
    cache: Arc<StateCache>,
    events: Arc<EventLog>,
    dispatcher: Arc<NotificationDispatcher>,
    supervisor: Arc<ProcessSupervisor>,
}

impl Daemon {
    /// Production wiring: worker over its Unix socket, webhooks over HTTP.
    pub fn new(paths: Paths, config: Config) -> Self {
        let socket_path = config
            .supervisor
            .socket_path
            .clone()
            .unwrap_or_else(|| paths.worker_socket());
        let client = Arc::new(SocketWorkerClient::new(
            socket_path.clone(),
            config.supervisor.query_timeout(),
        ));
        let launcher = Arc::new(
            ProcessLauncher::new(config.supervisor.worker_binary.clone(), socket_path.clone())
                .with_args(["--socket".to_string(), socket_path.display().to_string()]),
        );
        let transport = Arc::new(HttpTransport::new(DELIVERY_TIMEOUT));
        Self::assemble(paths, config, system_clock(), client, launcher, transport)
    }

    pub fn assemble(
        paths: Paths,
        config: Config,
        clock: SharedClock,
        client: Arc<dyn WorkerClient>,
        launcher: Arc<dyn WorkerLauncher>,
        transport: Arc<dyn WebhookTransport>,
    ) -> Self {
        let ttl = config.cache_ttl_seconds.unwrap_or(DEFAULT_TTL_SECS);
        let config: SharedConfig = Arc::new(RwLock::new(config));

        let cache = Arc::new(StateCache::load(paths.cache_file(), ttl, clock.clone()));
        let events = Arc::new(EventLog::new(
            paths.events_file(),
            config.clone(),
            clock.clone(),
        ));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            config.clone(),
            transport,
            clock.clone(),
        ));
        events.set_sink(dispatcher.clone());

        let supervisor = Arc::new(
            ProcessSupervisor::new(client, launcher, config.clone(), clock)
                .with_cache(cache.clone())
                .with_event_log(events.clone()),
        );

        Self {
            paths,
            config,
            cache,
            events,
            dispatcher,
            supervisor,
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<StateCache> {
        &self.cache
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn start(&self) {
        self.supervisor.start_monitoring();
    }

    /// Stop supervision, then give in-flight deliveries a bounded grace period.
    pub async fn shutdown(&self) {
        self.supervisor.stop_monitoring().await;
        let pending = self.dispatcher.in_flight();
        if pending > 0 {
            info!("Waiting for {} webhook deliveries", pending);
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, self.dispatcher.wait_idle())
            .await
            .is_err()
        {
            warn!("Gave up on {} webhook deliveries", self.dispatcher.in_flight());
        }
    }

    pub fn save_config(&self) -> Result<()> {
        let config = self.config.read().clone();
        config.save(&self.paths.config_file())
    }

    /// Change the display unit. Formatted values in the cache are stale
    /// afterwards, so they are dropped. Returns whether anything changed.
    pub fn set_temperature_unit(&self, unit: TemperatureUnit) -> Result<bool> {
        {
            let mut config = self.config.write();
            if config.temperature_unit == unit {
                return Ok(false);
            }
            config.temperature_unit = unit;
        }
        info!("Temperature unit set to {:?}", unit);
        self.cache.invalidate_values();
        self.save_config()?;
        Ok(true)
    }
}
