use super::circuit::{CircuitBreaker, CircuitState};
use super::transport::{WebhookPayload, WebhookTransport};
use super::triggers::{trigger_matches, trigger_message};
use crate::clock::SharedClock;
use crate::config::SharedConfig;
use crate::error::DaemonError;
use crate::events::{EventRecord, EventSink};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;

pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// One planned webhook call.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub url: String,
    pub token: Option<String>,
    pub payload: WebhookPayload,
}

#[derive(Debug, Default)]
struct Counters {
    attempted: AtomicU64,
    skipped: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
    pub attempted: u64,
    pub skipped: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub circuit: CircuitState,
}

/// Turns logged events into fire-and-forget webhook deliveries.
///
/// The global webhook receives every event its filter accepts; each matching
/// trigger adds a labelled delivery to the same endpoint. All deliveries share
/// one circuit breaker.
pub struct NotificationDispatcher {
    config: SharedConfig,
    transport: Arc<dyn WebhookTransport>,
    breaker: Arc<CircuitBreaker>,
    counters: Arc<Counters>,
    tracker: TaskTracker,
    timeout: Duration,
    clock: SharedClock,
}

impl NotificationDispatcher {
    pub fn new(config: SharedConfig, transport: Arc<dyn WebhookTransport>, clock: SharedClock) -> Self {
        Self {
            config,
            transport,
            breaker: Arc::new(CircuitBreaker::new(clock.clone())),
            counters: Arc::new(Counters::default()),
            tracker: TaskTracker::new(),
            timeout: DELIVERY_TIMEOUT,
            clock,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Deliveries `record` should produce under the current configuration.
    pub fn plan(&self, record: &EventRecord) -> Vec<Delivery> {
        let config = self.config.read();
        let Some(url) = config
            .webhook
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
        else {
            return Vec::new();
        };
        let token = config.webhook.token.clone();
        let now = self.clock.now();
        let kind = record.kind();

        let mut deliveries = Vec::new();
        if config.webhook.active_url().is_some() && config.webhook.accepts(kind.as_ref()) {
            deliveries.push(Delivery {
                url: url.to_string(),
                token: token.clone(),
                payload: WebhookPayload {
                    message: record.describe(),
                    event: record.clone(),
                    trigger: None,
                    timestamp: now,
                },
            });
        }

        for trigger in config.triggers.iter().filter(|t| trigger_matches(t, record)) {
            debug!("[Webhook] Trigger '{}' matched {} event", trigger.name, kind);
            deliveries.push(Delivery {
                url: url.to_string(),
                token: token.clone(),
                payload: WebhookPayload {
                    message: trigger_message(trigger, record),
                    event: record.clone(),
                    trigger: Some(trigger.name.clone()),
                    timestamp: now,
                },
            });
        }
        deliveries
    }

    /// Plan and spawn deliveries for `record`. Never blocks on the network.
    pub fn dispatch(&self, record: &EventRecord) {
        let deliveries = self.plan(record);
        if deliveries.is_empty() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!(
                "[Webhook] No async runtime; dropping {} deliveries for {} event",
                deliveries.len(),
                record.kind()
            );
            return;
        };

        for delivery in deliveries {
            if !self.breaker.allow_attempt() {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                debug!("[Webhook] Circuit open; skipping delivery");
                continue;
            }
            self.counters.attempted.fetch_add(1, Ordering::Relaxed);
            self.tracker.spawn_on(
                deliver(
                    self.transport.clone(),
                    self.breaker.clone(),
                    self.counters.clone(),
                    delivery,
                    self.timeout,
                ),
                &handle,
            );
        }
    }

    /// Wait for every delivery spawned so far to finish or time out.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            attempted: self.counters.attempted.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            circuit: self.breaker.state(),
        }
    }
}

impl EventSink for NotificationDispatcher {
    fn on_event(&self, record: &EventRecord) {
        self.dispatch(record);
    }
}

async fn deliver(
    transport: Arc<dyn WebhookTransport>,
    breaker: Arc<CircuitBreaker>,
    counters: Arc<Counters>,
    delivery: Delivery,
    timeout: Duration,
) {
    let result = match tokio::time::timeout(
        timeout,
        transport.post(&delivery.url, delivery.token.as_deref(), &delivery.payload),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(DaemonError::WebhookTimeout(timeout)),
    };

    match result {
        Ok(()) => {
            breaker.record_success();
            counters.succeeded.fetch_add(1, Ordering::Relaxed);
            info!("[Webhook] Delivered: {}", delivery.payload.message);
        }
        Err(e) => {
            breaker.record_failure();
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!("[Webhook] Delivery failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{Config, WebhookTrigger};
    use crate::error::Result;
    use crate::events::{AccessoryChange, EventPayload};
    use crate::notify::circuit::CircuitStatus;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::{Mutex, RwLock};
    use tokio_test::assert_ok;

    /// Records every call; fails while `failing` is set.
    #[derive(Default)]
    struct FakeTransport {
        calls: Mutex<Vec<(String, Option<String>, WebhookPayload)>>,
        failing: Mutex<bool>,
        hang: bool,
    }

    #[async_trait]
    impl WebhookTransport for FakeTransport {
        async fn post(&self, url: &str, token: Option<&str>, payload: &WebhookPayload) -> Result<()> {
            self.calls
                .lock()
                .push((url.to_string(), token.map(str::to_string), payload.clone()));
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if *self.failing.lock() {
                Err(DaemonError::WebhookStatus(503))
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        config: SharedConfig,
        clock: Arc<ManualClock>,
        transport: Arc<FakeTransport>,
        dispatcher: NotificationDispatcher,
    }

    fn fixture(transport: FakeTransport, configure: impl FnOnce(&mut Config)) -> Fixture {
        let mut config = Config::default();
        config.webhook.url = Some("https://hooks.example/home".into());
        config.webhook.token = Some("t0ken".into());
        config.webhook.enabled = true;
        configure(&mut config);
        let config: SharedConfig = Arc::new(RwLock::new(config));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let transport = Arc::new(transport);
        let dispatcher = NotificationDispatcher::new(config.clone(), transport.clone(), clock.clone());
        Fixture {
            config,
            clock,
            transport,
            dispatcher,
        }
    }

    fn power_event(value: &str) -> EventRecord {
        EventRecord::new(
            Utc::now(),
            EventPayload::CharacteristicChange(AccessoryChange {
                accessory_id: "lamp".into(),
                accessory_name: "Lamp".into(),
                characteristic: "power".into(),
                value: value.into(),
                ..Default::default()
            }),
        )
    }

    fn scene_event() -> EventRecord {
        EventRecord::new(
            Utc::now(),
            EventPayload::SceneTriggered {
                scene_id: "s1".into(),
                scene_name: "Night".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_global_webhook_gets_every_event() {
        let f = fixture(FakeTransport::default(), |_| {});
        f.dispatcher.dispatch(&power_event("true"));
        f.dispatcher.dispatch(&scene_event());
        f.dispatcher.wait_idle().await;

        let calls = f.transport.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "https://hooks.example/home");
        assert_eq!(calls[0].1.as_deref(), Some("t0ken"));
        assert_eq!(calls[0].2.message, "Lamp power changed to true");
        assert_eq!(calls[0].2.trigger, None);
    }

    #[tokio::test]
    async fn test_event_filter_limits_global_webhook() {
        let f = fixture(FakeTransport::default(), |c| {
            c.webhook.events = Some(vec!["scene_triggered".into()]);
        });
        f.dispatcher.dispatch(&power_event("true"));
        f.dispatcher.dispatch(&scene_event());
        f.dispatcher.wait_idle().await;

        let calls = f.transport.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2.event.kind().to_string(), "scene_triggered");
    }

    #[tokio::test]
    async fn test_every_matching_trigger_fires() {
        let f = fixture(FakeTransport::default(), |c| {
            c.webhook.enabled = false;
            c.triggers = vec![
                WebhookTrigger {
                    name: "Any power".into(),
                    characteristic: Some("power".into()),
                    ..Default::default()
                },
                WebhookTrigger {
                    name: "Lamp on".into(),
                    accessory_id: Some("lamp".into()),
                    value: Some("true".into()),
                    message: Some("{accessory} switched on".into()),
                    ..Default::default()
                },
                WebhookTrigger {
                    name: "Night".into(),
                    scene_name: Some("night".into()),
                    ..Default::default()
                },
            ];
        });

        let planned = f.dispatcher.plan(&power_event("true"));
        let messages: Vec<_> = planned.iter().map(|d| d.payload.message.as_str()).collect();
        assert_eq!(
            messages,
            vec!["[Any power] Lamp power changed to true", "[Lamp on] Lamp switched on"]
        );

        f.dispatcher.dispatch(&power_event("false"));
        f.dispatcher.wait_idle().await;
        let calls = f.transport.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2.trigger.as_deref(), Some("Any power"));
    }

    #[tokio::test]
    async fn test_no_url_means_no_deliveries() {
        let f = fixture(FakeTransport::default(), |c| {
            c.webhook.url = None;
            c.triggers = vec![WebhookTrigger {
                name: "Any power".into(),
                characteristic: Some("power".into()),
                ..Default::default()
            }];
        });
        assert!(f.dispatcher.plan(&power_event("true")).is_empty());
    }

    #[tokio::test]
    async fn test_circuit_opens_and_recovers_after_cooldown() {
        let transport = FakeTransport::default();
        *transport.failing.lock() = true;
        let f = fixture(transport, |_| {});

        for _ in 0..5 {
            f.dispatcher.dispatch(&power_event("true"));
            f.dispatcher.wait_idle().await;
        }
        assert_eq!(f.transport.calls.lock().len(), 5);
        assert_eq!(f.dispatcher.stats().circuit.status, CircuitStatus::Open);

        // Open circuit: no network attempt at all
        f.dispatcher.dispatch(&power_event("true"));
        f.dispatcher.wait_idle().await;
        assert_eq!(f.transport.calls.lock().len(), 5);
        assert_eq!(f.dispatcher.stats().skipped, 1);

        f.clock.advance(chrono::Duration::seconds(60));
        *f.transport.failing.lock() = false;
        f.dispatcher.dispatch(&power_event("true"));
        f.dispatcher.wait_idle().await;

        assert_eq!(f.transport.calls.lock().len(), 6);
        let stats = f.dispatcher.stats();
        assert_eq!(stats.circuit.status, CircuitStatus::Closed);
        assert_eq!(stats.circuit.consecutive_failures, 0);
        assert_eq!(stats.attempted, 6);
        assert_eq!(stats.failed, 5);
        assert_eq!(stats.succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_endpoint_times_out_as_failure() {
        let transport = FakeTransport {
            hang: true,
            ..Default::default()
        };
        let f = fixture(transport, |_| {});
        f.dispatcher.dispatch(&scene_event());
        assert_eq!(f.dispatcher.in_flight(), 1);

        f.dispatcher.wait_idle().await;
        let stats = f.dispatcher.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.circuit.consecutive_failures, 1);
    }

    #[test]
    fn test_dispatch_outside_runtime_is_dropped() {
        let f = fixture(FakeTransport::default(), |_| {});
        f.dispatcher.dispatch(&scene_event());
        assert!(f.transport.calls.lock().is_empty());
        assert_eq!(f.dispatcher.stats().attempted, 0);
    }

    #[tokio::test]
    async fn test_config_changes_apply_to_next_event() {
        let f = fixture(FakeTransport::default(), |_| {});
        f.config.write().webhook.enabled = false;
        assert!(f.dispatcher.plan(&scene_event()).is_empty());

        f.config.write().webhook.enabled = true;
        assert_ok!(f.dispatcher.plan(&scene_event()).first().ok_or(()));
    }
}
