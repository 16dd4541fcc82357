//! Circuit breaker shared by every webhook delivery.

use crate::clock::SharedClock;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;

pub const FAILURE_THRESHOLD: u32 = 5;
pub const COOLDOWN_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CircuitStatus {
    Closed,
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Counter and flag live under one lock so concurrent deliveries update them
/// together. The cooldown is checked lazily on the next attempt.
pub struct CircuitBreaker {
    state: Mutex<CircuitState>,
    threshold: u32,
    cooldown: Duration,
    clock: SharedClock,
}

impl CircuitBreaker {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_limits(FAILURE_THRESHOLD, Duration::seconds(COOLDOWN_SECS), clock)
    }

    pub fn with_limits(threshold: u32, cooldown: Duration, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(CircuitState::default()),
            threshold: threshold.max(1),
            cooldown,
            clock,
        }
    }

    /// Whether a delivery may go out now. Closes the circuit once the
    /// cooldown has passed.
    pub fn allow_attempt(&self) -> bool {
        let mut state = self.state.lock();
        if state.status == CircuitStatus::Closed {
            return true;
        }
        let now = self.clock.now();
        match state.opened_at {
            Some(opened_at) if now - opened_at < self.cooldown => false,
            _ => {
                *state = CircuitState::default();
                info!("[Webhook] Circuit closed after cooldown");
                true
            }
        }
    }

    pub fn record_success(&self) {
        self.state.lock().consecutive_failures = 0;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.status == CircuitStatus::Closed && state.consecutive_failures >= self.threshold {
            state.status = CircuitStatus::Open;
            state.opened_at = Some(self.clock.now());
            warn!(
                "[Webhook] Circuit opened after {} consecutive failures; pausing for {}s",
                state.consecutive_failures,
                self.cooldown.num_seconds()
            );
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().clone()
    }
}
