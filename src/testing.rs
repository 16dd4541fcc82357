//! Test doubles shared by the daemon-level tests.

use crate::clock::ManualClock;
use crate::config::{Config, Paths};
use crate::daemon::Daemon;
use crate::error::Result;
use crate::notify::{WebhookPayload, WebhookTransport};
use crate::worker::{
    AccessoryState, HomeInfo, WorkerClient, WorkerConfig, WorkerLauncher, WorkerStatus,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::TempDir;

/// A ready worker with one home and no accessories.
pub struct IdleWorker;

#[async_trait]
impl WorkerClient for IdleWorker {
    async fn status_query(&self) -> Result<WorkerStatus> {
        Ok(WorkerStatus {
            ready: true,
            home_count: 1,
        })
    }

    async fn list_homes(&self) -> Result<Vec<HomeInfo>> {
        Ok(vec![HomeInfo {
            id: "h".into(),
            name: "Home".into(),
        }])
    }

    async fn get_config(&self) -> Result<WorkerConfig> {
        Ok(WorkerConfig::default())
    }

    async fn accessory_states(&self) -> Result<Vec<AccessoryState>> {
        Ok(Vec::new())
    }
}

pub struct NoopLauncher;

#[async_trait]
impl WorkerLauncher for NoopLauncher {
    async fn launch(&self) -> Result<()> {
        Ok(())
    }

    async fn kill(&self) {}
}

/// Keeps the message of every delivered payload.
#[derive(Default)]
pub struct RecordingTransport {
    pub messages: Mutex<Vec<String>>,
}

#[async_trait]
impl WebhookTransport for RecordingTransport {
    async fn post(&self, _url: &str, _token: Option<&str>, payload: &WebhookPayload) -> Result<()> {
        self.messages.lock().push(payload.message.clone());
        Ok(())
    }
}

/// A daemon over a temp dir, an idle worker and a recording transport.
pub fn test_daemon(config: Config) -> (TempDir, Arc<RecordingTransport>, Daemon) {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let daemon = Daemon::assemble(
        Paths::new(dir.path()),
        config,
        Arc::new(ManualClock::default()),
        Arc::new(IdleWorker),
        Arc::new(NoopLauncher),
        transport.clone(),
    );
    (dir, transport, daemon)
}
