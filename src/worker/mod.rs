//! The worker process and the capabilities it exposes.
//!
//! The worker holds the live connection to the home-automation platform. The
//! daemon only needs a narrow view of it: a status query, the list of homes,
//! the worker's home selection, and a snapshot of accessory values for cache
//! warming.

mod client;
mod launcher;

pub use client::SocketWorkerClient;
pub use launcher::ProcessLauncher;

use crate::cache::CharacteristicValues;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Answer to a status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub ready: bool,
    pub home_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    #[serde(default)]
    pub default_home_id: Option<String>,
}

/// Current values of one accessory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessoryState {
    pub id: String,
    #[serde(default)]
    pub values: CharacteristicValues,
}

/// Queries the daemon can issue against a running worker.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn status_query(&self) -> Result<WorkerStatus>;

    async fn list_homes(&self) -> Result<Vec<HomeInfo>>;

    async fn get_config(&self) -> Result<WorkerConfig>;

    async fn accessory_states(&self) -> Result<Vec<AccessoryState>>;
}

/// Starts and stops the worker process.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Launch a new worker. A missing binary is an error the caller may ignore.
    async fn launch(&self) -> Result<()>;

    /// Best-effort termination. Never fails; an absent process is fine.
    async fn kill(&self);
}
