//! Newline-delimited JSON client for the worker's Unix socket.

use super::{AccessoryState, HomeInfo, WorkerClient, WorkerConfig, WorkerStatus};
use crate::error::{DaemonError, Result};
use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Request message for the worker socket.
#[derive(Debug, Serialize)]
struct WorkerRequest<'a> {
    command: &'a str,
}

/// Response envelope from the worker.
#[derive(Debug, Deserialize)]
struct WorkerResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// One connection per request; each request bounded by `timeout`.
pub struct SocketWorkerClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl SocketWorkerClient {
    pub fn new(socket_path: PathBuf, timeout: Duration) -> Self {
        Self {
            socket_path,
            timeout,
        }
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    async fn request<T: DeserializeOwned>(&self, command: &str) -> Result<T> {
        match tokio::time::timeout(self.timeout, self.exchange(command)).await {
            Ok(result) => result,
            Err(_) => Err(DaemonError::WorkerTimeout(self.timeout)),
        }
    }

    async fn exchange<T: DeserializeOwned>(&self, command: &str) -> Result<T> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| DaemonError::WorkerQuery(format!("connect {:?}: {}", self.socket_path, e)))?;
        let (read_half, mut write_half) = stream.into_split();

        let mut payload = serde_json::to_vec(&WorkerRequest { command })?;
        payload.push(b'\n');
        write_half.write_all(&payload).await?;
        write_half.flush().await?;

        let mut line = String::new();
        let read = BufReader::new(read_half).read_line(&mut line).await?;
        if read == 0 {
            return Err(DaemonError::WorkerQuery(format!(
                "worker closed the connection during '{}'",
                command
            )));
        }
        debug!("[Worker] {} -> {}", command, line.trim_end());

        let response: WorkerResponse = serde_json::from_str(&line)?;
        if let Some(error) = response.error {
            return Err(DaemonError::WorkerRejected(error));
        }
        let result = response.result.unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(result)?)
    }
}

#[async_trait]
impl WorkerClient for SocketWorkerClient {
    async fn status_query(&self) -> Result<WorkerStatus> {
        self.request("status").await
    }

    async fn list_homes(&self) -> Result<Vec<HomeInfo>> {
        self.request("list_homes").await
    }

    async fn get_config(&self) -> Result<WorkerConfig> {
        self.request("get_config").await
    }

    async fn accessory_states(&self) -> Result<Vec<AccessoryState>> {
        self.request("accessory_states").await
    }
}
