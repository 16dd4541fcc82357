//! Local control socket.
//!
//! Adapters (menu bar, CLI, automation bridges) talk to the daemon over a Unix
//! socket in the config dir, one JSON request per line and one JSON response
//! per line. Binding the socket also acts as the single-instance lock: a live
//! socket means another daemon is running, a dead one is stale and replaced.

use crate::config::TemperatureUnit;
use crate::daemon::Daemon;
use crate::events::{EventKind, EventPayload};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;
const DEFAULT_EVENT_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum ControlSocketError {
    /// Another daemon holds the socket.
    #[error("another instance is already running")]
    AlreadyRunning,

    #[error("failed to bind control socket: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    GetState,
    RestartHelper,
    CacheStatus,
    CachedState,
    ReadEvents,
    LogStats,
    PurgeEvents,
    RecordEvent,
    DispatcherStats,
    SetTemperatureUnit,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedStateParams {
    accessory_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ReadEventsParams {
    since: Option<DateTime<Utc>>,
    limit: Option<usize>,
    #[serde(rename = "type")]
    kind: Option<EventKind>,
}

#[derive(Debug, Deserialize)]
struct RecordEventParams {
    event: EventPayload,
}

#[derive(Debug, Deserialize)]
struct TemperatureUnitParams {
    unit: TemperatureUnit,
}

/// Bound control socket. The socket file is removed on drop.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind at `path`, replacing a stale socket left by a killed daemon.
    pub fn bind(path: &Path) -> Result<Self, ControlSocketError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if path.exists() {
            match std::os::unix::net::UnixStream::connect(path) {
                Ok(_) => return Err(ControlSocketError::AlreadyRunning),
                Err(_) => {
                    debug!("[Control] Removing stale socket {:?}", path);
                    let _ = std::fs::remove_file(path);
                }
            }
        }

        match UnixListener::bind(path) {
            Ok(listener) => {
                info!("[Control] Listening on {:?}", path);
                Ok(Self {
                    listener,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(ControlSocketError::AlreadyRunning),
            Err(e) => Err(ControlSocketError::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `cancel` fires.
    pub async fn serve(&self, daemon: Arc<Daemon>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let daemon = daemon.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                result = handle_connection(stream, daemon) => {
                                    if let Err(e) = result {
                                        debug!("[Control] Connection closed: {}", e);
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => warn!("[Control] Accept failed: {}", e),
                }
            }
        }
        info!("[Control] Stopped");
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_connection(stream: UnixStream, daemon: Arc<Daemon>) -> io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = (&mut reader)
            .take(MAX_REQUEST_BYTES as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            return Ok(());
        }
        if line.len() > MAX_REQUEST_BYTES && line.last() != Some(&b'\n') {
            warn!("[Control] Dropping client after oversized request");
            let response =
                Response::error(None, "request_too_large", "request exceeded maximum size");
            write_response(&mut write_half, &response).await?;
            return Ok(());
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let response = match serde_json::from_slice::<Request>(&line) {
            Ok(request) => {
                debug!("[Control] {:?} (id {:?})", request.method, request.id);
                handle_request(request, &daemon).await
            }
            Err(e) => Response::error(None, "invalid_request", format!("invalid request: {}", e)),
        };
        write_response(&mut write_half, &response).await?;
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> io::Result<()> {
    let mut payload = serde_json::to_vec(response)?;
    payload.push(b'\n');
    writer.write_all(&payload).await
}

fn params<T: DeserializeOwned>(request: &Request) -> Result<T, Response> {
    let value = request.params.clone().unwrap_or_else(|| json!({}));
    serde_json::from_value(value)
        .map_err(|e| Response::error(request.id.clone(), "invalid_params", e.to_string()))
}

fn to_data<T: Serialize>(id: Option<String>, value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(data) => Response::ok(id, data),
        Err(e) => Response::error(id, "serialization_failed", e.to_string()),
    }
}

pub async fn handle_request(request: Request, daemon: &Daemon) -> Response {
    let id = request.id.clone();
    match request.method {
        Method::GetState => to_data(id, &daemon.supervisor().state()),
        Method::RestartHelper => {
            daemon.supervisor().restart_helper().await;
            to_data(id, &daemon.supervisor().state())
        }
        Method::CacheStatus => {
            let cache = daemon.cache();
            Response::ok(
                id,
                json!({
                    "accessoryCount": cache.cached_accessory_count(),
                    "stale": cache.is_stale(),
                    "lastWarmed": cache.last_warmed(),
                }),
            )
        }
        Method::CachedState => match params::<CachedStateParams>(&request) {
            Ok(p) => to_data(id, &daemon.cache().cached_state(&p.accessory_id)),
            Err(response) => response,
        },
        Method::ReadEvents => match params::<ReadEventsParams>(&request) {
            Ok(p) => to_data(
                id,
                &daemon.events().read_events(
                    p.since,
                    p.limit.unwrap_or(DEFAULT_EVENT_LIMIT),
                    p.kind,
                ),
            ),
            Err(response) => response,
        },
        Method::LogStats => to_data(id, &daemon.events().log_stats()),
        Method::PurgeEvents => match daemon.events().purge() {
            Ok(()) => Response::ok(id, json!({"purged": true})),
            Err(e) => Response::error(id, "purge_failed", e.to_string()),
        },
        Method::RecordEvent => match params::<RecordEventParams>(&request) {
            Ok(p) => {
                let record = daemon.events().log(p.event);
                Response::ok(id, json!({"recorded": record.is_some()}))
            }
            Err(response) => response,
        },
        Method::DispatcherStats => to_data(id, &daemon.dispatcher().stats()),
        Method::SetTemperatureUnit => match params::<TemperatureUnitParams>(&request) {
            Ok(p) => match daemon.set_temperature_unit(p.unit) {
                Ok(changed) => Response::ok(id, json!({"changed": changed})),
                Err(e) => Response::error(id, "config_save_failed", e.to_string()),
            },
            Err(response) => response,
        },
    }
}
