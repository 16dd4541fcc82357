//! Spawns and kills the worker executable.

use super::WorkerLauncher;
use crate::error::{DaemonError, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

pub struct ProcessLauncher {
    binary: Option<PathBuf>,
    args: Vec<String>,
    socket_path: PathBuf,
    pid: Mutex<Option<u32>>,
}

impl ProcessLauncher {
    pub fn new(binary: Option<PathBuf>, socket_path: PathBuf) -> Self {
        Self {
            binary,
            args: Vec::new(),
            socket_path,
            pid: Mutex::new(None),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Pid of the worker this launcher started, if it is still tracked.
    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    fn remove_socket(&self) {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!("[Worker] Removed socket {:?}", self.socket_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("[Worker] Failed to remove socket {:?}: {}", self.socket_path, e),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<()> {
        let binary = self
            .binary
            .as_ref()
            .ok_or_else(|| DaemonError::WorkerBinaryNotFound("no worker binary configured".into()))?;
        if !binary.exists() {
            return Err(DaemonError::WorkerBinaryNotFound(binary.display().to_string()));
        }

        let mut child = Command::new(binary)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| DaemonError::WorkerLaunchFailed(format!("{}: {}", binary.display(), e)))?;

        let pid = child.id();
        *self.pid.lock() = pid;
        info!("[Worker] Launched {:?} (pid {:?})", binary, pid);

        // Reap in the background so a killed worker never lingers as a zombie
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!("[Worker] pid {:?} exited: {}", pid, status),
                Err(e) => warn!("[Worker] Failed to wait for pid {:?}: {}", pid, e),
            }
        });
        Ok(())
    }

    async fn kill(&self) {
        // Socket first, so pending health checks fail fast instead of hanging
        self.remove_socket();

        let Some(pid) = self.pid.lock().take() else {
            return;
        };
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => info!("[Worker] Sent SIGKILL to pid {}", pid),
            Err(Errno::ESRCH) => debug!("[Worker] pid {} already gone", pid),
            Err(e) => warn!("[Worker] Failed to kill pid {}: {}", pid, e),
        }
    }
}
