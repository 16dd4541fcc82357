use super::{AccessoryChange, EventKind, EventPayload, EventRecord, EventSink};
use crate::clock::SharedClock;
use crate::config::SharedConfig;
use crate::error::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Snapshot of the log's footprint on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStats {
    pub enabled: bool,
    pub file_count: usize,
    pub total_size_bytes: u64,
    #[serde(rename = "maxSizeMB")]
    pub max_size_mb: u64,
    pub max_backups: u32,
    pub path: PathBuf,
}

/// Append-only, size-rotated JSON-lines log.
pub struct EventLog {
    path: PathBuf,
    config: SharedConfig,
    clock: SharedClock,
    /// Serializes rotation and append.
    write_lock: Mutex<()>,
    sink: RwLock<Option<Arc<dyn EventSink>>>,
}

impl EventLog {
    pub fn new(path: PathBuf, config: SharedConfig, clock: SharedClock) -> Self {
        Self {
            path,
            config,
            clock,
            write_lock: Mutex::new(()),
            sink: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Install the receiver notified after every append.
    pub fn set_sink(&self, sink: Arc<dyn EventSink>) {
        *self.sink.write() = Some(sink);
    }

    pub fn log_characteristic_change(&self, change: AccessoryChange) {
        self.log(EventPayload::CharacteristicChange(change));
    }

    pub fn log_accessory_controlled(&self, change: AccessoryChange) {
        self.log(EventPayload::AccessoryControlled(change));
    }

    pub fn log_scene_triggered(&self, scene_id: impl Into<String>, scene_name: impl Into<String>) {
        self.log(EventPayload::SceneTriggered {
            scene_id: scene_id.into(),
            scene_name: scene_name.into(),
        });
    }

    pub fn log_homes_updated(&self, home_count: usize, accessory_count: usize) {
        self.log(EventPayload::HomesUpdated {
            home_count,
            accessory_count,
        });
    }

    /// Stamp a payload with the current time and append it.
    ///
    /// Returns the record when logging is enabled.
    pub fn log(&self, payload: EventPayload) -> Option<EventRecord> {
        if !self.config.read().event_log.enabled {
            return None;
        }
        let record = EventRecord::new(self.clock.now(), payload);
        self.append(&record);
        Some(record)
    }

    fn append(&self, record: &EventRecord) {
        let (max_bytes, max_backups) = {
            let config = self.config.read();
            (
                config.event_log.max_size_bytes(),
                config.event_log.max_backups,
            )
        };

        let mut line = match serde_json::to_vec(record) {
            Ok(line) => line,
            Err(e) => {
                warn!("[EventLog] Failed to serialize {} event: {}", record.kind(), e);
                return;
            }
        };
        line.push(b'\n');

        {
            let _guard = self.write_lock.lock();
            if let Err(e) = self.rotate_if_needed(max_bytes, max_backups) {
                warn!("[EventLog] Rotation failed: {}", e);
            }
            if let Err(e) = self.write_line(&line) {
                warn!("[EventLog] Failed to append {} event: {}", record.kind(), e);
            }
        }

        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink.on_event(record);
        }
    }

    fn write_line(&self, line: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        // One write per record keeps lines whole under O_APPEND
        file.write_all(line)?;
        Ok(())
    }

    fn rotate_if_needed(&self, max_bytes: u64, max_backups: u32) -> Result<()> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if size < max_bytes {
            return Ok(());
        }

        if max_backups == 0 {
            fs::remove_file(&self.path)?;
            info!("[EventLog] Truncated {:?} at {} bytes", self.path, size);
            return Ok(());
        }

        remove_if_exists(&self.backup_path(max_backups))?;
        for index in (1..max_backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                fs::rename(&from, self.backup_path(index + 1))?;
            }
        }
        fs::rename(&self.path, self.backup_path(1))?;
        info!("[EventLog] Rotated {:?} at {} bytes", self.path, size);
        Ok(())
    }

    fn backup_path(&self, index: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    /// Numbered backups present on disk, whatever the current limit.
    fn existing_backups(&self) -> Vec<PathBuf> {
        let (Some(dir), Some(stem)) = (self.path.parent(), self.path.file_name()) else {
            return Vec::new();
        };
        let prefix = format!("{}.", stem.to_string_lossy());
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };

        let mut backups: Vec<PathBuf> = entries
            .flatten()
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.strip_prefix(&prefix)
                    .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
            })
            .map(|entry| entry.path())
            .collect();
        backups.sort();
        backups
    }

    /// Newest-first scan of the active file.
    ///
    /// Stops at the first record older than `since`. Lines that do not parse
    /// (including a partially written last line) are skipped.
    pub fn read_events(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
        kind: Option<EventKind>,
    ) -> Vec<EventRecord> {
        if limit == 0 {
            return Vec::new();
        }
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("[EventLog] Failed to read {:?}: {}", self.path, e);
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for line in content.split(|b| *b == b'\n').rev() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let record: EventRecord = match serde_json::from_slice(line) {
                Ok(record) => record,
                Err(e) => {
                    debug!("[EventLog] Skipping malformed line: {}", e);
                    continue;
                }
            };
            if let Some(since) = since
                && record.timestamp < since
            {
                break;
            }
            if kind.is_some_and(|kind| record.kind() != kind) {
                continue;
            }
            events.push(record);
            if events.len() >= limit {
                break;
            }
        }
        events
    }

    pub fn log_stats(&self) -> LogStats {
        let config = self.config.read().event_log.clone();
        let mut file_count = 0;
        let mut total_size_bytes = 0;
        for path in std::iter::once(self.path.clone()).chain(self.existing_backups()) {
            if let Ok(meta) = fs::metadata(&path) {
                file_count += 1;
                total_size_bytes += meta.len();
            }
        }
        LogStats {
            enabled: config.enabled,
            file_count,
            total_size_bytes,
            max_size_mb: config.max_size_mb,
            max_backups: config.max_backups,
            path: self.path.clone(),
        }
    }

    /// Delete the active log and every backup.
    pub fn purge(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        remove_if_exists(&self.path)?;
        for backup in self.existing_backups() {
            remove_if_exists(&backup)?;
        }
        info!("[EventLog] Purged {:?}", self.path);
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
