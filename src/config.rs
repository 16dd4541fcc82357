//! Daemon configuration.
//!
//! Configuration lives in `config.json` under the per-application config
//! directory. A missing or unreadable file yields defaults; environment
//! variables (optionally from a `.env` file) override individual fields.

use crate::error::Result;
use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Directory name under the platform config dir.
pub const APP_DIR: &str = "home-bridge-daemon";

const CONFIG_FILE: &str = "config.json";
const CACHE_FILE: &str = "cache.json";
const EVENTS_FILE: &str = "events.jsonl";
const CONTROL_SOCKET: &str = "daemon.sock";
const WORKER_SOCKET: &str = "helper.sock";

/// Live configuration shared by all components.
pub type SharedConfig = Arc<RwLock<Config>>;

/// Outcome of reading a `.env` file.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DotenvReport {
    /// Variables exported into the process environment.
    pub applied: usize,
    /// Variables skipped because the environment already had them.
    pub overridden: usize,
    /// 1-based numbers of lines that were not `KEY=value`.
    pub malformed: Vec<usize>,
}

impl DotenvReport {
    /// Log what happened. Called once the logger is up.
    pub fn log(&self, path: &Path) {
        if self.applied > 0 || self.overridden > 0 {
            info!(
                "Loaded {} variable(s) from {:?} ({} already set)",
                self.applied, path, self.overridden
            );
        }
        for line in &self.malformed {
            warn!("Ignoring malformed line {} in {:?}", line, path);
        }
    }
}

/// `KEY=value` pairs from dotenv content. Values may be unquoted and contain
/// spaces; one layer of matching quotes is stripped. An `export ` prefix is
/// accepted. Returns the pairs and the line numbers that did not parse.
pub fn parse_dotenv(content: &str) -> (Vec<(String, String)>, Vec<usize>) {
    let mut pairs = Vec::new();
    let mut malformed = Vec::new();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            malformed.push(index + 1);
            continue;
        };
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            malformed.push(index + 1);
            continue;
        }
        pairs.push((key.to_string(), unquote(value.trim()).to_string()));
    }
    (pairs, malformed)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

/// Export variables from a dotenv file into the process environment without
/// replacing anything already set. A missing file is not an error.
///
/// Must run before the runtime starts any threads.
pub fn load_dotenv(path: &Path) -> Result<DotenvReport> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(DotenvReport::default()),
        Err(e) => return Err(e.into()),
    };

    let (pairs, malformed) = parse_dotenv(&content);
    let mut report = DotenvReport {
        malformed,
        ..Default::default()
    };
    for (key, value) in pairs {
        if std::env::var_os(&key).is_some() {
            report.overridden += 1;
            continue;
        }
        // SAFETY: called from main before the runtime spawns any threads
        unsafe { std::env::set_var(&key, &value) };
        report.applied += 1;
    }
    Ok(report)
}

/// Locations of every file the daemon owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    dir: PathBuf,
}

impl Paths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$XDG_CONFIG_HOME/home-bridge-daemon`, falling back to `~/.config`.
    pub fn default_location() -> Self {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join(APP_DIR))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn cache_file(&self) -> PathBuf {
        self.dir.join(CACHE_FILE)
    }

    pub fn events_file(&self) -> PathBuf {
        self.dir.join(EVENTS_FILE)
    }

    pub fn control_socket(&self) -> PathBuf {
        self.dir.join(CONTROL_SOCKET)
    }

    pub fn worker_socket(&self) -> PathBuf {
        self.dir.join(WORKER_SOCKET)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterMode {
    #[default]
    All,
    AllowList,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub enabled: bool,
    /// Event types the global webhook receives. `None` means all.
    pub events: Option<Vec<String>>,
}

impl WebhookConfig {
    /// URL to deliver to, if the global webhook is switched on.
    pub fn active_url(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.url.as_deref().filter(|url| !url.trim().is_empty())
    }

    pub fn accepts(&self, event_type: &str) -> bool {
        match &self.events {
            Some(events) if !events.is_empty() => events.iter().any(|e| e == event_type),
            _ => true,
        }
    }
}

/// A rule mapping event conditions to a webhook message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookTrigger {
    pub name: String,
    pub enabled: bool,
    pub accessory_id: Option<String>,
    pub accessory_type: Option<String>,
    pub scene_id: Option<String>,
    pub scene_name: Option<String>,
    pub characteristic: Option<String>,
    pub value: Option<String>,
    pub message: Option<String>,
}

impl Default for WebhookTrigger {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            accessory_id: None,
            accessory_type: None,
            scene_id: None,
            scene_name: None,
            characteristic: None,
            value: None,
            message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventLogConfig {
    pub enabled: bool,
    #[serde(rename = "maxSizeMB", alias = "maxSizeMb")]
    pub max_size_mb: u64,
    pub max_backups: u32,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: 50,
            max_backups: 3,
        }
    }
}

impl EventLogConfig {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorConfig {
    /// Worker executable. When unset the daemon only monitors.
    pub worker_binary: Option<PathBuf>,
    /// Worker socket. Defaults to `helper.sock` in the config dir.
    pub socket_path: Option<PathBuf>,
    pub check_interval_secs: u64,
    pub initial_delay_secs: u64,
    pub query_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_binary: None,
            socket_path: None,
            check_interval_secs: 30,
            initial_delay_secs: 2,
            query_timeout_secs: 5,
        }
    }
}

impl SupervisorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub home_id: Option<String>,
    pub filter_mode: FilterMode,
    pub allowed_accessory_ids: Vec<String>,
    pub temperature_unit: TemperatureUnit,
    pub webhook: WebhookConfig,
    pub triggers: Vec<WebhookTrigger>,
    pub event_log: EventLogConfig,
    pub cache_ttl_seconds: Option<u64>,
    pub supervisor: SupervisorConfig,
}

impl Config {
    /// Load from file. Missing or corrupt files yield defaults.
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<Config>(&bytes) {
                Ok(config) => {
                    info!(
                        "Loaded configuration from {:?} ({} triggers)",
                        path,
                        config.triggers.len()
                    );
                    config
                }
                Err(e) => {
                    warn!("Failed to parse {:?}, using defaults: {}", path, e);
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No configuration at {:?} (first run)", path);
                Self::default()
            }
            Err(e) => {
                warn!("Failed to read {:?}, using defaults: {}", path, e);
                Self::default()
            }
        }
    }

    /// Save atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Apply `HOME_BRIDGE_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("HOME_BRIDGE_WEBHOOK_URL") {
            self.webhook.url = Some(url);
            self.webhook.enabled = true;
        }
        if let Some(token) = lookup("HOME_BRIDGE_WEBHOOK_TOKEN") {
            self.webhook.token = Some(token);
        }
        if let Some(binary) = lookup("HOME_BRIDGE_WORKER_BINARY") {
            self.supervisor.worker_binary = Some(PathBuf::from(binary));
        }
        if let Some(enabled) = lookup("HOME_BRIDGE_EVENT_LOG_ENABLED")
            && let Some(b) = parse_bool(&enabled)
        {
            self.event_log.enabled = b;
        }
        if let Some(size) = lookup("HOME_BRIDGE_EVENT_LOG_MAX_SIZE_MB")
            && let Ok(s) = size.parse()
        {
            self.event_log.max_size_mb = s;
        }
        if let Some(backups) = lookup("HOME_BRIDGE_EVENT_LOG_MAX_BACKUPS")
            && let Ok(b) = backups.parse()
        {
            self.event_log.max_backups = b;
        }
        if let Some(ttl) = lookup("HOME_BRIDGE_CACHE_TTL_SECS")
            && let Ok(t) = ttl.parse()
        {
            self.cache_ttl_seconds = Some(t);
        }
        if let Some(interval) = lookup("HOME_BRIDGE_CHECK_INTERVAL_SECS")
            && let Ok(i) = interval.parse()
        {
            self.supervisor.check_interval_secs = i;
        }
    }

    /// Whether an accessory passes the configured filter.
    pub fn accessory_allowed(&self, accessory_id: &str) -> bool {
        match self.filter_mode {
            FilterMode::All => true,
            FilterMode::AllowList => self.allowed_accessory_ids.iter().any(|id| id == accessory_id),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
