//! Configuration management for ClipMirror
//!
//! This module handles loading, validating, and managing configuration
//! for one endpoint and for the relay.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::content::{BlobKeys, WireFormat};
use crate::transport::protocol::RELAY_PATH;
use crate::transport::{ReconnectionConfig, RelayClientConfig};

/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "CLIPMIRROR_CONFIG";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML rendering error
    #[error("Failed to render TOML: {0}")]
    Render(#[from] toml::ser::Error),

    /// Validation error
    #[error("Config validation failed: {0}")]
    Validation(String),
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Identity of this endpoint (defaults to the host name)
    #[serde(default = "default_local_id")]
    pub local_id: String,

    /// Identity of the peer endpoint
    #[serde(default)]
    pub remote_id: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Sync engine configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Relay configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// Blob store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Local changes are ignored for this long after applying a peer's change
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,

    /// How often the system clipboard is checked for changes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Message encoding; both endpoints must agree
    #[serde(default)]
    pub wire_format: WireFormat,

    /// Naming of file blobs in the store
    #[serde(default)]
    pub blob_keys: BlobKeys,

    /// Where files fetched from the peer are written
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
}

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay URL endpoints connect to
    #[serde(default = "default_relay_url")]
    pub url: String,

    /// Address `clipmirror relay` listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Limit on waiting for a relay reply (0 = wait forever)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Blob memory a relay keeps before dropping the oldest blobs
    #[serde(default = "default_blob_capacity_mb")]
    pub blob_capacity_mb: u64,

    /// Reconnection after the relay connection drops
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Consecutive failures before giving up (0 = never)
    #[serde(default)]
    pub max_attempts: u32,
}

/// Blob store backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Blobs held by the relay
    #[default]
    Relay,
    /// One file per blob under a shared directory
    Directory,
}

/// Blob store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Root of the directory backend
    #[serde(default = "default_store_directory")]
    pub directory: PathBuf,
}

// Default value functions
fn default_local_id() -> String {
    gethostname::gethostname()
        .to_string_lossy()
        .replace(['$', '/'], "-")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_quiet_period_ms() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("clipmirror")
}

fn default_relay_url() -> String {
    format!("ws://127.0.0.1:8484{}", RELAY_PATH)
}

fn default_listen_addr() -> String {
    "0.0.0.0:8484".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_blob_capacity_mb() -> u64 {
    512
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_store_directory() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("clipmirror").join("store"))
        .unwrap_or_else(|| PathBuf::from("~/.local/share/clipmirror/store"))
}

// Default implementations
impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            wire_format: WireFormat::default(),
            blob_keys: BlobKeys::default(),
            scratch_dir: default_scratch_dir(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            listen_addr: default_listen_addr(),
            request_timeout_ms: default_request_timeout_ms(),
            blob_capacity_mb: default_blob_capacity_mb(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: 0,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            directory: default_store_directory(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_id: default_local_id(),
            remote_id: String::new(),
            log_level: default_log_level(),
            sync: SyncConfig::default(),
            relay: RelayConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Checks in order:
    /// 1. Path from CLIPMIRROR_CONFIG environment variable
    /// 2. <config dir>/clipmirror/config.toml
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_path() {
            Some(path) => Self::load_from_path(&path),
            None => {
                let mut config = Self::default();
                config.expand_paths();
                Ok(config)
            }
        }
    }

    /// Load configuration with an optional explicit path
    pub fn load_config(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        match config_path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML string
    ///
    /// Settings are validated here; endpoint identities are checked by
    /// [`Config::validate`] because a relay host does not need them.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(toml_str)?;
        config.expand_paths();
        config.validate_settings()?;
        Ok(config)
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("clipmirror").join("config.toml"))
    }

    /// Find configuration file path
    fn find_config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        Self::default_path().filter(|path| path.exists())
    }

    /// Expand tilde in paths
    fn expand_paths(&mut self) {
        self.sync.scratch_dir = expand_path(&self.sync.scratch_dir);
        self.store.directory = expand_path(&self.store.directory);
    }

    /// Validate everything an endpoint needs
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_settings()?;
        self.validate_identity()
    }

    fn validate_identity(&self) -> Result<(), ConfigError> {
        check_id("local_id", &self.local_id)?;
        check_id("remote_id", &self.remote_id)?;
        if self.local_id == self.remote_id {
            return Err(ConfigError::Validation(format!(
                "local_id and remote_id must differ (both are {:?})",
                self.local_id
            )));
        }
        Ok(())
    }

    fn validate_settings(&self) -> Result<(), ConfigError> {
        // Quiet period range (50ms to 10s)
        if !(50..=10_000).contains(&self.sync.quiet_period_ms) {
            return Err(ConfigError::Validation(
                "quiet_period_ms must be between 50 and 10000".to_string(),
            ));
        }

        // The poller must see our own write inside the quiet period
        if self.sync.poll_interval_ms == 0
            || self.sync.poll_interval_ms >= self.sync.quiet_period_ms
        {
            return Err(ConfigError::Validation(format!(
                "poll_interval_ms must be between 1 and quiet_period_ms ({})",
                self.sync.quiet_period_ms
            )));
        }

        if !self.relay.url.starts_with("ws://") && !self.relay.url.starts_with("wss://") {
            return Err(ConfigError::Validation(format!(
                "relay url must start with ws:// or wss://, got {:?}",
                self.relay.url
            )));
        }

        if self.relay.blob_capacity_mb == 0 {
            return Err(ConfigError::Validation(
                "relay blob_capacity_mb must be positive".to_string(),
            ));
        }

        let reconnect = &self.relay.reconnect;
        if reconnect.initial_delay_ms == 0 || reconnect.initial_delay_ms > reconnect.max_delay_ms
        {
            return Err(ConfigError::Validation(
                "reconnect initial_delay_ms must be positive and not exceed max_delay_ms"
                    .to_string(),
            ));
        }

        Ok(())
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.sync.quiet_period_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync.poll_interval_ms)
    }

    /// Relay reply timeout; `None` when disabled
    pub fn request_timeout(&self) -> Option<Duration> {
        match self.relay.request_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Relay blob memory in bytes
    pub fn blob_capacity(&self) -> usize {
        usize::try_from(self.relay.blob_capacity_mb.saturating_mul(1024 * 1024))
            .unwrap_or(usize::MAX)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.sync.scratch_dir.clone()
    }

    pub fn reconnection(&self) -> ReconnectionConfig {
        let reconnect = &self.relay.reconnect;
        ReconnectionConfig {
            max_attempts: reconnect.max_attempts,
            initial_delay: Duration::from_millis(reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(reconnect.max_delay_ms),
            ..ReconnectionConfig::default()
        }
    }

    /// Relay client settings for this endpoint
    pub fn relay_client_config(&self) -> RelayClientConfig {
        RelayClientConfig {
            request_timeout: self.request_timeout(),
            reconnect: self.reconnection(),
            ..RelayClientConfig::new(&self.relay.url, &self.local_id)
        }
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Save configuration to default location
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::default_path().ok_or_else(|| {
            ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not find config directory",
            ))
        })?;
        self.save_to(&path)
    }

    /// Write the example configuration to `path`
    pub fn write_example(path: &Path, force: bool) -> Result<(), ConfigError> {
        if !force && path.exists() {
            return Err(ConfigError::Validation(
                "Config file already exists. Use --force to overwrite.".to_string(),
            ));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, Self::generate_example())?;
        Ok(())
    }

    /// Generate example configuration file
    pub fn generate_example() -> String {
        let config = Config::default();

        format!(
            r#"# ClipMirror Configuration File
# Location: ~/.config/clipmirror/config.toml

# Identity of this endpoint
local_id = "{}"
# Identity of the peer endpoint (required)
remote_id = ""

# Logging level (trace, debug, info, warn, error)
log_level = "{}"

# Sync engine settings
[sync]
# Ignore local clipboard changes this long after applying a peer's change
quiet_period_ms = {}
# How often the clipboard is checked for changes (must be below quiet_period_ms)
poll_interval_ms = {}
# Message encoding: "legacy" (sentinel grammar) or "envelope" (tagged JSON)
wire_format = "legacy"
# File blob names: "bare" (file name) or "per_transfer" (<id>/<uuid>/<name>)
blob_keys = "bare"
# Where files received from the peer are written
scratch_dir = '{}'

# Relay settings
[relay]
url = "{}"
# Address `clipmirror relay` listens on
listen_addr = "{}"
# Give up waiting for a relay reply after this long (0 = never)
request_timeout_ms = {}
# Blob memory the relay keeps; the oldest blobs are dropped beyond it
blob_capacity_mb = {}

[relay.reconnect]
initial_delay_ms = {}
max_delay_ms = {}
# Consecutive failures before giving up (0 = never)
max_attempts = {}

# Blob store settings
[store]
# "relay" keeps blobs on the relay, "directory" uses a shared folder
backend = "relay"
directory = '{}'
"#,
            config.local_id,
            config.log_level,
            config.sync.quiet_period_ms,
            config.sync.poll_interval_ms,
            config.sync.scratch_dir.display(),
            config.relay.url,
            config.relay.listen_addr,
            config.relay.request_timeout_ms,
            config.relay.blob_capacity_mb,
            config.relay.reconnect.initial_delay_ms,
            config.relay.reconnect.max_delay_ms,
            config.relay.reconnect.max_attempts,
            config.store.directory.display(),
        )
    }
}

fn check_id(field: &str, id: &str) -> Result<(), ConfigError> {
    if id.trim().is_empty() {
        return Err(ConfigError::Validation(format!("{} must be set", field)));
    }
    if id.contains(['$', '/']) {
        return Err(ConfigError::Validation(format!(
            "{} must not contain '$' or '/', got {:?}",
            field, id
        )));
    }
    Ok(())
}

/// Expand tilde in path
fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    let expanded = shellexpand::tilde(path_str.as_ref());
    PathBuf::from(expanded.into_owned())
}
