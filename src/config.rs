//! Configuration management for tagbox
//!
//! Supports TOML files, environment variable overrides and sensible defaults.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// External store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Prefix prepended to every tag name to form its store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Background replication to the external store
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Periodic local snapshots
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Query options
    #[serde(default)]
    pub query: QueryConfig,
}

/// External store configuration
#[derive(Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Redis server URL (e.g. "redis://localhost:6379")
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Password, if the server requires one
    #[serde(default)]
    pub password: Option<String>,

    /// Logical database number
    #[serde(default)]
    pub database: u32,

    /// Timeout for establishing the connection
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Timeout for individual commands
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Retries for transient command failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Replication configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    /// Replicate automatically after mutations
    #[serde(default = "default_true")]
    pub auto_replicate: bool,

    /// Debounce interval in milliseconds
    #[serde(default = "default_replication_interval_ms")]
    pub interval_ms: u64,

    /// Capacity of the replication trigger queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Snapshot configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotConfig {
    /// Enable periodic snapshots
    #[serde(default)]
    pub enabled: bool,

    /// Snapshot file path
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Interval between snapshots in seconds
    #[serde(default = "default_snapshot_interval_secs")]
    pub interval_secs: u64,
}

/// Query configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Cache query results (recognized, not acted upon by the core index)
    #[serde(default)]
    pub cache_results: bool,
}

// Default value functions
fn default_key_prefix() -> String { "tags:".to_string() }
fn default_store_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_connection_timeout_ms() -> u64 { 5_000 }
fn default_command_timeout_ms() -> u64 { 1_000 }
fn default_max_retries() -> u32 { 3 }
fn default_replication_interval_ms() -> u64 { 1_000 }
fn default_queue_capacity() -> usize { 100 }
fn default_snapshot_interval_secs() -> u64 { 300 }
fn default_true() -> bool { true }

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            key_prefix: default_key_prefix(),
            replication: ReplicationConfig::default(),
            snapshot: SnapshotConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            password: None,
            database: 0,
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            auto_replicate: true,
            interval_ms: default_replication_interval_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: None,
            interval_secs: default_snapshot_interval_secs(),
        }
    }
}

// Password must never reach logs
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &crate::store::util::redact_url(&self.url))
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("database", &self.database)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("command_timeout_ms", &self.command_timeout_ms)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl StoreConfig {
    /// Connection timeout as a `Duration`
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Command timeout as a `Duration`
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// URL with password and database folded in
    ///
    /// Values already present in `url` take precedence.
    pub fn connection_url(&self) -> Result<String> {
        let mut parsed = url::Url::parse(&self.url)
            .map_err(|e| Error::Configuration(format!("invalid store url: {}", e)))?;

        if let Some(password) = &self.password {
            if parsed.password().is_none() {
                parsed
                    .set_password(Some(password))
                    .map_err(|_| Error::Configuration("store url cannot carry a password".into()))?;
            }
        }

        if self.database != 0 && matches!(parsed.path(), "" | "/") {
            parsed.set_path(&format!("/{}", self.database));
        }

        Ok(parsed.to_string())
    }
}

impl ReplicationConfig {
    /// Debounce interval as a `Duration`
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl SnapshotConfig {
    /// Snapshot interval as a `Duration`
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Config {
    /// Config pointing at the given store URL
    pub fn with_url(url: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.store.url = url.into();
        config
    }

    /// Set the key prefix
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Enable or disable automatic replication
    pub fn auto_replicate(mut self, enabled: bool) -> Self {
        self.replication.auto_replicate = enabled;
        self
    }

    /// Set the replication debounce interval
    pub fn replication_interval(mut self, interval: Duration) -> Self {
        self.replication.interval_ms = interval.as_millis() as u64;
        self
    }

    /// Enable periodic snapshots to `path`
    pub fn snapshot(mut self, path: impl Into<PathBuf>, interval: Duration) -> Self {
        self.snapshot.enabled = true;
        self.snapshot.path = Some(path.into());
        self.snapshot.interval_secs = interval.as_secs().max(1);
        self
    }

    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Store
        if let Ok(url) = std::env::var("TAGBOX_STORE_URL") {
            self.store.url = url;
        }
        if let Ok(password) = std::env::var("TAGBOX_STORE_PASSWORD") {
            self.store.password = Some(password);
        }
        if let Ok(db) = std::env::var("TAGBOX_STORE_DB") {
            if let Ok(d) = db.parse() {
                self.store.database = d;
            }
        }

        if let Ok(prefix) = std::env::var("TAGBOX_KEY_PREFIX") {
            self.key_prefix = prefix;
        }

        // Replication
        if let Ok(auto) = std::env::var("TAGBOX_AUTO_REPLICATE") {
            if let Ok(a) = auto.parse() {
                self.replication.auto_replicate = a;
            }
        }

        // Snapshot
        if let Ok(path) = std::env::var("TAGBOX_SNAPSHOT_PATH") {
            self.snapshot.path = Some(PathBuf::from(path));
            self.snapshot.enabled = true;
        }
        if let Ok(secs) = std::env::var("TAGBOX_SNAPSHOT_INTERVAL_SECS") {
            if let Ok(s) = secs.parse() {
                self.snapshot.interval_secs = s;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.store.url.is_empty() {
            return Err(Error::Configuration("Store URL cannot be empty".to_string()));
        }
        if self.key_prefix.is_empty() {
            return Err(Error::Configuration("Key prefix cannot be empty".to_string()));
        }
        if self.store.command_timeout_ms == 0 || self.store.connection_timeout_ms == 0 {
            return Err(Error::Configuration("Store timeouts must be > 0".to_string()));
        }
        if self.replication.interval_ms == 0 {
            return Err(Error::Configuration(
                "Replication interval must be > 0".to_string(),
            ));
        }
        if self.replication.queue_capacity == 0 {
            return Err(Error::Configuration(
                "Replication queue capacity must be > 0".to_string(),
            ));
        }
        if self.snapshot.enabled {
            if self.snapshot.path.is_none() {
                return Err(Error::Configuration(
                    "Snapshots enabled without a snapshot path".to_string(),
                ));
            }
            if self.snapshot.interval_secs == 0 {
                return Err(Error::Configuration(
                    "Snapshot interval must be > 0".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents).map_err(|e| {
            Error::Configuration(format!("Failed to write config file {}: {}", path.display(), e))
        })
    }
}
