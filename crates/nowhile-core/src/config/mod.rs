//! Configuration management for Nowhile.
//!
//! This module handles loading, saving, and validating Nowhile configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/nowhile/config.toml` |
//! | macOS | `~/Library/Application Support/com.nowhile.Nowhile/config.toml` |
//! | Windows | `%APPDATA%\nowhile\Nowhile\config\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use nowhile_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Display name: {}", config.general.display_name);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest accepted timer setting.
const MAX_TIMER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Main configuration struct for Nowhile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Connection supervision settings
    pub connection: ConnectionConfig,
    /// Transfer settings
    pub transfer: TransferConfig,
    /// Received file storage settings
    pub storage: StorageConfig,
    /// Recent peer settings
    pub recent: RecentConfig,
}

/// General configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Name shown to other peers
    pub display_name: String,
    /// Override for the data directory
    pub data_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            display_name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "Nowhile Device".to_string()),
            data_dir: None,
        }
    }
}

/// Connection supervision options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Spacing between endpoint reconnection attempts
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    /// Delay before re-opening an endpoint the transport closed
    #[serde(with = "humantime_serde")]
    pub reopen_delay: Duration,
    /// Registration attempts per identity before regenerating it
    pub identity_attempts: u32,
    /// Delay between registration attempts with the same identity
    #[serde(with = "humantime_serde")]
    pub identity_retry_delay: Duration,
    /// Identity regenerations before giving up
    pub max_identity_regenerations: u32,
    /// How long to wait for the endpoint to open
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
    /// Maximum simultaneous peer links
    pub max_peers: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(crate::DEFAULT_RECONNECT_INTERVAL_SECS),
            reopen_delay: Duration::from_secs(3),
            identity_attempts: 2,
            identity_retry_delay: Duration::from_millis(1500),
            max_identity_regenerations: 3,
            open_timeout: Duration::from_secs(15),
            max_peers: crate::DEFAULT_MAX_PEERS,
        }
    }
}

/// Transfer options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size in bytes
    pub chunk_size: usize,
    /// Minimum spacing between progress updates
    #[serde(with = "humantime_serde")]
    pub progress_interval: Duration,
    /// Chunk producer workers
    pub producer_workers: usize,
    /// Chunks buffered between producers and the session
    pub producer_capacity: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            progress_interval: Duration::from_millis(crate::DEFAULT_PROGRESS_INTERVAL_MS),
            producer_workers: crate::DEFAULT_PRODUCER_WORKERS,
            producer_capacity: 32,
        }
    }
}

/// Received file storage options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// How long received files are kept
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// How often expired files are pruned
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(crate::DEFAULT_RETENTION_HOURS * 60 * 60),
            prune_interval: Duration::from_secs(60),
        }
    }
}

/// Recent peer options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecentConfig {
    /// Peers not seen within this window are forgotten
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RecentConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(crate::DEFAULT_RETENTION_HOURS * 60 * 60),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if it holds invalid values.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to a specific file, creating its directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Check values that would make the session misbehave.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &str, reason: &str| {
            Err(Error::InvalidConfig {
                key: key.to_string(),
                reason: reason.to_string(),
            })
        };

        if self.transfer.chunk_size == 0 {
            return invalid("transfer.chunk_size", "must be greater than zero");
        }
        if self.transfer.chunk_size > crate::protocol::MAX_PAYLOAD_SIZE {
            return invalid("transfer.chunk_size", "exceeds the maximum frame payload");
        }
        if self.transfer.producer_workers == 0 {
            return invalid("transfer.producer_workers", "must be greater than zero");
        }
        if self.transfer.producer_capacity == 0 {
            return invalid("transfer.producer_capacity", "must be greater than zero");
        }
        if self.connection.max_peers == 0 {
            return invalid("connection.max_peers", "must be greater than zero");
        }
        if self.connection.identity_attempts == 0 {
            return invalid("connection.identity_attempts", "must be greater than zero");
        }
        if self.connection.reconnect_interval.is_zero() {
            return invalid("connection.reconnect_interval", "must be greater than zero");
        }
        if self.storage.prune_interval.is_zero() {
            return invalid("storage.prune_interval", "must be greater than zero");
        }

        let timers = [
            ("connection.reconnect_interval", self.connection.reconnect_interval),
            ("connection.reopen_delay", self.connection.reopen_delay),
            ("connection.identity_retry_delay", self.connection.identity_retry_delay),
            ("connection.open_timeout", self.connection.open_timeout),
            ("transfer.progress_interval", self.transfer.progress_interval),
            ("storage.prune_interval", self.storage.prune_interval),
        ];
        for (key, value) in timers {
            if value > MAX_TIMER {
                return invalid(key, "must be at most 365 days");
            }
        }
        Ok(())
    }

    /// Directory holding identity, recent peers and received files.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.general.data_dir.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("com", "nowhile", "Nowhile")
                .map_or_else(|| PathBuf::from(".nowhile"), |dirs| dirs.data_dir().to_path_buf())
        })
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "nowhile", "Nowhile")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis();
        let secs = duration.as_secs();
        let text = if millis % 1000 != 0 {
            format!("{millis}ms")
        } else if secs > 0 && secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs > 0 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        };
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();
        let parse = |digits: &str, scale: u64| {
            digits
                .trim()
                .parse::<u64>()
                .map_err(serde::de::Error::custom)
                .and_then(|n| {
                    n.checked_mul(scale)
                        .ok_or_else(|| serde::de::Error::custom("duration out of range"))
                })
        };

        if let Some(ms) = s.strip_suffix("ms") {
            return parse(ms, 1).map(Duration::from_millis);
        }
        s.strip_suffix('s')
            .map(|secs| parse(secs, 1).map(Duration::from_secs))
            .or_else(|| {
                s.strip_suffix('m')
                    .map(|mins| parse(mins, 60).map(Duration::from_secs))
            })
            .or_else(|| {
                s.strip_suffix('h')
                    .map(|hours| parse(hours, 3600).map(Duration::from_secs))
            })
            .unwrap_or_else(|| Err(serde::de::Error::custom("invalid duration format")))
    }
}
