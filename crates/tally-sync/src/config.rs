//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_API_BASE=https://api.example.com                             │
//! │     TALLY_STORE_PATH=/var/lib/tally/tally.db                           │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally/sync.toml (Linux)                                  │
//! │     ~/Library/Application Support/com.tally.dashboard/sync.toml (macOS)│
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [remote]
//! api_base = "http://localhost:5000"
//! request_timeout_secs = 10
//!
//! [store]
//! path = "/var/lib/tally/tally.db"
//!
//! [sync]
//! poll_interval_secs = 5
//! auto_drain_on_reconnect = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Remote Settings
// =============================================================================

/// Where the authoritative backend lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Base URL of the backend; routes live under `{api_base}/api`.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Upper bound on every backend call (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_base() -> String {
    "http://localhost:5000".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// Store Settings
// =============================================================================

/// Where the local SQLite file lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Database file. Defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Reconnect agent behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Interval between connectivity samples (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Drain every queue when connectivity returns.
    #[serde(default = "default_true")]
    pub auto_drain_on_reconnect: bool,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            poll_interval_secs: default_poll_interval(),
            auto_drain_on_reconnect: true,
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Backend settings.
    #[serde(default)]
    pub remote: RemoteSettings,

    /// Local store settings.
    #[serde(default)]
    pub store: StoreSettings,

    /// Reconnect agent settings.
    #[serde(default)]
    pub sync: SyncSettings,
}

impl SyncConfig {
    /// Creates a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let url = Url::parse(&self.remote.api_base)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(SyncError::InvalidUrl(format!(
                "API base must start with http:// or https://, got: {}",
                self.remote.api_base
            )));
        }

        if self.remote.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.sync.poll_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "poll_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies overrides from `lookup` (the process environment in
    /// [`SyncConfig::load`]).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(api_base) = lookup("TALLY_API_BASE") {
            debug!(api_base = %api_base, "Overriding API base from environment");
            self.remote.api_base = api_base;
        }

        if let Some(path) = lookup("TALLY_STORE_PATH") {
            debug!(path = %path, "Overriding store path from environment");
            self.store.path = Some(PathBuf::from(path));
        }

        if let Some(secs) = lookup("TALLY_REQUEST_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.remote.request_timeout_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid TALLY_REQUEST_TIMEOUT_SECS"),
            }
        }

        if let Some(secs) = lookup("TALLY_POLL_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.sync.poll_interval_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid TALLY_POLL_INTERVAL_SECS"),
            }
        }

        if let Some(flag) = lookup("TALLY_AUTO_DRAIN") {
            match flag.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.sync.auto_drain_on_reconnect = true,
                "0" | "false" | "no" | "off" => self.sync.auto_drain_on_reconnect = false,
                _ => warn!(value = %flag, "Unknown TALLY_AUTO_DRAIN value"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "tally", "dashboard")
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the parsed backend base URL.
    pub fn api_base(&self) -> SyncResult<Url> {
        Ok(Url::parse(&self.remote.api_base)?)
    }

    /// Returns the per-call timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.request_timeout_secs)
    }

    /// Returns the connectivity sampling interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync.poll_interval_secs)
    }

    /// Returns the local database path, falling back to the platform data
    /// directory.
    pub fn store_path(&self) -> SyncResult<PathBuf> {
        if let Some(path) = &self.store.path {
            return Ok(path.clone());
        }

        Self::project_dirs()
            .map(|dirs| dirs.data_dir().join("tally.db"))
            .ok_or_else(|| SyncError::InvalidConfig("No data directory available".into()))
    }
}
