//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Configuration Priority (high → low)                 │
//! │                                                                         │
//! │  1. Environment variables   PHARMA_API_KEY, PHARMA_PROJECT_ID, ...      │
//! │  2. Config file             <config dir>/pharma/sync/sync.toml          │
//! │  3. Built-in defaults                                                   │
//! │                                                                         │
//! │  Missing or malformed credentials are NOT a load error: the engine      │
//! │  starts anyway and reports `no-api-key`.                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! name = "Counter 1"
//!
//! [store]
//! id = "store_1700000000000"
//! name = "City Pharmacy"
//!
//! [remote]
//! api_key = "AIza..."
//! project_id = "city-pharmacy-01"
//! request_timeout_secs = 15
//!
//! [retry]
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//! max_retries = 5
//!
//! [storage]
//! key_prefix = "pharma_sync_"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use pharma_core::validation::{validate_api_key, validate_project_id};
use pharma_core::DEFAULT_KEY_PREFIX;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Fixed device id. When absent the id is generated once and persisted
    /// in the durable store.
    #[serde(default)]
    pub id: Option<String>,

    /// Human-readable device name (e.g., "Counter 1").
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Written into this device's presence record.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_device_name() -> String {
    "Pharmacy Terminal".to_string()
}

fn default_user_agent() -> String {
    format!("pharma-sync/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            id: None,
            name: default_device_name(),
            user_agent: default_user_agent(),
        }
    }
}

// =============================================================================
// Store Configuration
// =============================================================================

/// The store (pharmacy branch) whose devices share data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Fixed store id. When absent one is generated once and persisted.
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: String,
}

// =============================================================================
// Remote Settings
// =============================================================================

/// Remote backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub project_id: Option<String>,

    /// WebSocket endpoint. Derived from the project id when absent.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    15
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            api_key: None,
            project_id: None,
            endpoint: None,
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Credentials that passed the format check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCredentials {
    pub api_key: String,
    pub project_id: String,
    pub endpoint: String,
}

impl RemoteSettings {
    /// Returns usable credentials, or `None` when the key or project id is
    /// absent, a placeholder, or malformed.
    pub fn credentials(&self) -> Option<RemoteCredentials> {
        let api_key = self.api_key.as_deref()?.trim();
        let project_id = self.project_id.as_deref()?.trim();

        if let Err(e) = validate_api_key(api_key) {
            debug!(%e, "API key rejected by format check");
            return None;
        }
        if let Err(e) = validate_project_id(project_id) {
            debug!(%e, "Project id rejected by format check");
            return None;
        }

        let endpoint = self
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("wss://{}.pharmasync.app/v1/ws", project_id));

        Some(RemoteCredentials {
            api_key: api_key.to_string(),
            project_id: project_id.to_string(),
            endpoint,
        })
    }

    /// True when [`credentials`](Self::credentials) would succeed.
    pub fn is_configured(&self) -> bool {
        self.credentials().is_some()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Flush retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Delay before the first retry.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound for a single delay.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Consecutive failed flushes after which auto-retry stops.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    5
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_retries: default_max_retries(),
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite file. Defaults to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Namespace for every locally persisted key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            database_path: None,
            key_prefix: default_key_prefix(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceSettings,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub remote: RemoteSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<&Path>) -> SyncResult<Self> {
        let mut config = Self::default();

        let path = config_path
            .map(Path::to_path_buf)
            .or_else(Self::default_config_path);

        if let Some(path) = path {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<&Path>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<&Path>) -> SyncResult<()> {
        let path = config_path
            .map(Path::to_path_buf)
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

    /// Rejects structurally broken settings. Credentials are not checked
    /// here; see [`RemoteSettings::credentials`].
    pub fn validate(&self) -> SyncResult<()> {
        if let Some(ref url) = self.remote.endpoint {
            let parsed = url::Url::parse(url)?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(SyncError::InvalidUrl(format!(
                    "Endpoint must start with ws:// or wss://, got: {}",
                    url
                )));
            }
        }

        if self.remote.connect_timeout_secs == 0 || self.remote.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "remote timeouts must be greater than 0".into(),
            ));
        }

        if self.retry.base_delay_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "retry.base_delay_ms must be greater than 0".into(),
            ));
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(SyncError::InvalidConfig(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }

        if self.storage.key_prefix.is_empty() {
            return Err(SyncError::InvalidConfig(
                "storage.key_prefix must not be empty".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("PHARMA_API_KEY") {
            debug!("Overriding API key from environment");
            self.remote.api_key = Some(key);
        }

        if let Ok(project) = std::env::var("PHARMA_PROJECT_ID") {
            debug!(project_id = %project, "Overriding project id from environment");
            self.remote.project_id = Some(project);
        }

        if let Ok(url) = std::env::var("PHARMA_REMOTE_ENDPOINT") {
            debug!(url = %url, "Overriding remote endpoint from environment");
            self.remote.endpoint = Some(url);
        }

        if let Ok(id) = std::env::var("PHARMA_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = Some(id);
        }

        if let Ok(id) = std::env::var("PHARMA_STORE_ID") {
            self.store.id = Some(id);
        }

        if let Ok(path) = std::env::var("PHARMA_DB_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }

        if let Ok(retries) = std::env::var("PHARMA_MAX_RETRIES") {
            match retries.parse::<u32>() {
                Ok(n) => self.retry.max_retries = n,
                Err(_) => warn!(value = %retries, "Ignoring non-numeric PHARMA_MAX_RETRIES"),
            }
        }

        if let Ok(base) = std::env::var("PHARMA_RETRY_BASE_MS") {
            match base.parse::<u64>() {
                Ok(ms) => self.retry.base_delay_ms = ms,
                Err(_) => warn!(value = %base, "Ignoring non-numeric PHARMA_RETRY_BASE_MS"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    /// The SQLite file to open: configured path, else the platform data dir.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.storage.database_path.clone().or_else(|| {
            Self::project_dirs().map(|dirs| dirs.data_dir().join("sync.db"))
        })
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "pharma", "sync")
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn credentials(&self) -> Option<RemoteCredentials> {
        self.remote.credentials()
    }

    pub fn key_prefix(&self) -> &str {
        &self.storage.key_prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_KEY: &str = "AIzaSyD3xampleKey0123456789abcdefghij";

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(config.device.id.is_none());
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.storage.key_prefix, "pharma_sync_");
        assert!(config.device.user_agent.starts_with("pharma-sync/"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_credentials_are_not_a_load_error() {
        let mut config = SyncConfig::default();
        config.remote.api_key = Some("your-api-key".into());
        config.remote.project_id = Some("your-project-id".into());

        assert!(config.validate().is_ok());
        assert!(config.credentials().is_none());
    }

    #[test]
    fn test_credentials_derive_endpoint() {
        let mut config = SyncConfig::default();
        config.remote.api_key = Some(GOOD_KEY.into());
        config.remote.project_id = Some("city-pharmacy-01".into());

        let creds = config.credentials().unwrap();
        assert_eq!(creds.endpoint, "wss://city-pharmacy-01.pharmasync.app/v1/ws");

        config.remote.endpoint = Some("ws://127.0.0.1:9000/ws".into());
        assert_eq!(config.credentials().unwrap().endpoint, "ws://127.0.0.1:9000/ws");
    }

    #[test]
    fn test_credentials_need_both_parts() {
        let mut config = SyncConfig::default();
        config.remote.api_key = Some(GOOD_KEY.into());
        assert!(!config.remote.is_configured());

        config.remote.project_id = Some("Bad_Project".into());
        assert!(!config.remote.is_configured());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.remote.endpoint = Some("http://invalid".into());
        assert!(config.validate().is_err());

        config.remote.endpoint = Some("ws://localhost:8080".into());
        assert!(config.validate().is_ok());

        config.retry.max_delay_ms = 10;
        assert!(config.validate().is_err());

        config.retry.max_delay_ms = 30_000;
        config.storage.key_prefix = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.toml");

        let mut config = SyncConfig::default();
        config.store.id = Some("store_42".into());
        config.device.name = "Counter 2".into();
        config.retry.max_retries = 3;
        config.save(Some(&path)).unwrap();

        let loaded = SyncConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.store.id.as_deref(), Some("store_42"));
        assert_eq!(loaded.device.name, "Counter 2");
        assert_eq!(loaded.retry.max_retries, 3);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, "[retry]\nmax_retries = 9\n").unwrap();

        let loaded = SyncConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.retry.max_retries, 9);
        assert_eq!(loaded.retry.base_delay_ms, 1_000);
        assert_eq!(loaded.remote.request_timeout_secs, 15);
    }

    #[test]
    fn test_toml_serialization() {
        let config = SyncConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[device]"));
        assert!(toml_str.contains("[retry]"));
    }
}
