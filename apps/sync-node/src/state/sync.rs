//! # Sync State Module
//!
//! Owns the running engine for the console and mirrors its notifications
//! into the log.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync State Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                      SyncState                                  │   │
//! │  │                                                                 │   │
//! │  │  ┌─────────────────┐  ┌─────────────────────────────────────┐  │   │
//! │  │  │  SyncEngine     │  │  WsRemote (optional)                │  │   │
//! │  │  │  (cloned        │  │  • transport state ──► engine       │  │   │
//! │  │  │   handle)       │  │    set_network_online               │  │   │
//! │  │  └─────────────────┘  └─────────────────────────────────────┘  │   │
//! │  │                                                                 │   │
//! │  │  LogEmitter:                                                    │   │
//! │  │  • status   ──► info                                            │   │
//! │  │  • progress ──► debug                                           │   │
//! │  │  • error    ──► warn + remembered for `status`                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use pharma_sync::{ConnectionState, SyncConfig, SyncEngine, SyncEventEmitter, SyncStatus, WsRemote};

/// The engine, its remote and the config they were built from.
pub struct SyncState {
    engine: SyncEngine,
    remote: Option<WsRemote>,
    config: SyncConfig,
    last_error: Arc<RwLock<Option<String>>>,
}

impl SyncState {
    /// `last_error` must be the slot shared with the engine's [`LogEmitter`].
    pub fn new(
        engine: SyncEngine,
        remote: Option<WsRemote>,
        config: SyncConfig,
        last_error: Arc<RwLock<Option<String>>>,
    ) -> Self {
        Self {
            engine,
            remote,
            config,
            last_error,
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn remote_state(&self) -> Option<ConnectionState> {
        self.remote
            .as_ref()
            .map(|remote| *remote.connection_state().borrow())
    }

    pub fn get_status(&self) -> SyncStatusDto {
        SyncStatusDto {
            status: self.engine.status(),
            presence: self.engine.presence_status(),
            last_sync_at: self.engine.last_sync_time().and_then(format_millis),
            pending_count: self.engine.pending_count(),
            network_online: self.engine.is_network_online(),
            remote_configured: self.engine.is_remote_configured(),
            connection_state: self.remote_state().map(|s| s.to_string()),
            last_error: self
                .last_error
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    pub fn get_config(&self) -> SyncConfigDto {
        let credentials = self.config.credentials();
        SyncConfigDto {
            device_id: self.engine.device_id().to_string(),
            device_name: self.config.device.name.clone(),
            store_id: self.engine.store_id().to_string(),
            store_name: self.config.store.name.clone(),
            project_id: credentials.as_ref().map(|c| c.project_id.clone()),
            endpoint: credentials.map(|c| c.endpoint),
            remote_configured: self.engine.is_remote_configured(),
            database_path: self
                .config
                .database_path()
                .map(|p| p.display().to_string()),
            key_prefix: self.config.key_prefix().to_string(),
            max_retries: self.config.retry.max_retries,
        }
    }

    /// Ends the session, then stops the transport.
    pub async fn shutdown(&self) {
        info!("Stopping sync engine...");
        self.engine.cleanup().await;
        if let Some(ref remote) = self.remote {
            remote.shutdown();
        }
        info!("Sync engine stopped");
    }
}

/// Feeds transport connectivity into the engine until the transport stops.
pub async fn bridge_connectivity(engine: SyncEngine, mut state: watch::Receiver<ConnectionState>) {
    loop {
        let connected = *state.borrow_and_update() == ConnectionState::Connected;
        if connected != engine.is_network_online() {
            debug!(connected, "Connectivity changed");
            engine.set_network_online(connected);
        }
        if state.changed().await.is_err() {
            break;
        }
    }
}

fn format_millis(millis: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(millis).map(|t| t.to_rfc3339())
}

/// Status snapshot printed by the `status` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusDto {
    /// Effective engine status
    pub status: SyncStatus,

    /// Presence sub-channel
    pub presence: SyncStatus,

    /// Last successful sync (RFC 3339)
    pub last_sync_at: Option<String>,

    pub pending_count: usize,

    pub network_online: bool,

    pub remote_configured: bool,

    /// Transport state when a remote is attached
    pub connection_state: Option<String>,

    /// Last reported flush error, cleared on `synced`
    pub last_error: Option<String>,
}

/// Configuration printed by the `config` command. Never includes the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfigDto {
    pub device_id: String,
    pub device_name: String,
    pub store_id: String,
    pub store_name: String,
    pub project_id: Option<String>,
    pub endpoint: Option<String>,
    pub remote_configured: bool,
    pub database_path: Option<String>,
    pub key_prefix: String,
    pub max_retries: u32,
}

/// Tracing-based sync event emitter.
#[derive(Clone)]
pub struct LogEmitter {
    last_error: Arc<RwLock<Option<String>>>,
}

impl LogEmitter {
    pub fn new(last_error: Arc<RwLock<Option<String>>>) -> Self {
        Self { last_error }
    }
}

impl SyncEventEmitter for LogEmitter {
    fn emit_status(&self, status: SyncStatus) {
        if status == SyncStatus::Synced {
            *self
                .last_error
                .write()
                .unwrap_or_else(PoisonError::into_inner) = None;
        }
        info!(%status, "Sync status changed");
    }

    fn emit_progress(&self, pending: usize, flushed: usize) {
        debug!(pending, flushed, "Sync progress");
    }

    fn emit_error(&self, message: &str, retryable: bool) {
        *self
            .last_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(message.to_string());
        warn!(message, retryable, "Sync error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_emitter_tracks_last_error() {
        let slot = Arc::new(RwLock::new(None));
        let emitter = LogEmitter::new(slot.clone());

        emitter.emit_error("Connection failed: refused", true);
        assert_eq!(
            slot.read().unwrap().as_deref(),
            Some("Connection failed: refused")
        );

        emitter.emit_status(SyncStatus::Error);
        assert!(slot.read().unwrap().is_some());

        emitter.emit_status(SyncStatus::Synced);
        assert!(slot.read().unwrap().is_none());
    }

    #[test]
    fn test_format_millis() {
        assert_eq!(
            format_millis(0).as_deref(),
            Some("1970-01-01T00:00:00+00:00")
        );
    }

    #[test]
    fn test_status_dto_serializes_kebab_status() {
        let dto = SyncStatusDto {
            status: SyncStatus::NoApiKey,
            presence: SyncStatus::Disconnected,
            last_sync_at: None,
            pending_count: 2,
            network_online: true,
            remote_configured: false,
            connection_state: None,
            last_error: None,
        };
        let json = serde_json::to_value(&dto).unwrap();
        assert_eq!(json["status"], "no-api-key");
        assert_eq!(json["pendingCount"], 2);
        assert_eq!(json["remoteConfigured"], false);
    }
}
