//! Explicit construction of a [`SyncEngine`].

use std::sync::Arc;
use tracing::info;

use pharma_core::validation::validate_identifier;
use pharma_core::DEFAULT_KEY_PREFIX;
use pharma_store::{DurableStore, LocalState};

use crate::config::{RemoteSettings, RetrySettings, SyncConfig};
use crate::device::{resolve_store_id, DeviceIdProvider, FixedDeviceId, PersistedDeviceId};
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteChannel;

use super::emitter::{NoOpEmitter, SyncEventEmitter};
use super::SyncEngine;

/// Builder for [`SyncEngine`].
///
/// ## Usage
/// ```rust,ignore
/// let engine = SyncEngine::builder()
///     .store(store)
///     .remote(Some(remote))
///     .retry(config.retry)
///     .build()?;
/// engine.start().await?;
/// ```
#[derive(Default)]
pub struct SyncEngineBuilder {
    store: Option<Arc<dyn DurableStore>>,
    key_prefix: Option<String>,
    remote: Option<Arc<dyn RemoteChannel>>,
    remote_settings: Option<RemoteSettings>,
    device_ids: Option<Arc<dyn DeviceIdProvider>>,
    store_id: Option<String>,
    user_agent: Option<String>,
    retry: RetrySettings,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
}

impl SyncEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ids, retry policy, key prefix, user agent and the credential
    /// gate from a loaded config.
    pub fn config(mut self, config: &SyncConfig) -> Self {
        self.key_prefix = Some(config.storage.key_prefix.clone());
        self.remote_settings = Some(config.remote.clone());
        self.store_id = config.store.id.clone();
        self.user_agent = Some(config.device.user_agent.clone());
        self.retry = config.retry;
        if let Some(ref id) = config.device.id {
            self.device_ids = Some(Arc::new(FixedDeviceId::new(id.clone())));
        }
        self
    }

    /// The durable store. Required.
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// The remote channel. `None` runs the engine local-only with status
    /// `no-api-key`.
    pub fn remote(mut self, remote: Option<Arc<dyn RemoteChannel>>) -> Self {
        self.remote = remote;
        self
    }

    /// When set, the remote is only used if these settings carry valid
    /// credentials.
    pub fn remote_settings(mut self, settings: RemoteSettings) -> Self {
        self.remote_settings = Some(settings);
        self
    }

    pub fn device_ids(mut self, provider: Arc<dyn DeviceIdProvider>) -> Self {
        self.device_ids = Some(provider);
        self
    }

    pub fn store_id(mut self, store_id: impl Into<String>) -> Self {
        self.store_id = Some(store_id.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn build(self) -> SyncResult<SyncEngine> {
        let store = self
            .store
            .ok_or_else(|| SyncError::InvalidConfig("Durable store required".into()))?;

        let prefix = self
            .key_prefix
            .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());
        let state = LocalState::new(store, prefix);

        let device_ids = self
            .device_ids
            .unwrap_or_else(|| Arc::new(PersistedDeviceId::new(state.clone())));
        let device_id = device_ids.device_id();
        validate_identifier("device id", &device_id)
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        let store_id = resolve_store_id(&state, self.store_id.as_deref());
        validate_identifier("store id", &store_id)
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        let remote = match (self.remote, self.remote_settings) {
            (Some(remote), Some(settings)) if !settings.is_configured() => {
                info!("Remote credentials missing or malformed, remote disabled");
                drop(remote);
                None
            }
            (remote, _) => remote,
        };

        let user_agent = self
            .user_agent
            .unwrap_or_else(|| format!("pharma-sync/{}", env!("CARGO_PKG_VERSION")));
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        Ok(SyncEngine::new(
            state, remote, device_id, store_id, user_agent, self.retry, emitter,
        ))
    }
}
