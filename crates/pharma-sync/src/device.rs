//! Device and store identity.
//!
//! A device id is generated once per install and persisted; every event and
//! presence record this device produces carries it.

use uuid::Uuid;

use pharma_core::now_millis;
use pharma_store::LocalState;
use tracing::info;

/// Supplies this device's stable id.
pub trait DeviceIdProvider: Send + Sync {
    fn device_id(&self) -> String;
}

/// Reads the id from local state, generating `device_<ms>_<random>` on
/// first use.
#[derive(Debug, Clone)]
pub struct PersistedDeviceId {
    state: LocalState,
}

impl PersistedDeviceId {
    pub fn new(state: LocalState) -> Self {
        Self { state }
    }
}

impl DeviceIdProvider for PersistedDeviceId {
    fn device_id(&self) -> String {
        if let Some(id) = self.state.device_id() {
            return id;
        }
        let id = generate_device_id();
        info!(device_id = %id, "Generated new device id");
        self.state.set_device_id(&id);
        id
    }
}

/// Always returns the same id. Used for config overrides and tests.
#[derive(Debug, Clone)]
pub struct FixedDeviceId(pub String);

impl FixedDeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl DeviceIdProvider for FixedDeviceId {
    fn device_id(&self) -> String {
        self.0.clone()
    }
}

fn generate_device_id() -> String {
    let mut suffix = Uuid::new_v4().simple().to_string();
    suffix.truncate(pharma_core::EVENT_ID_SUFFIX_LEN);
    format!("device_{}_{}", now_millis(), suffix)
}

/// The configured store id wins and is persisted; otherwise the persisted
/// one; otherwise a fresh `store_<ms>`.
pub fn resolve_store_id(state: &LocalState, configured: Option<&str>) -> String {
    if let Some(id) = configured {
        if state.store_id().as_deref() != Some(id) {
            state.set_store_id(id);
        }
        return id.to_string();
    }
    if let Some(id) = state.store_id() {
        return id;
    }
    let id = format!("store_{}", now_millis());
    info!(store_id = %id, "Generated new store id");
    state.set_store_id(&id);
    id
}
