//! # Local State Keys
//!
//! Typed accessors for the handful of values the sync core persists, each
//! namespaced under a fixed prefix so they cannot collide with unrelated
//! data sharing the same store.
//!
//! | Accessor           | Key (after prefix) | Value                       |
//! |--------------------|--------------------|-----------------------------|
//! | `device_id`        | `deviceId`         | string                      |
//! | `store_id`         | `storeId`          | string                      |
//! | `last_sync_time`   | `lastSyncTime`     | ms since epoch              |
//! | `pending_changes`  | `pendingChanges`   | `SyncEvent[]`               |
//! | `data_cache`       | `dataCache`        | `{ path: snapshot }`        |

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use pharma_core::SyncEvent;

use crate::durable::{report_dropped_write, DurableStore};
use crate::error::StoreError;

/// Key names, before the prefix is applied.
pub mod keys {
    pub const DEVICE_ID: &str = "deviceId";
    pub const STORE_ID: &str = "storeId";
    pub const LAST_SYNC_TIME: &str = "lastSyncTime";
    pub const PENDING_CHANGES: &str = "pendingChanges";
    pub const DATA_CACHE: &str = "dataCache";
}

/// Namespaced, typed view over a [`DurableStore`].
#[derive(Clone)]
pub struct LocalState {
    store: Arc<dyn DurableStore>,
    prefix: String,
}

impl LocalState {
    pub fn new(store: Arc<dyn DurableStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The full storage key for `name`.
    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Loads and decodes a value. A value of the wrong shape is logged and
    /// treated as absent.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let key = self.key(name);
        let value = self.store.get(&key)?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(key = %key, ?e, "Stored value has an unexpected shape");
                None
            }
        }
    }

    /// Encodes and stores a value. Never fails at the call site.
    pub fn save<T: Serialize + ?Sized>(&self, name: &str, value: &T) {
        let key = self.key(name);
        match serde_json::to_value(value) {
            Ok(value) => self.store.set(&key, &value),
            Err(e) => report_dropped_write(&key, &StoreError::serialization(&key, e)),
        }
    }

    pub fn remove(&self, name: &str) {
        self.store.remove(&self.key(name));
    }

    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    pub fn device_id(&self) -> Option<String> {
        self.load(keys::DEVICE_ID)
    }

    pub fn set_device_id(&self, device_id: &str) {
        self.save(keys::DEVICE_ID, device_id);
    }

    pub fn store_id(&self) -> Option<String> {
        self.load(keys::STORE_ID)
    }

    pub fn set_store_id(&self, store_id: &str) {
        self.save(keys::STORE_ID, store_id);
    }

    // -------------------------------------------------------------------------
    // Sync progress
    // -------------------------------------------------------------------------

    /// Milliseconds since epoch of the last successful exchange.
    pub fn last_sync_time(&self) -> Option<i64> {
        self.load(keys::LAST_SYNC_TIME)
    }

    pub fn set_last_sync_time(&self, millis: i64) {
        self.save(keys::LAST_SYNC_TIME, &millis);
    }

    pub fn pending_changes(&self) -> Vec<SyncEvent> {
        self.load(keys::PENDING_CHANGES).unwrap_or_default()
    }

    pub fn set_pending_changes(&self, events: &[SyncEvent]) {
        self.save(keys::PENDING_CHANGES, events);
    }

    // -------------------------------------------------------------------------
    // Data cache
    // -------------------------------------------------------------------------

    pub fn data_cache(&self) -> HashMap<String, Value> {
        self.load(keys::DATA_CACHE).unwrap_or_default()
    }

    pub fn set_data_cache(&self, cache: &HashMap<String, Value>) {
        self.save(keys::DATA_CACHE, cache);
    }

    /// The cached snapshot for one path.
    pub fn cached(&self, path: &str) -> Option<Value> {
        self.data_cache().remove(path)
    }

    /// Replaces one path inside the cache map.
    pub fn cache_path(&self, path: &str, value: &Value) {
        let mut cache = self.data_cache();
        cache.insert(path.to_string(), value.clone());
        self.set_data_cache(&cache);
    }
}

impl std::fmt::Debug for LocalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalState")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
