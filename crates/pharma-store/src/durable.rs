//! # Durable Store Contract
//!
//! A synchronous key-value API over JSON values. Neither `get` nor `set`
//! ever fails at the call site: errors are caught, logged with their kind
//! and the operation degrades to a no-op.
//!
//! ```text
//! set(key, value)
//!      │
//!      ├── ok ──────────────► value visible to the next get()
//!      │
//!      └── quota / serialization / storage failure
//!               │
//!               ▼
//!          error!(kind = "...") and keep the previous value
//! ```

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::{error, warn};

use crate::error::{StoreError, StoreResult};

// =============================================================================
// Trait
// =============================================================================

/// Synchronous persistence used by the sync engine.
pub trait DurableStore: Send + Sync {
    /// Returns the stored value, or `None` if absent or unreadable.
    fn get(&self, key: &str) -> Option<Value>;

    /// Stores `value` under `key`. Failures are logged, never returned.
    fn set(&self, key: &str, value: &Value);

    /// Removes `key` if present.
    fn remove(&self, key: &str);

    /// Every key currently stored.
    fn keys(&self) -> Vec<String>;
}

/// Logs a dropped write under a kind an operator can alert on.
pub(crate) fn report_dropped_write(key: &str, err: &StoreError) {
    error!(key = %key, kind = err.kind(), error = %err, "Durable write dropped");
}

// =============================================================================
// MemoryStore
// =============================================================================

/// In-process store that keeps values as JSON text.
///
/// Holding text rather than `Value` makes every write go through the same
/// serialization a persistent backend would. An optional byte quota lets
/// tests exercise the quota-exceeded path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that refuses writes once keys plus values exceed `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            entries: RwLock::default(),
            quota_bytes: Some(bytes),
        }
    }

    /// Bytes currently used by keys and values.
    pub fn used_bytes(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    fn try_set(&self, key: &str, value: &Value) -> StoreResult<()> {
        let text = serde_json::to_string(value).map_err(|e| StoreError::serialization(key, e))?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(limit) = self.quota_bytes {
            let current: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if current + key.len() + text.len() > limit {
                return Err(StoreError::QuotaExceeded {
                    key: key.to_string(),
                });
            }
        }

        entries.insert(key.to_string(), text);
        Ok(())
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let text = entries.get(key)?;
        match serde_json::from_str(text) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, ?e, "Stored value is not valid JSON");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &Value) {
        if let Err(e) = self.try_set(key, value) {
            report_dropped_write(key, &e);
        }
    }

    fn remove(&self, key: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
