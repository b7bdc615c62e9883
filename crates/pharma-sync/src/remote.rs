//! # Remote Channel
//!
//! The client contract the engine needs from a real-time backend: point
//! read, wholesale write, an event log to subscribe to, and per-device
//! presence with a server-side disconnect hook.
//!
//! ## Remote Layout
//! ```text
//! stores/<store>/data/<path>          latest snapshot of one collection
//! stores/<store>/events/<event id>    event log (keyed by id: replay is a no-op)
//! stores/<store>/presence/<device>    DevicePresence
//! ```
//!
//! Every method may fail. The engine treats any `Err` as "remote
//! unreachable" and keeps working locally.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use pharma_core::{DevicePresence, SyncEvent};

use crate::error::SyncResult;

// =============================================================================
// Auth State
// =============================================================================

/// Outcome of a successful `authenticate()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthState {
    Authenticated,

    /// Anonymous sign-in is administratively disabled. Reads and writes are
    /// still attempted unauthenticated.
    AuthDisabled,
}

// =============================================================================
// Remote Channel Trait
// =============================================================================

/// A best-effort, eventually-consistent remote store.
///
/// `scope` is always a store scope (`stores/<store>`); `path` arguments are
/// full remote paths built with [`snapshot_path`], [`event_path`] and
/// [`presence_path`].
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    async fn authenticate(&self) -> SyncResult<AuthState>;

    async fn read_path(&self, path: &str) -> SyncResult<Option<Value>>;

    /// Overwrites the value at `path`. No partial merge.
    async fn write_path(&self, path: &str, data: &Value) -> SyncResult<()>;

    /// Appends `event` to the scope's event log.
    async fn push_event(&self, scope: &str, event: &SyncEvent) -> SyncResult<()>;

    /// Delivers every event pushed to `scope` from now on, including this
    /// device's own. Filtering is the caller's job.
    async fn subscribe_events(
        &self,
        scope: &str,
        sink: mpsc::UnboundedSender<SyncEvent>,
    ) -> SyncResult<RemoteSubscription>;

    async fn set_presence(&self, scope: &str, presence: &DevicePresence) -> SyncResult<()>;

    /// Registers the server-side action that flips this device's presence
    /// to offline when the connection drops.
    async fn on_disconnect_cleanup(&self, scope: &str, device_id: &str) -> SyncResult<()>;

    async fn read_presence(&self, scope: &str) -> SyncResult<Vec<DevicePresence>>;
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Stops delivery when unsubscribed or dropped.
pub struct RemoteSubscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl RemoteSubscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to tear down.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for RemoteSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

// =============================================================================
// Path Helpers
// =============================================================================

pub fn store_scope(store_id: &str) -> String {
    format!("stores/{}", store_id)
}

pub fn snapshot_path(scope: &str, path: &str) -> String {
    format!("{}/data/{}", scope, path)
}

pub fn events_path(scope: &str) -> String {
    format!("{}/events", scope)
}

pub fn event_path(scope: &str, event_id: &str) -> String {
    format!("{}/events/{}", scope, event_id)
}

pub fn presence_root(scope: &str) -> String {
    format!("{}/presence", scope)
}

pub fn presence_path(scope: &str, device_id: &str) -> String {
    format!("{}/presence/{}", scope, device_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_layout() {
        let scope = store_scope("store_1");
        assert_eq!(scope, "stores/store_1");
        assert_eq!(snapshot_path(&scope, "inventory"), "stores/store_1/data/inventory");
        assert_eq!(event_path(&scope, "e1"), "stores/store_1/events/e1");
        assert_eq!(presence_path(&scope, "d1"), "stores/store_1/presence/d1");
        assert_eq!(presence_root(&scope), "stores/store_1/presence");
    }

    #[test]
    fn test_subscription_cancels_once() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let sub = RemoteSubscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counter = calls.clone();
        {
            let _sub = RemoteSubscription::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
