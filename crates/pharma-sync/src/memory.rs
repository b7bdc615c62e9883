//! # In-Process Remote Backend
//!
//! A shared, in-memory stand-in for the real-time backend. Every device gets
//! its own [`MemoryRemote`] connection via [`MemoryBackend::connect`]; all
//! connections see the same data, event log and presence records.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         MemoryBackend                                   │
//! │                                                                         │
//! │   MemoryRemote (A) ──┐                        ┌──► subscriber task (A)  │
//! │                      ├──► paths: HashMap ──►  │                         │
//! │   MemoryRemote (B) ──┘    events: broadcast ──┴──► subscriber task (B)  │
//! │                                                                         │
//! │   Fault injection: set_reachable, fail_next_writes,                     │
//! │   set_anonymous_auth, drop_connection                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Event fan-out goes through a broadcast channel and a per-subscription
//! task, so a subscriber never observes an event inside the pusher's call.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use pharma_core::{now_millis, DevicePresence, SyncEvent};

use crate::error::{SyncError, SyncResult};
use crate::remote::{
    event_path, presence_path, presence_root, AuthState, RemoteChannel, RemoteSubscription,
};

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
struct ScopedEvent {
    scope: String,
    event: SyncEvent,
}

#[derive(Debug)]
struct BackendState {
    paths: HashMap<String, Value>,
    reachable: bool,
    anonymous_auth: bool,
    failing_writes: u32,
    disconnect_hooks: HashMap<u64, Vec<(String, Value)>>,
}

struct BackendInner {
    state: Mutex<BackendState>,
    events: broadcast::Sender<ScopedEvent>,
    next_connection: AtomicU64,
    calls: AtomicU64,
    writes: AtomicU64,
}

/// The shared backend. Cheap to clone.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<BackendInner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(BackendInner {
                state: Mutex::new(BackendState {
                    paths: HashMap::new(),
                    reachable: true,
                    anonymous_auth: true,
                    failing_writes: 0,
                    disconnect_hooks: HashMap::new(),
                }),
                events,
                next_connection: AtomicU64::new(1),
                calls: AtomicU64::new(0),
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// Opens a new device connection.
    pub fn connect(&self) -> MemoryRemote {
        let connection_id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst);
        debug!(connection_id, "Memory backend connection opened");
        MemoryRemote {
            backend: self.clone(),
            connection_id,
        }
    }

    // -------------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------------

    /// While unreachable every call fails with `ConnectionFailed`.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// The next `n` writes (snapshot or event) are rejected.
    pub fn fail_next_writes(&self, n: u32) {
        self.lock().failing_writes = n;
    }

    /// With anonymous auth off, `authenticate()` reports `AuthDisabled`.
    pub fn set_anonymous_auth(&self, enabled: bool) {
        self.lock().anonymous_auth = enabled;
    }

    /// Simulates a dropped connection: runs its registered disconnect hooks.
    pub fn drop_connection(&self, remote: &MemoryRemote) {
        let hooks = self
            .lock()
            .disconnect_hooks
            .remove(&remote.connection_id)
            .unwrap_or_default();

        let mut state = self.lock();
        for (path, value) in hooks {
            debug!(%path, "Running disconnect hook");
            state.paths.insert(path, value);
        }
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn get(&self, path: &str) -> Option<Value> {
        self.lock().paths.get(path).cloned()
    }

    /// Number of remote calls made through any connection, failed or not.
    pub fn call_count(&self) -> u64 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Number of accepted snapshot writes.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Number of distinct events stored under `scope`.
    pub fn event_count(&self, scope: &str) -> usize {
        let prefix = format!("{}/events/", scope);
        self.lock()
            .paths
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts the call and fails it when the backend is unreachable.
    fn begin_call(&self, operation: &str) -> SyncResult<()> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        if self.lock().reachable {
            Ok(())
        } else {
            Err(SyncError::ConnectionFailed(format!(
                "{}: backend unreachable",
                operation
            )))
        }
    }

    fn take_write_failure(state: &mut BackendState) -> bool {
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryBackend")
            .field("paths", &state.paths.len())
            .field("reachable", &state.reachable)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Per-device Connection
// =============================================================================

/// One device's connection to a [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    backend: MemoryBackend,
    connection_id: u64,
}

impl MemoryRemote {
    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    /// Shorthand for `backend().drop_connection(self)`.
    pub fn drop_connection(&self) {
        self.backend.drop_connection(self);
    }
}

#[async_trait]
impl RemoteChannel for MemoryRemote {
    async fn authenticate(&self) -> SyncResult<AuthState> {
        self.backend.begin_call("authenticate")?;
        if self.backend.lock().anonymous_auth {
            Ok(AuthState::Authenticated)
        } else {
            Ok(AuthState::AuthDisabled)
        }
    }

    async fn read_path(&self, path: &str) -> SyncResult<Option<Value>> {
        self.backend.begin_call("read")?;
        Ok(self.backend.get(path))
    }

    async fn write_path(&self, path: &str, data: &Value) -> SyncResult<()> {
        self.backend.begin_call("write")?;
        {
            let mut state = self.backend.lock();
            if MemoryBackend::take_write_failure(&mut state) {
                return Err(SyncError::rejected(
                    &format!("write {}", path),
                    "simulated failure",
                ));
            }
            state.paths.insert(path.to_string(), data.clone());
        }
        self.backend.inner.writes.fetch_add(1, Ordering::SeqCst);
        trace!(%path, "Snapshot written");
        Ok(())
    }

    async fn push_event(&self, scope: &str, event: &SyncEvent) -> SyncResult<()> {
        self.backend.begin_call("pushEvent")?;
        let path = event_path(scope, &event.id);
        {
            let mut state = self.backend.lock();
            if MemoryBackend::take_write_failure(&mut state) {
                return Err(SyncError::rejected(
                    &format!("pushEvent {}", path),
                    "simulated failure",
                ));
            }
            if state.paths.contains_key(&path) {
                debug!(event_id = %event.id, "Event already in log, not re-broadcast");
                return Ok(());
            }
            let value = serde_json::to_value(event)?;
            state.paths.insert(path, value);
        }

        // No receivers is fine: nobody is listening yet.
        let _ = self.backend.inner.events.send(ScopedEvent {
            scope: scope.to_string(),
            event: event.clone(),
        });
        Ok(())
    }

    async fn subscribe_events(
        &self,
        scope: &str,
        sink: mpsc::UnboundedSender<SyncEvent>,
    ) -> SyncResult<RemoteSubscription> {
        self.backend.begin_call("subscribe")?;

        let mut rx = self.backend.inner.events.subscribe();
        let scope = scope.to_string();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(scoped) if scoped.scope == scope => {
                        if sink.send(scoped.event).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Subscriber lagged behind the event log");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(RemoteSubscription::new(move || task.abort()))
    }

    async fn set_presence(&self, scope: &str, presence: &DevicePresence) -> SyncResult<()> {
        self.backend.begin_call("setPresence")?;
        let value = serde_json::to_value(presence)?;
        self.backend
            .lock()
            .paths
            .insert(presence_path(scope, &presence.device_id), value);
        Ok(())
    }

    async fn on_disconnect_cleanup(&self, scope: &str, device_id: &str) -> SyncResult<()> {
        self.backend.begin_call("onDisconnect")?;
        let path = presence_path(scope, device_id);

        let mut state = self.backend.lock();
        let offline = match state.paths.get(&path) {
            Some(current) => serde_json::from_value::<DevicePresence>(current.clone())
                .map(|p| p.went_offline(now_millis()))
                .unwrap_or_else(|_| offline_record(device_id)),
            None => offline_record(device_id),
        };
        let value = serde_json::to_value(offline)?;

        let hooks = state.disconnect_hooks.entry(self.connection_id).or_default();
        hooks.retain(|(p, _)| *p != path);
        hooks.push((path, value));
        Ok(())
    }

    async fn read_presence(&self, scope: &str) -> SyncResult<Vec<DevicePresence>> {
        self.backend.begin_call("readPresence")?;
        let prefix = format!("{}/", presence_root(scope));

        let state = self.backend.lock();
        let mut devices: Vec<DevicePresence> = state
            .paths
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(_, v)| serde_json::from_value(v.clone()).ok())
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }
}

fn offline_record(device_id: &str) -> DevicePresence {
    DevicePresence {
        online: false,
        last_seen: now_millis(),
        device_id: device_id.to_string(),
        user_agent: String::new(),
    }
}
