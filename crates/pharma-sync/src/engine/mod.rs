//! # Sync Engine
//!
//! Coordinates the durable store, the change queue and the remote channel,
//! and exposes per-path subscriptions to the cache facades.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Sync Engine                                    │
//! │                                                                         │
//! │  update(path, v)                                                       │
//! │    ├─► snapshot map + durable store      (synchronous)                  │
//! │    ├─► local subscribers notified        (synchronous, call order)      │
//! │    ├─► ChangeQueue.enqueue(event)                                       │
//! │    └─► spawn flush if online, remote configured, none in flight         │
//! │                                                                         │
//! │  flush (single-flight)                                                 │
//! │    connect if needed: authenticate → subscribe → presence → onDisconnect│
//! │    for event in queue.drain():                                          │
//! │        write_path(snapshot) → push_event(event) → dequeue(event.id)     │
//! │    ok:   synced                                                         │
//! │    err:  error, retry after base·2ⁿ (capped) until max_retries          │
//! │                                                                         │
//! │  remote event                                                          │
//! │    own device id → dropped (echo)                                      │
//! │    seen id       → dropped                                             │
//! │    otherwise     → snapshot + durable store + subscribers, synced       │
//! │                                                                         │
//! │  Effective status: no-api-key > offline > auth-disabled > cycle         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Concurrent edits from two devices resolve as last-writer-wins on the
//! whole collection snapshot. There is no merge.
//!
//! ## Locking
//! All mutable state sits behind one `std::sync::Mutex` that is never held
//! across an `.await` and never held while user callbacks run.

mod builder;
mod emitter;
#[cfg(test)]
mod tests;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

use pharma_core::validation::validate_collection_path;
use pharma_core::{now_millis, CollectionItem, DevicePresence, SyncEvent, SyncStatus};
use pharma_store::{ChangeQueue, LocalState};

use crate::config::RetrySettings;
use crate::error::{SyncError, SyncResult};
use crate::facade::{CacheFacade, FacadeShared};
use crate::remote::{snapshot_path, store_scope, AuthState, RemoteChannel, RemoteSubscription};

pub use builder::SyncEngineBuilder;
pub use emitter::{NoOpEmitter, SyncEventEmitter};

/// Called with the new snapshot of a path.
pub type ChangeCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// How many applied remote event ids are remembered for de-duplication.
const RECENT_EVENT_WINDOW: usize = 512;

// =============================================================================
// Engine State
// =============================================================================

struct EngineCore {
    queue: ChangeQueue,
    snapshots: HashMap<String, Value>,
    listeners: HashMap<String, Vec<(u64, ChangeCallback)>>,
    next_listener: u64,

    /// Primary cycle: local, syncing, synced or error.
    phase: SyncStatus,
    network_online: bool,
    session: Option<AuthState>,
    presence: SyncStatus,

    flushing: bool,
    failures: u32,
    backoff: ExponentialBackoff,
    retry_timer: Option<AbortHandle>,

    events_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    listener_task: Option<JoinHandle<()>>,
    subscription: Option<RemoteSubscription>,

    recent_ids: VecDeque<String>,
    recent_set: HashSet<String>,

    last_sync_time: Option<i64>,
    last_timestamp: i64,
    shut_down: bool,
}

impl EngineCore {
    fn listeners_for(&self, path: &str) -> Vec<ChangeCallback> {
        self.listeners
            .get(path)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }

    /// Records an applied event id. False if it was already recorded.
    fn remember(&mut self, event_id: &str) -> bool {
        if self.recent_set.contains(event_id) {
            return false;
        }
        self.recent_set.insert(event_id.to_string());
        self.recent_ids.push_back(event_id.to_string());
        if self.recent_ids.len() > RECENT_EVENT_WINDOW {
            if let Some(old) = self.recent_ids.pop_front() {
                self.recent_set.remove(&old);
            }
        }
        true
    }

    fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    fn reset_retry_budget(&mut self) {
        self.failures = 0;
        self.backoff.reset();
        self.cancel_retry();
    }
}

fn new_backoff(retry: &RetrySettings) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: retry.base_delay(),
        initial_interval: retry.base_delay(),
        max_interval: retry.max_delay(),
        multiplier: 2.0,
        randomization_factor: 0.0,
        max_elapsed_time: None,
        ..Default::default()
    }
}

pub(crate) struct EngineInner {
    state: LocalState,
    remote: Option<Arc<dyn RemoteChannel>>,
    device_id: String,
    store_id: String,
    scope: String,
    user_agent: String,
    retry: RetrySettings,
    emitter: Arc<dyn SyncEventEmitter>,
    status_tx: watch::Sender<SyncStatus>,
    events_tx: mpsc::UnboundedSender<SyncEvent>,
    flush_finished: Notify,
    core: Mutex<EngineCore>,
    /// One `FacadeShared<T>` per collection path.
    facades: Mutex<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>,
}

// =============================================================================
// Sync Engine
// =============================================================================

/// The sync engine. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::new()
    }

    fn new(
        state: LocalState,
        remote: Option<Arc<dyn RemoteChannel>>,
        device_id: String,
        store_id: String,
        user_agent: String,
        retry: RetrySettings,
        emitter: Arc<dyn SyncEventEmitter>,
    ) -> Self {
        let queue = ChangeQueue::load(state.clone());
        let snapshots = state.data_cache();
        let last_sync_time = state.last_sync_time();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let initial = if remote.is_some() {
            SyncStatus::Local
        } else {
            SyncStatus::NoApiKey
        };
        let (status_tx, _) = watch::channel(initial);

        info!(
            device_id = %device_id,
            store_id = %store_id,
            remote = remote.is_some(),
            pending = queue.len(),
            "Sync engine created"
        );

        // A restored queue may carry stamps from a clock that was ahead.
        let last_timestamp = queue.newest_timestamp().unwrap_or(0);

        let core = EngineCore {
            queue,
            snapshots,
            listeners: HashMap::new(),
            next_listener: 1,
            phase: SyncStatus::Local,
            network_online: true,
            session: None,
            presence: SyncStatus::Disconnected,
            flushing: false,
            failures: 0,
            backoff: new_backoff(&retry),
            retry_timer: None,
            events_rx: Some(events_rx),
            listener_task: None,
            subscription: None,
            recent_ids: VecDeque::new(),
            recent_set: HashSet::new(),
            last_sync_time,
            last_timestamp,
            shut_down: false,
        };

        SyncEngine {
            inner: Arc::new(EngineInner {
                scope: store_scope(&store_id),
                state,
                remote,
                device_id,
                store_id,
                user_agent,
                retry,
                emitter,
                status_tx,
                events_tx,
                flush_finished: Notify::new(),
                core: Mutex::new(core),
                facades: Mutex::new(HashMap::new()),
            }),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Runs the connect sequence and flushes whatever a previous session
    /// left queued. Connection failures are reported through the status,
    /// not returned.
    pub async fn start(&self) -> SyncResult<()> {
        let inner = &self.inner;
        if inner.remote.is_none() {
            info!(device_id = %inner.device_id, "Remote backend not configured, running local-only");
            return Ok(());
        }
        if !self.is_network_online() {
            info!("Network offline, connect deferred");
            return Ok(());
        }

        inner.acquire_flush().await?;
        if let Err(e) = inner.run_flush().await {
            warn!(%e, "Initial connect failed");
        }
        Ok(())
    }

    /// Stops timers and the remote listener, drops local subscribers and
    /// marks this device offline. Later flushes are no-ops.
    pub async fn cleanup(&self) {
        let inner = &self.inner;
        let (was_connected, changed) = {
            let mut core = inner.lock();
            if core.shut_down {
                return;
            }
            core.shut_down = true;
            core.cancel_retry();
            if let Some(task) = core.listener_task.take() {
                task.abort();
            }
            if let Some(subscription) = core.subscription.take() {
                subscription.unsubscribe();
            }
            core.listeners.clear();
            core.presence = SyncStatus::Disconnected;
            let was_connected = core.session.take().is_some();
            (was_connected, inner.refresh_status(&core))
        };
        inner.flush_finished.notify_waiters();
        inner.announce(changed);

        if let (true, Some(remote)) = (was_connected, inner.remote.as_ref()) {
            let offline = DevicePresence::online(&inner.device_id, &inner.user_agent, now_millis())
                .went_offline(now_millis());
            if let Err(e) = remote.set_presence(&inner.scope, &offline).await {
                debug!(%e, "Could not mark presence offline during cleanup");
            }
        }

        info!(device_id = %inner.device_id, "Sync engine cleaned up");
    }

    // =========================================================================
    // Local API
    // =========================================================================

    /// Registers `on_change` for `path`. The first subscriber of a path seeds
    /// its snapshot with `initial` unless a cached value exists; if the
    /// cached value differs from `initial`, `on_change` is called with it
    /// right away.
    pub fn subscribe(&self, path: &str, initial: Value, on_change: ChangeCallback) -> Subscription {
        let inner = &self.inner;
        let (id, current) = {
            let mut core = inner.lock();
            let current = match core.snapshots.get(path) {
                Some(existing) => existing.clone(),
                None => {
                    core.snapshots.insert(path.to_string(), initial.clone());
                    inner.state.set_data_cache(&core.snapshots);
                    initial.clone()
                }
            };
            let id = core.next_listener;
            core.next_listener += 1;
            core.listeners
                .entry(path.to_string())
                .or_default()
                .push((id, on_change.clone()));
            (id, current)
        };

        debug!(%path, listener = id, "Local subscriber added");
        if current != initial {
            on_change(&current);
        }

        Subscription {
            inner: Arc::downgrade(inner),
            path: path.to_string(),
            id,
            active: true,
        }
    }

    /// Applies a new snapshot for `path` locally and queues it for the
    /// remote. Returns true once accepted locally, whatever the remote does.
    pub fn update(&self, path: &str, value: Value) -> bool {
        if let Err(e) = validate_collection_path(path) {
            warn!(%path, %e, "Rejected update for invalid path");
            return false;
        }

        let inner = &self.inner;
        let (listeners, changed, should_flush) = {
            let mut core = inner.lock();

            core.snapshots.insert(path.to_string(), value.clone());
            inner.state.set_data_cache(&core.snapshots);

            let timestamp = now_millis().max(core.last_timestamp);
            core.last_timestamp = timestamp;
            let event = SyncEvent::update(&inner.device_id, path, value.clone(), timestamp);
            debug!(event_id = %event.id, %path, "Local change accepted");
            core.queue.enqueue(event);

            core.reset_retry_budget();
            if core.phase.is_idle() {
                core.phase = SyncStatus::Local;
            }

            let should_flush = inner.claim_flush_locked(&mut core);
            (core.listeners_for(path), inner.refresh_status(&core), should_flush)
        };

        inner.announce(changed);
        for on_change in listeners {
            on_change(&value);
        }
        if should_flush {
            inner.spawn_flush();
        }
        true
    }

    /// Drains the queue now, then pulls every known path from the remote;
    /// a remote value that differs from the cache replaces it unless local
    /// changes to that path are still queued. Resets the retry budget.
    pub async fn force_sync(&self) -> bool {
        let inner = &self.inner;
        let Some(remote) = inner.remote.clone() else {
            info!("Force sync skipped: remote not configured");
            return false;
        };

        {
            let mut core = inner.lock();
            if core.shut_down || !core.network_online {
                info!(online = core.network_online, "Force sync skipped");
                return false;
            }
            core.reset_retry_budget();
        }

        if inner.acquire_flush().await.is_err() {
            return false;
        }
        if let Err(e) = inner.run_flush().await {
            warn!(%e, "Force sync could not drain the queue");
            return false;
        }

        match inner.pull_all(&remote).await {
            Ok(updated) => {
                info!(updated, "Force sync complete");
                true
            }
            Err(e) => {
                warn!(%e, "Force sync pull failed");
                inner.emitter.emit_error(&e.to_string(), e.is_retryable());
                false
            }
        }
    }

    /// Feeds the platform's connectivity signal into the engine.
    pub fn set_network_online(&self, online: bool) {
        let inner = &self.inner;
        let (changed, should_flush) = {
            let mut core = inner.lock();
            if core.network_online == online || core.shut_down {
                return;
            }
            core.network_online = online;

            if online {
                info!("Network online, reconnecting");
                core.phase = SyncStatus::Local;
                core.reset_retry_budget();
            } else {
                info!("Network offline");
                core.cancel_retry();
                core.session = None;
                core.presence = SyncStatus::Disconnected;
            }

            let should_flush = online && inner.claim_flush_locked(&mut core);
            (inner.refresh_status(&core), should_flush)
        };

        inner.announce(changed);
        if should_flush {
            inner.spawn_flush();
        }
    }

    /// A typed facade over one collection. Facades for the same path share
    /// their subscribers and a single engine subscription.
    pub fn collection<T: CollectionItem>(&self) -> CacheFacade<T> {
        let path = T::PATH.as_str();
        let mut facades = self
            .inner
            .facades
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let existing = facades
            .get(path)
            .and_then(|shared| shared.clone().downcast::<FacadeShared<T>>().ok());
        let shared = match existing {
            Some(shared) => shared,
            None => {
                if facades.contains_key(path) {
                    warn!(%path, "Collection path reused by another item type");
                }
                let shared = Arc::new(FacadeShared::<T>::new());
                facades.insert(path, shared.clone() as Arc<dyn Any + Send + Sync>);
                shared
            }
        };
        CacheFacade::new(self.clone(), shared)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn status(&self) -> SyncStatus {
        *self.inner.status_tx.borrow()
    }

    /// Receives every status change; no polling needed.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Milliseconds since epoch of the last successful exchange.
    pub fn last_sync_time(&self) -> Option<i64> {
        self.inner.lock().last_sync_time
    }

    /// Online devices of this store, per the presence records.
    pub async fn get_connected_devices(&self) -> Vec<DevicePresence> {
        let Some(remote) = self.inner.remote.clone() else {
            return Vec::new();
        };
        if !self.is_network_online() {
            return Vec::new();
        }
        match remote.read_presence(&self.inner.scope).await {
            Ok(devices) => devices.into_iter().filter(|p| p.online).collect(),
            Err(e) => {
                warn!(%e, "Could not read presence");
                Vec::new()
            }
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn store_id(&self) -> &str {
        &self.inner.store_id
    }

    pub fn is_remote_configured(&self) -> bool {
        self.inner.remote.is_some()
    }

    /// `connected` or `disconnected`, for the presence sub-channel.
    pub fn presence_status(&self) -> SyncStatus {
        self.inner.lock().presence
    }

    pub fn is_network_online(&self) -> bool {
        self.inner.lock().network_online
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// The cached snapshot of `path`.
    pub fn snapshot(&self, path: &str) -> Option<Value> {
        self.inner.lock().snapshots.get(path).cloned()
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("device_id", &self.inner.device_id)
            .field("store_id", &self.inner.store_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Internals
// =============================================================================

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, EngineCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn effective_status(&self, core: &EngineCore) -> SyncStatus {
        if self.remote.is_none() {
            SyncStatus::NoApiKey
        } else if !core.network_online {
            SyncStatus::Offline
        } else if core.session == Some(AuthState::AuthDisabled) {
            SyncStatus::AuthDisabled
        } else {
            core.phase
        }
    }

    /// Publishes the effective status. Must be called with the core lock
    /// held so publications keep their order. Returns the new status if it
    /// changed.
    fn refresh_status(&self, core: &EngineCore) -> Option<SyncStatus> {
        let next = self.effective_status(core);
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        changed.then_some(next)
    }

    /// Tells the emitter about a change. Call without the core lock.
    fn announce(&self, changed: Option<SyncStatus>) {
        if let Some(status) = changed {
            debug!(%status, "Sync status changed");
            self.emitter.emit_status(status);
        }
    }

    // -------------------------------------------------------------------------
    // Flush
    // -------------------------------------------------------------------------

    /// Claims the single flush slot if a flush may run now.
    fn claim_flush_locked(&self, core: &mut EngineCore) -> bool {
        if core.shut_down || self.remote.is_none() || !core.network_online || core.flushing {
            return false;
        }
        core.flushing = true;
        true
    }

    /// Waits for any in-flight flush, then claims the slot.
    async fn acquire_flush(&self) -> SyncResult<()> {
        loop {
            let notified = self.flush_finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut core = self.lock();
                if core.shut_down {
                    return Err(SyncError::ShuttingDown);
                }
                if !core.flushing {
                    core.flushing = true;
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    fn release_flush(&self) {
        self.lock().flushing = false;
        self.flush_finished.notify_waiters();
    }

    /// Runs a claimed flush on the current runtime.
    fn spawn_flush(self: &Arc<Self>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.clone();
                handle.spawn(async move {
                    let _ = inner.run_flush().await;
                });
            }
            Err(_) => {
                warn!("No async runtime available, flush deferred");
                self.release_flush();
            }
        }
    }

    /// Starts a flush unless one is running or preconditions fail.
    fn request_flush(self: &Arc<Self>) {
        let claimed = {
            let mut core = self.lock();
            self.claim_flush_locked(&mut core)
        };
        if claimed {
            self.spawn_flush();
        }
    }

    /// Flushes until the queue is empty or an attempt fails. The caller
    /// must hold the flush slot; it is released on return.
    async fn run_flush(self: &Arc<Self>) -> SyncResult<()> {
        loop {
            let result = self.flush_pass().await;
            if let Some(result) = self.finish_flush(result) {
                return result;
            }
        }
    }

    async fn flush_pass(self: &Arc<Self>) -> SyncResult<()> {
        let remote = self
            .remote
            .clone()
            .ok_or_else(|| SyncError::MissingCredentials("no remote channel".into()))?;

        self.ensure_session(&remote).await?;

        let mut flushed = 0usize;
        loop {
            let (batch, changed) = {
                let mut core = self.lock();
                self.check_running(&core)?;
                let batch = core.queue.drain();
                if batch.is_empty() {
                    return Ok(());
                }
                core.phase = SyncStatus::Syncing;
                (batch, self.refresh_status(&core))
            };
            self.announce(changed);
            debug!(events = batch.len(), "Flushing change queue");

            for event in batch {
                self.check_running(&self.lock())?;

                let path = snapshot_path(&self.scope, &event.path);
                remote.write_path(&path, &event.data).await?;
                remote.push_event(&self.scope, &event).await?;

                let pending = {
                    let mut core = self.lock();
                    core.queue.dequeue(&event.id);
                    core.remember(&event.id);
                    let now = now_millis();
                    core.last_sync_time = Some(now);
                    self.state.set_last_sync_time(now);
                    core.queue.len()
                };
                flushed += 1;
                trace!(event_id = %event.id, pending, "Event acknowledged");
                self.emitter.emit_progress(pending, flushed);
            }
        }
    }

    fn check_running(&self, core: &EngineCore) -> SyncResult<()> {
        if core.shut_down {
            Err(SyncError::ShuttingDown)
        } else if !core.network_online {
            Err(SyncError::Disconnected)
        } else {
            Ok(())
        }
    }

    /// Settles one flush pass. `None` means more events arrived and the
    /// caller should keep flushing; the slot stays claimed.
    fn finish_flush(self: &Arc<Self>, result: SyncResult<()>) -> Option<SyncResult<()>> {
        let mut counted = false;
        let changed = {
            let mut core = self.lock();
            match &result {
                Ok(()) => {
                    if !core.queue.is_empty() && !core.shut_down && core.network_online {
                        return None;
                    }
                    core.flushing = false;
                    if core.queue.is_empty() {
                        core.phase = SyncStatus::Synced;
                        core.reset_retry_budget();
                    }
                }
                Err(SyncError::ShuttingDown) => {
                    core.flushing = false;
                }
                Err(e) if !core.network_online => {
                    debug!(%e, "Flush interrupted by network loss");
                    core.flushing = false;
                    core.phase = SyncStatus::Local;
                }
                Err(e) => {
                    core.flushing = false;
                    if !matches!(e, SyncError::Rejected { .. }) {
                        core.session = None;
                        core.presence = SyncStatus::Disconnected;
                    }
                    core.phase = SyncStatus::Error;
                    core.failures += 1;
                    counted = true;

                    if core.failures >= self.retry.max_retries {
                        warn!(
                            failures = core.failures,
                            pending = core.queue.len(),
                            %e,
                            "Retry budget exhausted, waiting for next change or force sync"
                        );
                    } else {
                        let delay = core
                            .backoff
                            .next_backoff()
                            .unwrap_or_else(|| self.retry.max_delay())
                            .min(self.retry.max_delay());
                        warn!(failures = core.failures, ?delay, %e, "Flush failed, retry scheduled");
                        self.schedule_retry_locked(&mut core, delay);
                    }
                }
            }
            self.refresh_status(&core)
        };

        self.flush_finished.notify_waiters();
        self.announce(changed);

        if let (true, Err(e)) = (counted, &result) {
            self.emitter.emit_error(&e.to_string(), e.is_retryable());
        }
        Some(result)
    }

    fn schedule_retry_locked(self: &Arc<Self>, core: &mut EngineCore, delay: std::time::Duration) {
        core.cancel_retry();
        let weak: Weak<EngineInner> = Arc::downgrade(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        debug!("Retry timer fired");
                        inner.request_flush();
                    }
                });
                core.retry_timer = Some(task.abort_handle());
            }
            Err(_) => warn!("No async runtime available, retry not scheduled"),
        }
    }

    // -------------------------------------------------------------------------
    // Remote session
    // -------------------------------------------------------------------------

    /// authenticate → subscribe → presence → disconnect hook, once per
    /// connection.
    async fn ensure_session(self: &Arc<Self>, remote: &Arc<dyn RemoteChannel>) -> SyncResult<()> {
        if self.lock().session.is_some() {
            return Ok(());
        }

        info!(store_id = %self.store_id, "Connecting to remote backend");
        let auth = remote.authenticate().await?;
        if auth == AuthState::AuthDisabled {
            warn!("Anonymous auth disabled by the backend, continuing unauthenticated");
        }

        let subscription = remote
            .subscribe_events(&self.scope, self.events_tx.clone())
            .await?;

        let presence = match self.register_presence(remote).await {
            Ok(()) => SyncStatus::Connected,
            Err(e) => {
                warn!(%e, "Presence registration failed");
                SyncStatus::Disconnected
            }
        };

        let changed = {
            let mut core = self.lock();
            if core.shut_down || !core.network_online {
                let err = if core.shut_down {
                    SyncError::ShuttingDown
                } else {
                    SyncError::Disconnected
                };
                drop(core);
                subscription.unsubscribe();
                return Err(err);
            }
            core.subscription = Some(subscription);
            core.session = Some(auth);
            core.presence = presence;
            if let Some(rx) = core.events_rx.take() {
                core.listener_task = Some(self.spawn_listener(rx));
            }
            self.refresh_status(&core)
        };
        self.announce(changed);

        info!(device_id = %self.device_id, ?auth, "Remote session established");
        Ok(())
    }

    async fn register_presence(&self, remote: &Arc<dyn RemoteChannel>) -> SyncResult<()> {
        let record = DevicePresence::online(&self.device_id, &self.user_agent, now_millis());
        remote.set_presence(&self.scope, &record).await?;
        remote.on_disconnect_cleanup(&self.scope, &self.device_id).await
    }

    fn spawn_listener(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<SyncEvent>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match weak.upgrade() {
                    Some(inner) => {
                        inner.apply_remote_event(event);
                    }
                    None => break,
                }
            }
            debug!("Remote event listener stopped");
        })
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Applies a foreign event. Returns false when it was dropped or
    /// superseded.
    ///
    /// While local events for the same path are queued or in flight the
    /// foreign snapshot is not adopted: the local write reaches the remote
    /// after it and is what every device ends up holding.
    fn apply_remote_event(&self, event: SyncEvent) -> bool {
        if event.is_from(&self.device_id) {
            trace!(event_id = %event.id, "Echo suppressed");
            return false;
        }

        let (listeners, changed) = {
            let mut core = self.lock();
            if core.shut_down {
                return false;
            }
            if !core.remember(&event.id) {
                debug!(event_id = %event.id, "Duplicate remote event dropped");
                return false;
            }

            let now = now_millis();
            core.last_sync_time = Some(now);
            self.state.set_last_sync_time(now);

            if core.queue.has_pending_for(&event.path) {
                debug!(
                    event_id = %event.id,
                    path = %event.path,
                    "Local changes pending, remote event superseded"
                );
                return false;
            }

            core.snapshots.insert(event.path.clone(), event.data.clone());
            self.state.set_data_cache(&core.snapshots);

            if core.queue.is_empty() && !core.flushing {
                core.phase = SyncStatus::Synced;
            }
            (core.listeners_for(&event.path), self.refresh_status(&core))
        };

        self.announce(changed);
        debug!(path = %event.path, from = %event.device_id, "Applied remote event");
        for on_change in listeners {
            on_change(&event.data);
        }
        true
    }

    /// Reads every known path and adopts remote values that differ.
    async fn pull_all(&self, remote: &Arc<dyn RemoteChannel>) -> SyncResult<usize> {
        let mut paths: Vec<String> = {
            let core = self.lock();
            core.snapshots
                .keys()
                .chain(core.listeners.keys())
                .cloned()
                .collect()
        };
        paths.sort();
        paths.dedup();

        let mut updated = 0;
        for path in paths {
            let remote_value = remote
                .read_path(&snapshot_path(&self.scope, &path))
                .await?;
            if let Some(value) = remote_value {
                if self.adopt_remote_value(&path, value) {
                    updated += 1;
                }
            }
        }

        let changed = {
            let mut core = self.lock();
            let now = now_millis();
            core.last_sync_time = Some(now);
            self.state.set_last_sync_time(now);
            if core.queue.is_empty() && !core.flushing {
                core.phase = SyncStatus::Synced;
            }
            self.refresh_status(&core)
        };
        self.announce(changed);
        Ok(updated)
    }

    fn adopt_remote_value(&self, path: &str, value: Value) -> bool {
        let listeners = {
            let mut core = self.lock();
            if core.snapshots.get(path) == Some(&value) {
                return false;
            }
            if core.queue.has_pending_for(path) {
                debug!(%path, "Local changes pending, remote value not adopted");
                return false;
            }
            core.snapshots.insert(path.to_string(), value.clone());
            self.state.set_data_cache(&core.snapshots);
            core.listeners_for(path)
        };

        debug!(%path, "Adopted remote snapshot");
        for on_change in listeners {
            on_change(&value);
        }
        true
    }
}

// =============================================================================
// Local Subscription Handle
// =============================================================================

/// A local subscriber registration. Unsubscribes on drop.
pub struct Subscription {
    inner: Weak<EngineInner>,
    path: String,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.inner.upgrade() {
            let mut core = inner.lock();
            if let Some(list) = core.listeners.get_mut(&self.path) {
                list.retain(|(id, _)| *id != self.id);
                if list.is_empty() {
                    core.listeners.remove(&self.path);
                }
            }
            trace!(path = %self.path, listener = self.id, "Local subscriber removed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.path)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
