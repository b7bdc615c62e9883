//! Engine scenarios against the in-process backend.
//!
//! All tests run on a paused clock so backoff timers are deterministic.

use super::*;
use async_trait::async_trait;
use pharma_core::DEFAULT_KEY_PREFIX;
use pharma_store::{DurableStore, MemoryStore};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::RemoteSettings;
use crate::device::FixedDeviceId;
use crate::memory::{MemoryBackend, MemoryRemote};

// =============================================================================
// Fixtures
// =============================================================================

#[derive(Default)]
struct RecordingEmitter {
    statuses: Mutex<Vec<SyncStatus>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingEmitter {
    fn statuses(&self) -> Vec<SyncStatus> {
        self.statuses.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.statuses.lock().unwrap().clear();
        self.errors.lock().unwrap().clear();
    }
}

impl SyncEventEmitter for RecordingEmitter {
    fn emit_status(&self, status: SyncStatus) {
        self.statuses.lock().unwrap().push(status);
    }

    fn emit_progress(&self, _pending: usize, _flushed: usize) {}

    fn emit_error(&self, message: &str, _retryable: bool) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}

/// Delays every snapshot write.
struct SlowRemote {
    inner: MemoryRemote,
    delay: Duration,
}

#[async_trait]
impl RemoteChannel for SlowRemote {
    async fn authenticate(&self) -> SyncResult<AuthState> {
        self.inner.authenticate().await
    }

    async fn read_path(&self, path: &str) -> SyncResult<Option<Value>> {
        self.inner.read_path(path).await
    }

    async fn write_path(&self, path: &str, data: &Value) -> SyncResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.write_path(path, data).await
    }

    async fn push_event(&self, scope: &str, event: &SyncEvent) -> SyncResult<()> {
        self.inner.push_event(scope, event).await
    }

    async fn subscribe_events(
        &self,
        scope: &str,
        sink: mpsc::UnboundedSender<SyncEvent>,
    ) -> SyncResult<RemoteSubscription> {
        self.inner.subscribe_events(scope, sink).await
    }

    async fn set_presence(&self, scope: &str, presence: &DevicePresence) -> SyncResult<()> {
        self.inner.set_presence(scope, presence).await
    }

    async fn on_disconnect_cleanup(&self, scope: &str, device_id: &str) -> SyncResult<()> {
        self.inner.on_disconnect_cleanup(scope, device_id).await
    }

    async fn read_presence(&self, scope: &str) -> SyncResult<Vec<DevicePresence>> {
        self.inner.read_presence(scope).await
    }
}

struct Device {
    engine: SyncEngine,
    store: Arc<MemoryStore>,
    emitter: Arc<RecordingEmitter>,
}

fn retry() -> RetrySettings {
    RetrySettings {
        base_delay_ms: 1_000,
        max_delay_ms: 30_000,
        max_retries: 5,
    }
}

fn device(backend: &MemoryBackend, id: &str) -> Device {
    device_with_store(backend, id, Arc::new(MemoryStore::new()))
}

fn device_with_store(backend: &MemoryBackend, id: &str, store: Arc<MemoryStore>) -> Device {
    let remote: Arc<dyn RemoteChannel> = Arc::new(backend.connect());
    device_over(remote, id, store)
}

fn device_over(remote: Arc<dyn RemoteChannel>, id: &str, store: Arc<MemoryStore>) -> Device {
    let emitter = Arc::new(RecordingEmitter::default());
    let engine = SyncEngine::builder()
        .store(store.clone())
        .remote(Some(remote))
        .device_ids(Arc::new(FixedDeviceId::new(id)))
        .store_id("store_1")
        .retry(retry())
        .emitter(emitter.clone())
        .build()
        .unwrap();
    Device {
        engine,
        store,
        emitter,
    }
}

fn scope() -> String {
    store_scope("store_1")
}

fn persisted(store: &Arc<MemoryStore>) -> LocalState {
    let store: Arc<dyn DurableStore> = store.clone();
    LocalState::new(store, DEFAULT_KEY_PREFIX)
}

/// Lets spawned flushes and listeners run to completion.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn counter() -> (Arc<AtomicUsize>, ChangeCallback) {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = count.clone();
    (
        count,
        Arc::new(move |_: &Value| {
            inner.fetch_add(1, Ordering::SeqCst);
        }),
    )
}

fn forwarder() -> (mpsc::UnboundedReceiver<Value>, ChangeCallback) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        rx,
        Arc::new(move |value: &Value| {
            let _ = tx.send(value.clone());
        }),
    )
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_offline_edit_survives_and_flushes_on_reconnect() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "counter_a");
    a.engine.start().await.unwrap();
    assert_eq!(a.engine.status(), SyncStatus::Synced);

    let mut status_rx = a.engine.subscribe_status();
    a.engine.set_network_online(false);
    assert_eq!(*status_rx.borrow_and_update(), SyncStatus::Offline);

    let stock = json!([{"id": "inv_1", "quantity": 40}]);
    assert!(a.engine.update("inventory", stock.clone()));
    assert_eq!(a.engine.status(), SyncStatus::Offline);
    assert_eq!(a.engine.pending_count(), 1);

    let state = persisted(&a.store);
    assert_eq!(state.cached("inventory"), Some(stock.clone()));
    assert_eq!(state.pending_changes().len(), 1);

    settle().await;
    assert_eq!(backend.write_count(), 0);

    a.engine.set_network_online(true);
    settle().await;

    assert_eq!(a.engine.status(), SyncStatus::Synced);
    assert_eq!(a.engine.pending_count(), 0);
    assert!(state.pending_changes().is_empty());
    assert_eq!(
        backend.get(&snapshot_path(&scope(), "inventory")),
        Some(stock)
    );
    assert!(a.engine.last_sync_time().is_some());
    assert!(state.last_sync_time().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_second_device_receives_change_asynchronously() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "counter_a");
    let b = device(&backend, "counter_b");
    a.engine.start().await.unwrap();
    b.engine.start().await.unwrap();

    let (a_calls, on_a) = counter();
    let _a_sub = a.engine.subscribe("transactions", json!([]), on_a);
    let (mut b_rx, on_b) = forwarder();
    let _b_sub = b.engine.subscribe("transactions", json!([]), on_b);

    let bill = json!([{"id": "T1", "billNumber": "B-0001"}]);
    assert!(a.engine.update("transactions", bill.clone()));

    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert!(b_rx.try_recv().is_err());

    let received = tokio::time::timeout(Duration::from_secs(5), b_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, bill);

    settle().await;
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(b.engine.snapshot("transactions"), Some(bill.clone()));
    assert_eq!(
        persisted(&b.store).cached("transactions"),
        Some(bill)
    );
    assert_eq!(b.engine.status(), SyncStatus::Synced);
}

#[tokio::test(start_paused = true)]
async fn test_placeholder_credentials_stay_local() {
    let backend = MemoryBackend::new();
    let remote: Arc<dyn RemoteChannel> = Arc::new(backend.connect());
    let settings = RemoteSettings {
        api_key: Some("your-api-key".into()),
        project_id: Some("your-project-id".into()),
        ..RemoteSettings::default()
    };

    let engine = SyncEngine::builder()
        .store(Arc::new(MemoryStore::new()))
        .remote(Some(remote))
        .remote_settings(settings)
        .device_ids(Arc::new(FixedDeviceId::new("counter_a")))
        .store_id("store_1")
        .build()
        .unwrap();

    assert!(!engine.is_remote_configured());
    engine.start().await.unwrap();
    assert_eq!(engine.status(), SyncStatus::NoApiKey);

    assert!(engine.update("inventory", json!([{"id": "inv_1"}])));
    settle().await;

    assert_eq!(engine.status(), SyncStatus::NoApiKey);
    assert_eq!(engine.pending_count(), 1);
    assert!(!engine.force_sync().await);
    assert!(engine.get_connected_devices().await.is_empty());
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_then_force_sync() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "counter_a");
    a.engine.start().await.unwrap();
    let connect_calls = backend.call_count();

    backend.fail_next_writes(5);
    assert!(a.engine.update("inventory", json!([{"id": "inv_1"}])));
    settle().await;
    assert_eq!(backend.call_count(), connect_calls + 1);
    assert_eq!(a.engine.status(), SyncStatus::Error);

    // First retry after the base delay.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(backend.call_count(), connect_calls + 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.call_count(), connect_calls + 2);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.call_count(), connect_calls + 5);
    assert_eq!(a.engine.pending_count(), 1);
    assert_eq!(a.engine.status(), SyncStatus::Error);
    assert_eq!(backend.write_count(), 0);
    assert_eq!(a.emitter.errors().len(), 5);

    // Budget exhausted: nothing more happens on its own.
    let calls = backend.call_count();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(backend.call_count(), calls);

    assert!(a.engine.force_sync().await);
    assert_eq!(a.engine.pending_count(), 0);
    assert_eq!(a.engine.status(), SyncStatus::Synced);
    assert_eq!(backend.write_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_new_mutation_resets_retry_budget() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "counter_a");
    a.engine.start().await.unwrap();

    backend.fail_next_writes(5);
    a.engine.update("inventory", json!([1]));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(a.engine.status(), SyncStatus::Error);

    a.engine.update("inventory", json!([2]));
    settle().await;

    assert_eq!(a.engine.status(), SyncStatus::Synced);
    assert_eq!(a.engine.pending_count(), 0);
    assert_eq!(
        backend.get(&snapshot_path(&scope(), "inventory")),
        Some(json!([2]))
    );
}

#[tokio::test(start_paused = true)]
async fn test_last_offline_edit_wins() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "counter_a");
    let b = device(&backend, "counter_b");
    a.engine.start().await.unwrap();
    b.engine.start().await.unwrap();

    a.engine.set_network_online(false);
    for quantity in [10, 9, 8] {
        a.engine.update("inventory", json!([{"id": "inv_1", "quantity": quantity}]));
    }
    assert_eq!(a.engine.pending_count(), 3);

    a.engine.set_network_online(true);
    settle().await;

    let last = json!([{"id": "inv_1", "quantity": 8}]);
    assert_eq!(a.engine.pending_count(), 0);
    assert_eq!(backend.event_count(&scope()), 3);
    assert_eq!(backend.get(&snapshot_path(&scope(), "inventory")), Some(last.clone()));
    assert_eq!(b.engine.snapshot("inventory"), Some(last));
}

#[tokio::test(start_paused = true)]
async fn test_own_echo_is_not_applied() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "counter_a");
    a.engine.start().await.unwrap();

    let (mut rx, on_change) = forwarder();
    let _sub = a.engine.subscribe("inventory", json!([]), on_change);

    let rogue = backend.connect();
    let echo = SyncEvent::update("counter_a", "inventory", json!(["echo"]), now_millis());
    rogue.push_event(&scope(), &echo).await.unwrap();
    let marker = SyncEvent::update("counter_b", "inventory", json!(["marker"]), now_millis() + 1);
    rogue.push_event(&scope(), &marker).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, json!(["marker"]));
    assert_eq!(a.engine.snapshot("inventory"), Some(json!(["marker"])));
}

#[tokio::test(start_paused = true)]
async fn test_network_loss_mid_flush_is_offline_not_error() {
    let backend = MemoryBackend::new();
    let slow: Arc<dyn RemoteChannel> = Arc::new(SlowRemote {
        inner: backend.connect(),
        delay: Duration::from_secs(1),
    });
    let a = device_over(slow, "counter_a", Arc::new(MemoryStore::new()));
    a.engine.start().await.unwrap();

    a.engine.update("inventory", json!([{"id": "inv_1"}]));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a.engine.status(), SyncStatus::Syncing);

    backend.set_reachable(false);
    a.engine.set_network_online(false);
    assert_eq!(a.engine.status(), SyncStatus::Offline);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(a.engine.status(), SyncStatus::Offline);
    assert_eq!(a.engine.pending_count(), 1);
    assert!(!a.emitter.statuses().contains(&SyncStatus::Error));
    assert!(a.emitter.errors().is_empty());

    a.emitter.clear();
    backend.set_reachable(true);
    a.engine.set_network_online(true);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(
        a.emitter.statuses(),
        vec![SyncStatus::Local, SyncStatus::Syncing, SyncStatus::Synced]
    );
    assert_eq!(a.engine.pending_count(), 0);
    assert_eq!(backend.write_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_local_write_wins_over_foreign_event() {
    let backend = MemoryBackend::new();
    let slow: Arc<dyn RemoteChannel> = Arc::new(SlowRemote {
        inner: backend.connect(),
        delay: Duration::from_secs(1),
    });
    let a = device_over(slow, "counter_a", Arc::new(MemoryStore::new()));
    let b = device(&backend, "counter_b");
    a.engine.start().await.unwrap();
    b.engine.start().await.unwrap();

    assert!(a.engine.update("inventory", json!(["A"])));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.engine.update("inventory", json!(["B"])));
    tokio::time::sleep(Duration::from_secs(5)).await;

    // B's write landed first, A's in-flight write overwrote it.
    assert_eq!(
        backend.get(&snapshot_path(&scope(), "inventory")),
        Some(json!(["A"]))
    );
    assert_eq!(a.engine.snapshot("inventory"), Some(json!(["A"])));
    assert_eq!(persisted(&a.store).cached("inventory"), Some(json!(["A"])));
    assert_eq!(b.engine.snapshot("inventory"), Some(json!(["A"])));
    assert_eq!(a.engine.pending_count(), 0);
    assert_eq!(b.engine.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_edit_after_restart_sorts_after_restored_queue() {
    let backend = MemoryBackend::new();
    let store = Arc::new(MemoryStore::new());
    // Left behind by a session whose clock ran an hour ahead.
    let ahead = now_millis() + 3_600_000;
    persisted(&store).set_pending_changes(&[SyncEvent::update(
        "counter_a",
        "inventory",
        json!(["old"]),
        ahead,
    )]);

    let a = device_with_store(&backend, "counter_a", store);
    a.engine.set_network_online(false);
    a.engine.start().await.unwrap();
    assert!(a.engine.update("inventory", json!(["new"])));
    assert_eq!(a.engine.pending_count(), 2);

    a.engine.set_network_online(true);
    settle().await;

    assert_eq!(a.engine.pending_count(), 0);
    assert_eq!(
        backend.get(&snapshot_path(&scope(), "inventory")),
        Some(json!(["new"]))
    );
    assert_eq!(a.engine.snapshot("inventory"), Some(json!(["new"])));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_remote_event_notifies_once() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "counter_a");

    let (calls, on_change) = counter();
    let _sub = a.engine.subscribe("inwardEntries", json!([]), on_change);

    let event = SyncEvent::update("counter_b", "inwardEntries", json!([{"id": "in_1"}]), 42);
    assert!(a.engine.inner.apply_remote_event(event.clone()));
    assert!(!a.engine.inner.apply_remote_event(event));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_path_is_cached() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "counter_a");

    let event = SyncEvent::update("counter_b", "supplierNotes", json!({"note": "call back"}), 7);
    assert!(a.engine.inner.apply_remote_event(event));
    assert_eq!(
        a.engine.snapshot("supplierNotes"),
        Some(json!({"note": "call back"}))
    );
}

#[tokio::test(start_paused = true)]
async fn test_queue_survives_restart() {
    let backend = MemoryBackend::new();
    let store = Arc::new(MemoryStore::new());
    let stock = json!([{"id": "inv_1", "quantity": 3}]);

    {
        let a = device_with_store(&backend, "counter_a", store.clone());
        a.engine.set_network_online(false);
        a.engine.update("inventory", stock.clone());
        a.engine.cleanup().await;
    }

    let restarted = device_with_store(&backend, "counter_a", store);
    assert_eq!(restarted.engine.pending_count(), 1);
    assert_eq!(restarted.engine.snapshot("inventory"), Some(stock.clone()));

    restarted.engine.start().await.unwrap();
    assert_eq!(restarted.engine.pending_count(), 0);
    assert_eq!(restarted.engine.status(), SyncStatus::Synced);
    assert_eq!(backend.get(&snapshot_path(&scope(), "inventory")), Some(stock));
}

#[tokio::test(start_paused = true)]
async fn test_auth_disabled_still_writes() {
    let backend = MemoryBackend::new();
    backend.set_anonymous_auth(false);
    let a = device(&backend, "counter_a");

    a.engine.start().await.unwrap();
    assert_eq!(a.engine.status(), SyncStatus::AuthDisabled);

    a.engine.update("inventory", json!([{"id": "inv_1"}]));
    settle().await;

    assert_eq!(backend.write_count(), 1);
    assert_eq!(a.engine.pending_count(), 0);
    assert_eq!(a.engine.status(), SyncStatus::AuthDisabled);
}

#[tokio::test(start_paused = true)]
async fn test_presence_and_cleanup() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "counter_a");
    let b = device(&backend, "counter_b");
    a.engine.start().await.unwrap();
    b.engine.start().await.unwrap();

    assert_eq!(a.engine.presence_status(), SyncStatus::Connected);
    let devices = a.engine.get_connected_devices().await;
    assert_eq!(devices.len(), 2);

    a.engine.cleanup().await;
    assert_eq!(a.engine.presence_status(), SyncStatus::Disconnected);

    let online: Vec<String> = b
        .engine
        .get_connected_devices()
        .await
        .into_iter()
        .map(|p| p.device_id)
        .collect();
    assert_eq!(online, vec!["counter_b".to_string()]);

    // Local writes still land; nothing reaches the remote.
    assert!(a.engine.update("inventory", json!([1])));
    settle().await;
    assert_eq!(backend.write_count(), 0);
    assert_eq!(a.engine.pending_count(), 1);
    assert!(!a.engine.force_sync().await);
}

#[tokio::test(start_paused = true)]
async fn test_force_sync_pulls_remote_snapshot() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "counter_a");
    a.engine.start().await.unwrap();

    let (calls, on_change) = counter();
    let _sub = a.engine.subscribe("inventory", json!([]), on_change);

    let other = backend.connect();
    other
        .write_path(&snapshot_path(&scope(), "inventory"), &json!(["from admin"]))
        .await
        .unwrap();

    assert!(a.engine.force_sync().await);
    assert_eq!(a.engine.snapshot("inventory"), Some(json!(["from admin"])));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.engine.status(), SyncStatus::Synced);
}

#[tokio::test(start_paused = true)]
async fn test_force_sync_offline_returns_false() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "counter_a");
    a.engine.set_network_online(false);
    assert!(!a.engine.force_sync().await);
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_seeds_and_replays_cached_value() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "counter_a");

    let (first, on_first) = counter();
    let sub = a.engine.subscribe("inventory", json!([]), on_first);
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(a.engine.snapshot("inventory"), Some(json!([])));
    assert_eq!(sub.path(), "inventory");

    a.engine.update("inventory", json!([1]));
    assert_eq!(first.load(Ordering::SeqCst), 1);

    let (second, on_second) = counter();
    let _late = a.engine.subscribe("inventory", json!([]), on_second);
    assert_eq!(second.load(Ordering::SeqCst), 1);

    sub.unsubscribe();
    a.engine.update("inventory", json!([2]));
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_path_rejected() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "counter_a");
    assert!(!a.engine.update("", json!(1)));
    assert!(!a.engine.update("stock/levels", json!(1)));
    assert_eq!(a.engine.pending_count(), 0);
}

#[test]
fn test_update_without_runtime_stays_local() {
    let backend = MemoryBackend::new();
    let a = device(&backend, "counter_a");
    assert!(a.engine.update("inventory", json!([1])));
    assert_eq!(a.engine.pending_count(), 1);
    assert_eq!(a.engine.status(), SyncStatus::Local);
}
