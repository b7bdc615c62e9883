//! # Cache Facade
//!
//! Typed read/write/subscribe handle over one collection path.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  BillingView ──┐                                                        │
//! │  Dashboard ────┼──► CacheFacade<Transaction> ──► one engine Subscription │
//! │  Reports ──────┘    (fan-out, ref counted)       on "transactions"      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine subscription is created by the first local subscriber and
//! dropped with the last one. Every facade the engine hands out for a path
//! shares that path's subscriber set, so one path never holds more than
//! one engine subscription.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, warn};

use pharma_core::{CollectionItem, Snapshot};

use crate::engine::{SyncEngine, Subscription};

type SnapshotListener<T> = Arc<dyn Fn(&Snapshot<T>) + Send + Sync>;

pub(crate) struct FacadeShared<T: CollectionItem> {
    /// Lock order: `engine_sub` before `listeners`.
    engine_sub: Mutex<Option<Subscription>>,
    listeners: Mutex<BTreeMap<u64, SnapshotListener<T>>>,
    next_id: Mutex<u64>,
}

impl<T: CollectionItem> FacadeShared<T> {
    pub(crate) fn new() -> Self {
        Self {
            engine_sub: Mutex::new(None),
            listeners: Mutex::new(BTreeMap::new()),
            next_id: Mutex::new(1),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, BTreeMap<u64, SnapshotListener<T>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn engine_sub(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.engine_sub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fan_out(&self, snapshot: &Snapshot<T>) {
        let listeners: Vec<SnapshotListener<T>> = self.listeners().values().cloned().collect();
        for listener in listeners {
            listener(snapshot);
        }
    }

    fn remove(&self, id: u64) {
        let released = {
            let mut engine_sub = self.engine_sub();
            let mut listeners = self.listeners();
            listeners.remove(&id);
            if listeners.is_empty() {
                engine_sub.take()
            } else {
                None
            }
        };
        if let Some(subscription) = released {
            debug!(path = T::PATH.as_str(), "Last facade subscriber gone");
            subscription.unsubscribe();
        }
    }
}

/// Typed handle over the `T::PATH` collection.
pub struct CacheFacade<T: CollectionItem> {
    engine: SyncEngine,
    shared: Arc<FacadeShared<T>>,
}

impl<T: CollectionItem> Clone for CacheFacade<T> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T: CollectionItem> CacheFacade<T> {
    pub(crate) fn new(engine: SyncEngine, shared: Arc<FacadeShared<T>>) -> Self {
        Self { engine, shared }
    }

    pub fn path(&self) -> &'static str {
        T::PATH.as_str()
    }

    /// Registers `on_change`. If the cached snapshot differs from
    /// `initial`, `on_change` is called with it before this returns.
    pub fn subscribe<F>(&self, initial: Snapshot<T>, on_change: F) -> FacadeSubscription<T>
    where
        F: Fn(&Snapshot<T>) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.shared.next_id.lock().unwrap_or_else(PoisonError::into_inner);
            let id = *next;
            *next += 1;
            id
        };
        let on_change: SnapshotListener<T> = Arc::new(on_change);

        let catch_up = {
            let mut engine_sub = self.shared.engine_sub();
            self.shared.listeners().insert(id, on_change.clone());

            if engine_sub.is_none() {
                let initial_value = match initial.to_value() {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(path = self.path(), %e, "Initial snapshot not encodable");
                        serde_json::Value::Null
                    }
                };
                let weak: Weak<FacadeShared<T>> = Arc::downgrade(&self.shared);
                let path = self.path();
                let subscription = self.engine.subscribe(
                    path,
                    initial_value,
                    Arc::new(move |value: &serde_json::Value| {
                        let Some(shared) = weak.upgrade() else {
                            return;
                        };
                        match Snapshot::<T>::from_value(value) {
                            Ok(snapshot) => shared.fan_out(&snapshot),
                            Err(e) => warn!(%path, %e, "Undecodable snapshot not delivered"),
                        }
                    }),
                );
                *engine_sub = Some(subscription);
                None
            } else {
                self.current().filter(|current| *current != initial)
            }
        };

        if let Some(current) = catch_up {
            on_change(&current);
        }

        FacadeSubscription {
            shared: Arc::downgrade(&self.shared),
            id,
            active: true,
        }
    }

    /// The cached snapshot, if one exists and decodes.
    pub fn current(&self) -> Option<Snapshot<T>> {
        let value = self.engine.snapshot(self.path())?;
        match Snapshot::from_value(&value) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(path = self.path(), %e, "Cached snapshot does not decode");
                None
            }
        }
    }

    /// Replaces the collection. True once accepted locally.
    pub fn update(&self, snapshot: &Snapshot<T>) -> bool {
        match snapshot.to_value() {
            Ok(value) => self.engine.update(self.path(), value),
            Err(e) => {
                warn!(path = self.path(), %e, "Snapshot not encodable, update dropped");
                false
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.listeners().len()
    }
}

impl<T: CollectionItem> std::fmt::Debug for CacheFacade<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFacade")
            .field("path", &self.path())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// One facade subscriber. Unsubscribes on drop.
pub struct FacadeSubscription<T: CollectionItem> {
    shared: Weak<FacadeShared<T>>,
    id: u64,
    active: bool,
}

impl<T: CollectionItem> FacadeSubscription<T> {
    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(self.id);
        }
    }
}

impl<T: CollectionItem> Drop for FacadeSubscription<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FixedDeviceId;
    use chrono::NaiveDate;
    use pharma_core::{GstRate, InventoryItem, InventorySnapshot, Money};
    use pharma_store::MemoryStore;
    use serde_json::json;

    fn engine() -> SyncEngine {
        SyncEngine::builder()
            .store(Arc::new(MemoryStore::new()))
            .device_ids(Arc::new(FixedDeviceId::new("counter_1")))
            .store_id("store_1")
            .build()
            .unwrap()
    }

    fn paracetamol(quantity: i64) -> InventoryItem {
        InventoryItem {
            id: "inv_1".into(),
            name: "Paracetamol 500mg".into(),
            manufacturer: None,
            batch_number: "B2201".into(),
            expiry_date: NaiveDate::from_ymd_opt(2027, 3, 31).unwrap(),
            quantity,
            mrp: Money::from_paise(3_250),
            purchase_price: Money::from_paise(2_100),
            gst_rate: GstRate::GST_12,
            hsn_code: Some("3004".into()),
        }
    }

    fn recorder() -> (
        Arc<Mutex<Vec<InventorySnapshot>>>,
        impl Fn(&InventorySnapshot) + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |s: &InventorySnapshot| sink.lock().unwrap().push(s.clone()))
    }

    #[test]
    fn test_fan_out_to_every_subscriber() {
        let inventory = engine().collection::<InventoryItem>();
        let (first, on_first) = recorder();
        let (second, on_second) = recorder();

        let _a = inventory.subscribe(Snapshot::empty(), on_first);
        let _b = inventory.subscribe(Snapshot::empty(), on_second);
        assert!(first.lock().unwrap().is_empty());
        assert!(second.lock().unwrap().is_empty());

        let stocked = Snapshot::new(vec![paracetamol(40)]);
        assert!(inventory.update(&stocked));

        assert_eq!(first.lock().unwrap().as_slice(), &[stocked.clone()]);
        assert_eq!(second.lock().unwrap().as_slice(), &[stocked.clone()]);
        assert_eq!(inventory.current(), Some(stocked));
    }

    #[test]
    fn test_engine_subscription_released_with_last_subscriber() {
        let engine = engine();
        let inventory = engine.collection::<InventoryItem>();
        let (seen, on_change) = recorder();

        let a = inventory.subscribe(Snapshot::empty(), on_change);
        let b = inventory.subscribe(Snapshot::empty(), |_| {});
        assert_eq!(inventory.subscriber_count(), 2);

        a.unsubscribe();
        assert!(inventory.shared.engine_sub().is_some());
        drop(b);
        assert!(inventory.shared.engine_sub().is_none());

        inventory.update(&Snapshot::new(vec![paracetamol(1)]));
        assert!(seen.lock().unwrap().is_empty());

        let _c = inventory.subscribe(Snapshot::empty(), |_| {});
        assert!(inventory.shared.engine_sub().is_some());
    }

    #[test]
    fn test_repeated_lookups_share_one_subscriber_set() {
        let engine = engine();
        let billing = engine.collection::<InventoryItem>();
        let dashboard = engine.collection::<InventoryItem>();
        assert!(Arc::ptr_eq(&billing.shared, &dashboard.shared));

        let (first, on_first) = recorder();
        let (second, on_second) = recorder();
        let a = billing.subscribe(Snapshot::empty(), on_first);
        let _b = dashboard.subscribe(Snapshot::empty(), on_second);
        assert_eq!(billing.subscriber_count(), 2);
        assert_eq!(engine.collection::<InventoryItem>().subscriber_count(), 2);

        let stocked = Snapshot::new(vec![paracetamol(8)]);
        assert!(dashboard.update(&stocked));
        assert_eq!(first.lock().unwrap().as_slice(), &[stocked.clone()]);
        assert_eq!(second.lock().unwrap().as_slice(), &[stocked]);

        drop(billing);
        a.unsubscribe();
        assert!(dashboard.shared.engine_sub().is_some());
        assert_eq!(dashboard.subscriber_count(), 1);
    }

    #[test]
    fn test_late_subscriber_receives_cached_value() {
        let inventory = engine().collection::<InventoryItem>();
        let _a = inventory.subscribe(Snapshot::empty(), |_| {});
        let stocked = Snapshot::new(vec![paracetamol(12)]);
        inventory.update(&stocked);

        let (seen, on_change) = recorder();
        let _b = inventory.subscribe(Snapshot::empty(), on_change);
        assert_eq!(seen.lock().unwrap().as_slice(), &[stocked.clone()]);

        let (quiet, on_quiet) = recorder();
        let _c = inventory.subscribe(stocked, on_quiet);
        assert!(quiet.lock().unwrap().is_empty());
    }

    #[test]
    fn test_legacy_array_decodes() {
        let engine = engine();
        let item = paracetamol(5);
        engine.update("inventory", json!([serde_json::to_value(&item).unwrap()]));

        let current = engine.collection::<InventoryItem>().current().unwrap();
        assert_eq!(current.schema_version, 0);
        assert_eq!(current.items, vec![item]);
    }

    #[test]
    fn test_undecodable_value_not_delivered() {
        let engine = engine();
        let inventory = engine.collection::<InventoryItem>();
        let (seen, on_change) = recorder();
        let _sub = inventory.subscribe(Snapshot::empty(), on_change);

        engine.update("inventory", json!({"unexpected": true}));

        assert!(seen.lock().unwrap().is_empty());
        assert!(inventory.current().is_none());
    }
}
