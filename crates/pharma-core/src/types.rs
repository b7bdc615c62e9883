//! # Sync Record Types
//!
//! The records every layer of the sync core passes around.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Sync Records                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   SyncEvent     │   │   SyncStatus    │   │ DevicePresence  │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id             │   │  local          │   │  online         │       │
//! │  │  type           │   │  syncing        │   │  lastSeen       │       │
//! │  │  path           │   │  synced         │   │  deviceId       │       │
//! │  │  data (full     │   │  offline        │   │  userAgent      │       │
//! │  │    snapshot)    │   │  error          │   └─────────────────┘       │
//! │  │  timestamp (ms) │   │  no-api-key     │                             │
//! │  │  deviceId       │   │  auth-disabled  │                             │
//! │  └─────────────────┘   │  connected /    │                             │
//! │                        │  disconnected   │                             │
//! │                        └─────────────────┘                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Event Identity
//! `id = "{deviceId}_{timestamp}_{random}"`. The id is what the change queue
//! dequeues by and what the remote event log is keyed by, so replaying the
//! same event twice never produces a second write.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;
use uuid::Uuid;

use crate::error::CoreError;
use crate::EVENT_ID_SUFFIX_LEN;

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// =============================================================================
// Sync Event
// =============================================================================

/// Kind of mutation an event records.
///
/// Only `Update` is produced today; `Add` and `Delete` are accepted on the
/// wire and applied with the same whole-snapshot semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum SyncEventKind {
    Update,
    Delete,
    Add,
}

/// An immutable record of one mutation of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SyncEvent {
    /// `{deviceId}_{timestamp}_{random}`, globally unique.
    pub id: String,

    #[serde(rename = "type")]
    pub kind: SyncEventKind,

    /// Logical collection name, e.g. `inventory`.
    pub path: String,

    /// Full collection snapshot at the time of the write (not a diff).
    #[ts(type = "unknown")]
    pub data: Value,

    /// Producer-local milliseconds since epoch.
    #[ts(type = "number")]
    pub timestamp: i64,

    pub device_id: String,
}

impl SyncEvent {
    /// Creates an event with a freshly generated id.
    pub fn new(
        kind: SyncEventKind,
        device_id: &str,
        path: &str,
        data: Value,
        timestamp: i64,
    ) -> Self {
        Self {
            id: Self::make_id(device_id, timestamp),
            kind,
            path: path.to_string(),
            data,
            timestamp,
            device_id: device_id.to_string(),
        }
    }

    /// Shorthand for the only kind the engine produces.
    pub fn update(device_id: &str, path: &str, data: Value, timestamp: i64) -> Self {
        Self::new(SyncEventKind::Update, device_id, path, data, timestamp)
    }

    /// Builds an event id from its parts plus a random suffix.
    pub fn make_id(device_id: &str, timestamp: i64) -> String {
        let mut suffix = Uuid::new_v4().simple().to_string();
        suffix.truncate(EVENT_ID_SUFFIX_LEN);
        format!("{}_{}_{}", device_id, timestamp, suffix)
    }

    /// True when this device produced the event.
    #[inline]
    pub fn is_from(&self, device_id: &str) -> bool {
        self.device_id == device_id
    }
}

// =============================================================================
// Sync Status
// =============================================================================

/// The engine's current condition. Exactly one value holds at a time.
///
/// ## State Machine
/// ```text
///   local ──► syncing ──┬──► synced ──(next mutation)──► local
///                       └──► error  ──(retry / force)──► syncing
///
///   Side-states, entered while their precondition holds:
///     no-api-key     credentials missing or malformed
///     offline        network reported unavailable
///     auth-disabled  backend refuses anonymous sign-in
///
///   Presence sub-channel: connected / disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
#[ts(export)]
pub enum SyncStatus {
    /// No attempt to reach the remote yet, or local changes pending.
    Local,
    /// Flush in flight.
    Syncing,
    /// Queue empty, last flush succeeded.
    Synced,
    /// Network unavailable.
    Offline,
    /// Last flush failed; a retry may be scheduled.
    Error,
    /// Remote backend not configured.
    NoApiKey,
    /// Remote backend rejects anonymous auth by policy.
    AuthDisabled,
    Connected,
    Disconnected,
}

impl SyncStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Local => "local",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Offline => "offline",
            SyncStatus::Error => "error",
            SyncStatus::NoApiKey => "no-api-key",
            SyncStatus::AuthDisabled => "auth-disabled",
            SyncStatus::Connected => "connected",
            SyncStatus::Disconnected => "disconnected",
        }
    }

    /// Side-states override the primary cycle while their precondition holds.
    pub const fn is_side_state(&self) -> bool {
        matches!(
            self,
            SyncStatus::Offline | SyncStatus::NoApiKey | SyncStatus::AuthDisabled
        )
    }

    /// Idle states are replaced by `local` when a new mutation arrives.
    pub const fn is_idle(&self) -> bool {
        matches!(self, SyncStatus::Local | SyncStatus::Synced)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(SyncStatus::Local),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "offline" => Ok(SyncStatus::Offline),
            "error" => Ok(SyncStatus::Error),
            "no-api-key" => Ok(SyncStatus::NoApiKey),
            "auth-disabled" => Ok(SyncStatus::AuthDisabled),
            "connected" => Ok(SyncStatus::Connected),
            "disconnected" => Ok(SyncStatus::Disconnected),
            _ => Err(format!("Invalid sync status: {}", s)),
        }
    }
}

// =============================================================================
// Device Presence
// =============================================================================

/// One device's liveness marker within a store.
///
/// Written on connect; flipped to `online: false` by the remote's own
/// disconnect hook, never by polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct DevicePresence {
    pub online: bool,

    /// Milliseconds since epoch.
    #[ts(type = "number")]
    pub last_seen: i64,

    pub device_id: String,

    pub user_agent: String,
}

impl DevicePresence {
    pub fn online(device_id: &str, user_agent: &str, now: i64) -> Self {
        Self {
            online: true,
            last_seen: now,
            device_id: device_id.to_string(),
            user_agent: user_agent.to_string(),
        }
    }

    /// The same record marked offline at `now`.
    pub fn went_offline(&self, now: i64) -> Self {
        Self {
            online: false,
            last_seen: now,
            ..self.clone()
        }
    }
}

// =============================================================================
// Collection Path
// =============================================================================

/// The logical collections that are kept in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum CollectionPath {
    Inventory,
    Transactions,
    InwardEntries,
}

impl CollectionPath {
    pub const ALL: [CollectionPath; 3] = [
        CollectionPath::Inventory,
        CollectionPath::Transactions,
        CollectionPath::InwardEntries,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            CollectionPath::Inventory => "inventory",
            CollectionPath::Transactions => "transactions",
            CollectionPath::InwardEntries => "inwardEntries",
        }
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionPath {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CollectionPath::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| CoreError::UnknownCollection(s.to_string()))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_id_format() {
        let event = SyncEvent::update("device_abc", "inventory", json!([]), 1234);
        let parts: Vec<&str> = event.id.rsplitn(2, '_').collect();
        assert_eq!(parts[0].len(), EVENT_ID_SUFFIX_LEN);
        assert_eq!(parts[1], "device_abc_1234");
        assert!(event.is_from("device_abc"));
        assert!(!event.is_from("device_xyz"));
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = SyncEvent::update("d", "inventory", json!(1), 5);
        let b = SyncEvent::update("d", "inventory", json!(1), 5);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = SyncEvent::update("d1", "transactions", json!({"x": 1}), 42);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "update");
        assert_eq!(value["deviceId"], "d1");
        assert_eq!(value["timestamp"], 42);

        let back: SyncEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&SyncStatus::NoApiKey).unwrap(),
            "\"no-api-key\""
        );
        assert_eq!(
            serde_json::to_string(&SyncStatus::AuthDisabled).unwrap(),
            "\"auth-disabled\""
        );
        assert_eq!("synced".parse::<SyncStatus>().unwrap(), SyncStatus::Synced);
        assert!("bogus".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_status_classes() {
        assert!(SyncStatus::Offline.is_side_state());
        assert!(!SyncStatus::Error.is_side_state());
        assert!(SyncStatus::Synced.is_idle());
        assert!(!SyncStatus::Syncing.is_idle());
    }

    #[test]
    fn test_presence_went_offline() {
        let p = DevicePresence::online("d1", "agent", 10);
        let off = p.went_offline(20);
        assert!(!off.online);
        assert_eq!(off.last_seen, 20);
        assert_eq!(off.device_id, "d1");
    }

    #[test]
    fn test_collection_path_round_trip() {
        for path in CollectionPath::ALL {
            assert_eq!(path.as_str().parse::<CollectionPath>().unwrap(), path);
        }
        assert_eq!(
            serde_json::to_string(&CollectionPath::InwardEntries).unwrap(),
            "\"inwardEntries\""
        );
        assert!("customers".parse::<CollectionPath>().is_err());
    }
}
