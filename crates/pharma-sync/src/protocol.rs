//! # Remote Protocol Messages
//!
//! Message types spoken between [`WsRemote`](crate::ws_remote::WsRemote) and
//! the real-time backend.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Remote Protocol Messages                           │
//! │                                                                         │
//! │  SESSION                                                               │
//! │  ───────                                                               │
//! │  client ───► authenticate { requestId, apiKey, projectId, deviceId }   │
//! │  server ◄─── authResult { requestId, state }                           │
//! │                                                                         │
//! │  DATA (point read / wholesale write)                                   │
//! │  ───────────────────────────────────                                   │
//! │  client ───► read { requestId, path }                                  │
//! │  server ◄─── readResult { requestId, data | null }                     │
//! │  client ───► write { requestId, path, data }                           │
//! │  client ───► pushEvent { requestId, path, event }                      │
//! │  server ◄─── ack { requestId }                                         │
//! │                                                                         │
//! │  EVENT LOG                                                             │
//! │  ─────────                                                             │
//! │  client ───► subscribe / unsubscribe { requestId, scope }              │
//! │  server ───► event { scope, event }          (server push, no reply)   │
//! │                                                                         │
//! │  PRESENCE                                                              │
//! │  ────────                                                              │
//! │  client ───► setPresence { requestId, path, presence }                 │
//! │  client ───► onDisconnect { requestId, path, presence }                │
//! │  client ───► readPresence { requestId, path }                          │
//! │  server ◄─── presenceList { requestId, devices }                       │
//! │                                                                         │
//! │  Any request may instead be answered with                              │
//! │  server ◄─── error { requestId, code, message }                        │
//! │                                                                         │
//! │  KEEPALIVE: ping / pong { timestamp }                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Adjacently tagged JSON text frames:
//! ```json
//! { "type": "write", "payload": { "requestId": 7, "path": "stores/s1/data/inventory", "data": [] } }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use pharma_core::{now_millis, DevicePresence, SyncEvent};

use crate::remote::AuthState;

/// Correlates a reply with the request that caused it.
pub type RequestId = u64;

// =============================================================================
// Main Message Enum (Tagged Union)
// =============================================================================

/// All remote protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum RemoteMessage {
    // =========================================================================
    // Requests (client → server)
    // =========================================================================
    Authenticate {
        request_id: RequestId,
        api_key: String,
        project_id: String,
        device_id: String,
    },

    Read {
        request_id: RequestId,
        path: String,
    },

    /// Overwrites the value at `path` wholesale.
    Write {
        request_id: RequestId,
        path: String,
        data: Value,
    },

    /// Appends to the event log. `path` ends in the event id, so a replayed
    /// event lands on the same key.
    PushEvent {
        request_id: RequestId,
        path: String,
        event: SyncEvent,
    },

    Subscribe {
        request_id: RequestId,
        scope: String,
    },

    Unsubscribe {
        request_id: RequestId,
        scope: String,
    },

    SetPresence {
        request_id: RequestId,
        path: String,
        presence: DevicePresence,
    },

    /// Value the server writes at `path` once this connection drops.
    OnDisconnect {
        request_id: RequestId,
        path: String,
        presence: DevicePresence,
    },

    ReadPresence {
        request_id: RequestId,
        path: String,
    },

    // =========================================================================
    // Replies (server → client)
    // =========================================================================
    Ack {
        request_id: RequestId,
    },

    AuthResult {
        request_id: RequestId,
        state: AuthState,
    },

    ReadResult {
        request_id: RequestId,
        #[serde(default)]
        data: Option<Value>,
    },

    PresenceList {
        request_id: RequestId,
        devices: Vec<DevicePresence>,
    },

    Error {
        #[serde(default)]
        request_id: Option<RequestId>,
        code: String,
        message: String,
    },

    // =========================================================================
    // Server Push
    // =========================================================================
    Event {
        scope: String,
        event: SyncEvent,
    },

    // =========================================================================
    // Keepalive
    // =========================================================================
    Ping {
        timestamp: i64,
    },

    Pong {
        timestamp: i64,
    },
}

// =============================================================================
// Helper Functions
// =============================================================================

impl RemoteMessage {
    /// Returns the message type name as a string (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            RemoteMessage::Authenticate { .. } => "authenticate",
            RemoteMessage::Read { .. } => "read",
            RemoteMessage::Write { .. } => "write",
            RemoteMessage::PushEvent { .. } => "pushEvent",
            RemoteMessage::Subscribe { .. } => "subscribe",
            RemoteMessage::Unsubscribe { .. } => "unsubscribe",
            RemoteMessage::SetPresence { .. } => "setPresence",
            RemoteMessage::OnDisconnect { .. } => "onDisconnect",
            RemoteMessage::ReadPresence { .. } => "readPresence",
            RemoteMessage::Ack { .. } => "ack",
            RemoteMessage::AuthResult { .. } => "authResult",
            RemoteMessage::ReadResult { .. } => "readResult",
            RemoteMessage::PresenceList { .. } => "presenceList",
            RemoteMessage::Error { .. } => "error",
            RemoteMessage::Event { .. } => "event",
            RemoteMessage::Ping { .. } => "ping",
            RemoteMessage::Pong { .. } => "pong",
        }
    }

    /// The id of the request a reply answers. `None` for requests, pushes
    /// and keepalives.
    pub fn reply_to(&self) -> Option<RequestId> {
        match self {
            RemoteMessage::Ack { request_id }
            | RemoteMessage::AuthResult { request_id, .. }
            | RemoteMessage::ReadResult { request_id, .. }
            | RemoteMessage::PresenceList { request_id, .. } => Some(*request_id),
            RemoteMessage::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }

    /// The request id carried by an outgoing request.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            RemoteMessage::Authenticate { request_id, .. }
            | RemoteMessage::Read { request_id, .. }
            | RemoteMessage::Write { request_id, .. }
            | RemoteMessage::PushEvent { request_id, .. }
            | RemoteMessage::Subscribe { request_id, .. }
            | RemoteMessage::Unsubscribe { request_id, .. }
            | RemoteMessage::SetPresence { request_id, .. }
            | RemoteMessage::OnDisconnect { request_id, .. }
            | RemoteMessage::ReadPresence { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    pub fn ping() -> Self {
        RemoteMessage::Ping {
            timestamp: now_millis(),
        }
    }

    pub fn pong(timestamp: i64) -> Self {
        RemoteMessage::Pong { timestamp }
    }

    pub fn error(request_id: Option<RequestId>, code: &str, message: &str) -> Self {
        RemoteMessage::Error {
            request_id,
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    /// Serializes to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
