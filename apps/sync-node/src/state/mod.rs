//! # Node State
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SyncState ─── SyncEngine (clone of the running engine)                 │
//! │            ├── WsRemote   (None when credentials are absent)            │
//! │            ├── SyncConfig (as loaded at startup)                        │
//! │            └── last error (shared with LogEmitter)                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod sync;

pub use sync::{bridge_connectivity, LogEmitter, SyncConfigDto, SyncState, SyncStatusDto};
