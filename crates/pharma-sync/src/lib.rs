//! # pharma-sync: Multi-Device Sync for the Pharmacy POS
//!
//! Keeps the inventory, transactions and inward-entry collections of one
//! store consistent across devices that may be offline, racing each other,
//! or running without cloud credentials at all.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  UI collaborators                                                       │
//! │     │ CacheFacade<T>: subscribe / update / current                      │
//! │  ┌──▼───────────────────────────────────────────────────────────────┐  │
//! │  │                     SyncEngine (one per process)                 │  │
//! │  │                                                                  │  │
//! │  │  update ──► snapshot + DurableStore ──► subscribers (sync)       │  │
//! │  │         └─► ChangeQueue ──► single-flight flush ──► remote       │  │
//! │  │  remote event ──► echo / duplicate filter ──► snapshot + notify  │  │
//! │  │  status: watch channel + SyncEventEmitter                        │  │
//! │  └──────────────┬───────────────────────────────────┬───────────────┘  │
//! │                 │                                   │                   │
//! │  ┌──────────────▼─────────────┐   ┌─────────────────▼────────────────┐ │
//! │  │ pharma-store               │   │ RemoteChannel                    │ │
//! │  │  LocalState, ChangeQueue   │   │  MemoryBackend (in-process)      │ │
//! │  │  MemoryStore, SqliteStore  │   │  WsRemote ─► Transport (ws,      │ │
//! │  └────────────────────────────┘   │              reconnect, backoff) │ │
//! │                                   └──────────────────────────────────┘ │
//! │                                                                         │
//! │  STATUS VALUES (to the UI):                                            │
//! │  • local / syncing / synced / error   primary cycle                    │
//! │  • offline / no-api-key / auth-disabled  side-states                   │
//! │  • connected / disconnected           presence sub-channel             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`engine`] - `SyncEngine`, its builder and status emitter
//! - [`facade`] - Typed per-collection `CacheFacade`
//! - [`remote`] - The `RemoteChannel` contract and remote path layout
//! - [`memory`] - In-process shared backend with fault injection
//! - [`ws_remote`] - WebSocket `RemoteChannel` with request correlation
//! - [`transport`] - WebSocket client with reconnection
//! - [`protocol`] - Wire messages spoken by `WsRemote`
//! - [`device`] - Device and store identity
//! - [`config`] - TOML + environment configuration
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pharma_sync::{SyncConfig, SyncEngine, WsRemote};
//!
//! let config = SyncConfig::load_or_default(None);
//! let engine = SyncEngine::builder()
//!     .config(&config)
//!     .store(store)
//!     .remote(remote)
//!     .build()?;
//! engine.start().await?;
//!
//! let inventory = engine.collection::<InventoryItem>();
//! let _sub = inventory.subscribe(Snapshot::empty(), |snapshot| render(snapshot));
//! inventory.update(&Snapshot::new(items));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod facade;
pub mod memory;
pub mod protocol;
pub mod remote;
pub mod transport;
pub mod ws_remote;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{
    DeviceSettings, RemoteCredentials, RemoteSettings, RetrySettings, StorageSettings,
    StoreSettings, SyncConfig,
};
pub use device::{resolve_store_id, DeviceIdProvider, FixedDeviceId, PersistedDeviceId};
pub use engine::{
    ChangeCallback, NoOpEmitter, Subscription, SyncEngine, SyncEngineBuilder, SyncEventEmitter,
};
pub use error::{SyncError, SyncResult};
pub use facade::{CacheFacade, FacadeSubscription};
pub use memory::{MemoryBackend, MemoryRemote};
pub use protocol::RemoteMessage;
pub use remote::{AuthState, RemoteChannel, RemoteSubscription};
pub use transport::ConnectionState;
pub use ws_remote::WsRemote;

pub use pharma_core::SyncStatus;
