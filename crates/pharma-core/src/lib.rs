//! # pharma-core: Shared Types for the Pharmacy Sync Core
//!
//! Pure types shared by the durable store, the sync engine and the UI
//! bindings. Nothing in here touches storage, the network or a clock that
//! the caller did not hand in (apart from [`now_millis`]).
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Pharmacy Sync Architecture                         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │          UI collaborators (billing, inventory, inward)          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ CacheFacade<T>                         │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │      pharma-sync: SyncEngine, RemoteChannel, config             │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │      pharma-store: DurableStore, LocalState, ChangeQueue        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ pharma-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌─────────────┐  ┌───────────┐  ┌──────────┐ │   │
//! │  │   │   types   │  │ collections │  │   money   │  │validation│ │   │
//! │  │   │ SyncEvent │  │ Inventory   │  │  Money    │  │ api key  │ │   │
//! │  │   │ SyncStatus│  │ Transaction │  │  GstRate  │  │ project  │ │   │
//! │  │   │ Presence  │  │ InwardEntry │  │           │  │ paths    │ │   │
//! │  │   └───────────┘  └─────────────┘  └───────────┘  └──────────┘ │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Sync records: events, status, presence, collection paths
//! - [`collections`] - Versioned snapshot schemas for each synced collection
//! - [`money`] - Paise-based money and GST rates
//! - [`error`] - Domain error types
//! - [`validation`] - Credential and identifier format checks
//!
//! ## Example Usage
//!
//! ```rust
//! use pharma_core::{SyncEvent, SyncEventKind};
//! use serde_json::json;
//!
//! let event = SyncEvent::update("device_1", "inventory", json!([]), 1_700_000_000_000);
//! assert_eq!(event.kind, SyncEventKind::Update);
//! assert!(event.id.starts_with("device_1_1700000000000_"));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod collections;
pub mod error;
pub mod money;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use collections::{
    BillLine, CollectionItem, InventoryItem, InventorySnapshot, InwardEntry, InwardLine,
    InwardSnapshot, PaymentMode, Snapshot, Transaction, TransactionSnapshot,
};
pub use error::{CoreError, CoreResult, ValidationError};
pub use money::{GstRate, Money};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Prefix every locally persisted key is namespaced under.
pub const DEFAULT_KEY_PREFIX: &str = "pharma_sync_";

/// Length of the random suffix appended to event ids.
pub const EVENT_ID_SUFFIX_LEN: usize = 9;
