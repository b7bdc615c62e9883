//! # pharma-store: Durable Local State
//!
//! The single source of truth while no remote backend is reachable.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Local Persistence                                │
//! │                                                                         │
//! │  SyncEngine (pharma-sync)                                              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  pharma-store (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │  ChangeQueue  │    │  LocalState   │    │ DurableStore │  │   │
//! │  │   │  (queue.rs)   │───►│ (namespaced   │───►│   (trait)    │  │   │
//! │  │   │               │    │  typed keys)  │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────┬───────┘  │   │
//! │  │                                                    │          │   │
//! │  │                              ┌─────────────────────┴──────┐   │   │
//! │  │                              ▼                            ▼   │   │
//! │  │                       ┌─────────────┐           ┌──────────────┐│  │
//! │  │                       │ MemoryStore │           │ SqliteStore  ││  │
//! │  │                       │ (tests)     │           │ mirror +     ││  │
//! │  │                       └─────────────┘           │ writer task  ││  │
//! │  │                                                 └──────────────┘│  │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`durable`] - The `DurableStore` contract and the in-memory store
//! - [`sqlite`] - SQLite-backed store with write-through
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`repository`] - SQL for the key-value table
//! - [`local_state`] - Typed, namespaced accessors for the sync keys
//! - [`queue`] - The change queue
//! - [`error`] - Storage error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pharma_store::{DbConfig, LocalState, SqliteStore};
//!
//! let store = Arc::new(SqliteStore::open(DbConfig::new("sync.db")).await?);
//! let state = LocalState::new(store.clone(), "pharma_sync_");
//! state.set_last_sync_time(now);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod durable;
pub mod error;
pub mod local_state;
pub mod migrations;
pub mod pool;
pub mod queue;
pub mod repository;
pub mod sqlite;

// =============================================================================
// Re-exports
// =============================================================================

pub use durable::{DurableStore, MemoryStore};
pub use error::{StoreError, StoreResult};
pub use local_state::LocalState;
pub use pool::{Database, DbConfig};
pub use queue::ChangeQueue;
pub use repository::kv::KvRepository;
pub use sqlite::SqliteStore;
