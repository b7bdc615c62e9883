//! # Pharmacy Sync Node Entry Point
//!
//! Runs one device's sync engine headless, with an operator console on
//! stdin.
//!
//! ## Process Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        pharma-sync-node                                 │
//! │                                                                         │
//! │  main.rs ────► Builds the runtime, hands over to lib.rs                │
//! │                                                                         │
//! │  lib.rs ─────► Logging, config, store, remote, engine, console         │
//! │                                                                         │
//! │  commands/ ──► status, devices, pending, force-sync, online, offline   │
//! │                                                                         │
//! │  state/ ─────► SyncState, LogEmitter, status DTOs                      │
//! │                                                                         │
//! │  sync.db (SQLite, WAL) ◄── pharma-store     WebSocket ◄── pharma-sync  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```text
//! pharma-sync-node [path/to/sync.toml]
//! RUST_LOG=pharma=trace PHARMA_DB_PATH=/tmp/sync.db pharma-sync-node
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);

    match pharma_sync_node::run(config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(%e, "Sync node failed");
            ExitCode::FAILURE
        }
    }
}
