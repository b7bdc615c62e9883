//! # Sync Commands
//!
//! Operator console commands for a running node.
//!
//! ## Command Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Commands                                    │
//! │                                                                         │
//! │  status        - Effective status, presence, pending count             │
//! │  config        - Device, store and remote settings (no key)            │
//! │  devices       - Presence records of this store's devices              │
//! │  pending       - Number of queued local changes                        │
//! │  collections   - Item counts of the cached collections                 │
//! │  force-sync    - Flush, then pull every collection                     │
//! │  online        - Report the network as available                       │
//! │  offline       - Report the network as unavailable                     │
//! │  help / quit                                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::str::FromStr;
use tracing::info;

use pharma_core::{InventoryItem, InwardEntry, Money, Transaction};

use crate::error::{AppError, AppResult};
use crate::state::SyncState;

/// One parsed console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Config,
    Devices,
    Pending,
    Collections,
    ForceSync,
    SetOnline(bool),
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = AppError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Err(AppError::InvalidArgument("empty command".into()));
        };
        if let Some(extra) = words.next() {
            return Err(AppError::InvalidArgument(format!(
                "'{}' takes no arguments, got '{}'",
                name, extra
            )));
        }

        match name.to_ascii_lowercase().as_str() {
            "status" => Ok(Command::Status),
            "config" => Ok(Command::Config),
            "devices" => Ok(Command::Devices),
            "pending" => Ok(Command::Pending),
            "collections" => Ok(Command::Collections),
            "force-sync" | "sync" => Ok(Command::ForceSync),
            "online" => Ok(Command::SetOnline(true)),
            "offline" => Ok(Command::SetOnline(false)),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(AppError::UnknownCommand(other.to_string())),
        }
    }
}

/// What the console prints after a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Json(Value),
    Text(String),
    Quit,
}

pub const HELP: &str = "commands: status, config, devices, pending, collections, \
force-sync, online, offline, help, quit";

/// Runs one command against the node's state.
pub async fn execute(state: &SyncState, command: Command) -> AppResult<Reply> {
    let engine = state.engine();
    match command {
        Command::Status => to_json(&state.get_status()),
        Command::Config => to_json(&state.get_config()),
        Command::Devices => to_json(&engine.get_connected_devices().await),
        Command::Pending => Ok(Reply::Json(json!({ "pending": engine.pending_count() }))),
        Command::Collections => to_json(&collection_summary(state)),
        Command::ForceSync => {
            info!("Force sync requested from console");
            let synced = engine.force_sync().await;
            Ok(Reply::Json(json!({
                "synced": synced,
                "status": engine.status(),
            })))
        }
        Command::SetOnline(online) => {
            engine.set_network_online(online);
            Ok(Reply::Json(json!({
                "networkOnline": engine.is_network_online(),
                "status": engine.status(),
            })))
        }
        Command::Help => Ok(Reply::Text(HELP.to_string())),
        Command::Quit => Ok(Reply::Quit),
    }
}

fn to_json<T: Serialize>(value: &T) -> AppResult<Reply> {
    serde_json::to_value(value)
        .map(Reply::Json)
        .map_err(|e| AppError::InvalidArgument(e.to_string()))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSummary {
    pub inventory_batches: usize,
    pub expired_batches: usize,
    pub stock_value: String,
    pub transactions: usize,
    pub sales_total: String,
    pub inward_entries: usize,
}

fn collection_summary(state: &SyncState) -> CollectionSummary {
    let engine = state.engine();
    let today = Utc::now().date_naive();

    let inventory = engine
        .collection::<InventoryItem>()
        .current()
        .map(|s| s.items)
        .unwrap_or_default();
    let transactions = engine
        .collection::<Transaction>()
        .current()
        .map(|s| s.items)
        .unwrap_or_default();
    let inward = engine
        .collection::<InwardEntry>()
        .current()
        .map(|s| s.items)
        .unwrap_or_default();

    CollectionSummary {
        inventory_batches: inventory.len(),
        expired_batches: inventory.iter().filter(|i| i.is_expired(today)).count(),
        stock_value: inventory
            .iter()
            .map(InventoryItem::stock_value)
            .sum::<Money>()
            .to_string(),
        transactions: transactions.len(),
        sales_total: transactions
            .iter()
            .map(Transaction::total)
            .sum::<Money>()
            .to_string(),
        inward_entries: inward.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LogEmitter;
    use chrono::NaiveDate;
    use pharma_core::{GstRate, Snapshot};
    use pharma_store::MemoryStore;
    use pharma_sync::{FixedDeviceId, SyncConfig, SyncEngine, SyncStatus};
    use std::sync::{Arc, RwLock};

    fn local_state() -> SyncState {
        let last_error = Arc::new(RwLock::new(None));
        let engine = SyncEngine::builder()
            .store(Arc::new(MemoryStore::new()))
            .device_ids(Arc::new(FixedDeviceId::new("counter_1")))
            .store_id("store_1")
            .emitter(Arc::new(LogEmitter::new(last_error.clone())))
            .build()
            .unwrap();
        SyncState::new(engine, None, SyncConfig::default(), last_error)
    }

    fn batch(id: &str, quantity: i64, expiry: NaiveDate) -> InventoryItem {
        InventoryItem {
            id: id.into(),
            name: "Amoxicillin 250mg".into(),
            manufacturer: Some("Cipla".into()),
            batch_number: format!("B-{}", id),
            expiry_date: expiry,
            quantity,
            mrp: Money::from_paise(9_000),
            purchase_price: Money::from_paise(6_000),
            gst_rate: GstRate::GST_12,
            hsn_code: None,
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("status".parse::<Command>().unwrap(), Command::Status);
        assert_eq!("  SYNC ".parse::<Command>().unwrap(), Command::ForceSync);
        assert_eq!("offline".parse::<Command>().unwrap(), Command::SetOnline(false));
        assert_eq!("exit".parse::<Command>().unwrap(), Command::Quit);

        let err = "teleport".parse::<Command>().unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_COMMAND");

        let err = "status now".parse::<Command>().unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        assert!("   ".parse::<Command>().is_err());
    }

    #[tokio::test]
    async fn test_status_without_remote() {
        let state = local_state();
        let Reply::Json(status) = execute(&state, Command::Status).await.unwrap() else {
            panic!("expected json");
        };
        assert_eq!(status["status"], "no-api-key");
        assert_eq!(status["remoteConfigured"], false);
        assert_eq!(status["pendingCount"], 0);
    }

    #[tokio::test]
    async fn test_offline_toggle_and_force_sync() {
        let state = local_state();

        let Reply::Json(reply) = execute(&state, Command::SetOnline(false)).await.unwrap() else {
            panic!("expected json");
        };
        assert_eq!(reply["networkOnline"], false);

        let Reply::Json(reply) = execute(&state, Command::ForceSync).await.unwrap() else {
            panic!("expected json");
        };
        assert_eq!(reply["synced"], false);
        assert_eq!(state.engine().status(), SyncStatus::NoApiKey);
    }

    #[tokio::test]
    async fn test_collection_summary_reads_cache() {
        let state = local_state();
        let expired = NaiveDate::from_ymd_opt(2020, 1, 31).unwrap();
        let fresh = NaiveDate::from_ymd_opt(2099, 12, 31).unwrap();
        let inventory = state.engine().collection::<InventoryItem>();
        assert!(inventory.update(&Snapshot::new(vec![
            batch("a", 10, expired),
            batch("b", 5, fresh),
        ])));

        let Reply::Json(summary) = execute(&state, Command::Collections).await.unwrap() else {
            panic!("expected json");
        };
        assert_eq!(summary["inventoryBatches"], 2);
        assert_eq!(summary["expiredBatches"], 1);
        assert_eq!(summary["stockValue"], "₹900.00");
        assert_eq!(summary["transactions"], 0);
        assert_eq!(state.engine().pending_count(), 1);
    }

    #[tokio::test]
    async fn test_help_and_quit() {
        let state = local_state();
        assert_eq!(
            execute(&state, Command::Help).await.unwrap(),
            Reply::Text(HELP.to_string())
        );
        assert_eq!(execute(&state, Command::Quit).await.unwrap(), Reply::Quit);
    }
}
