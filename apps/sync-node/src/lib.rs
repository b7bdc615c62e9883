//! # pharma-sync-node
//!
//! Composition root for one device: wires the SQLite durable store, the
//! WebSocket remote and the sync engine together, then serves a console.
//!
//! ## Module Structure
//! ```text
//! pharma_sync_node/
//! ├── lib.rs          ◄── You are here (startup, console loop, shutdown)
//! ├── error.rs        ◄── AppError + console error response
//! ├── commands/
//! │   └── sync.rs     ◄── Command parsing and execution
//! └── state/
//!     └── sync.rs     ◄── SyncState, LogEmitter, connectivity bridge
//! ```
//!
//! ## Runtime Wiring
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  stdin ──► Command ──► execute ──► SyncState ──► SyncEngine             │
//! │                                                    │        │           │
//! │                         SqliteStore ◄──────────────┘        │           │
//! │                                                             ▼           │
//! │  WsRemote.connection_state ──► bridge_connectivity ──► set_network_online
//! │                                                                         │
//! │  Ctrl+C / SIGTERM / quit ──► engine.cleanup ──► remote.shutdown         │
//! │                          ──► store.close (flushes pending writes)       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod commands;
pub mod error;
pub mod state;

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use pharma_store::{DbConfig, LocalState, SqliteStore};
use pharma_sync::{
    DeviceIdProvider, FixedDeviceId, PersistedDeviceId, RemoteChannel, SyncConfig, SyncEngine,
    WsRemote,
};

use commands::sync::{execute, Command, Reply};
use error::{AppError, AppResult};
use state::{bridge_connectivity, LogEmitter, SyncState};

/// Runs the node until `quit`, Ctrl+C or SIGTERM.
///
/// ## Startup Sequence
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │                       Node Startup                                      │
/// │                                                                         │
/// │  1. Initialize Logging ───────────────────────────────────────────────► │
/// │     • tracing-subscriber with env filter, written to stderr             │
/// │                                                                         │
/// │  2. Load Configuration ───────────────────────────────────────────────► │
/// │     • sync.toml, then PHARMA_* environment overrides                    │
/// │                                                                         │
/// │  3. Open Durable Store ───────────────────────────────────────────────► │
/// │     • SQLite with WAL mode, migrations, in-memory mirror                │
/// │                                                                         │
/// │  4. Connect Remote (only with valid credentials) ─────────────────────► │
/// │     • Reconnects with backoff in the background                         │
/// │                                                                         │
/// │  5. Build & Start Engine ─────────────────────────────────────────────► │
/// │     • Replays the persisted change queue once connected                 │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
pub async fn run(config_path: Option<PathBuf>) -> AppResult<()> {
    init_tracing();

    info!("Starting pharmacy sync node");

    let config = SyncConfig::load(config_path.as_deref())?;
    let db_path = database_path(&config)?;
    info!(?db_path, "Database path determined");

    let store = Arc::new(SqliteStore::open(DbConfig::new(db_path)).await?);
    info!("Durable store opened");

    let device_id = match config.device.id.clone() {
        Some(id) => id,
        None => PersistedDeviceId::new(LocalState::new(store.clone(), config.key_prefix()))
            .device_id(),
    };

    let remote = match config.credentials() {
        Some(credentials) => Some(WsRemote::connect(
            credentials,
            &config.remote,
            device_id.clone(),
        )?),
        None => {
            warn!("No valid API key or project id, running local-only");
            None
        }
    };

    let last_error = Arc::new(RwLock::new(None));
    let engine = SyncEngine::builder()
        .config(&config)
        .store(store.clone())
        .device_ids(Arc::new(FixedDeviceId::new(device_id)))
        .remote(
            remote
                .clone()
                .map(|ws| Arc::new(ws) as Arc<dyn RemoteChannel>),
        )
        .emitter(Arc::new(LogEmitter::new(last_error.clone())))
        .build()?;

    if let Some(ref ws) = remote {
        engine.set_network_online(ws.is_connected());
        tokio::spawn(bridge_connectivity(engine.clone(), ws.connection_state()));
    }
    engine.start().await?;

    info!(
        device_id = engine.device_id(),
        store_id = engine.store_id(),
        status = %engine.status(),
        "Sync engine started"
    );

    let state = SyncState::new(engine, remote, config, last_error);

    tokio::select! {
        end = console(&state) => {
            if end? == ConsoleEnd::Closed {
                info!("Console input closed, waiting for shutdown signal");
                shutdown_signal().await;
            }
        }
        _ = shutdown_signal() => {}
    }

    state.shutdown().await;
    store.close().await;
    info!("Sync node stopped");
    Ok(())
}

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=pharma=trace` - Show trace for pharma crates only
/// - Default: INFO, with DEBUG for pharma crates
///
/// Logs go to stderr so console replies on stdout stay parseable.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pharma=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::TRACE)
        .with_writer(std::io::stderr)
        .init();
}

/// Resolves the SQLite file and creates its directory.
///
/// `PHARMA_DB_PATH` or `[storage] database_path` override the platform
/// data directory.
fn database_path(config: &SyncConfig) -> AppResult<PathBuf> {
    let path = config.database_path().ok_or(AppError::NoDatabasePath)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleEnd {
    Quit,
    Closed,
}

async fn console(state: &SyncState) -> AppResult<ConsoleEnd> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", commands::sync::HELP);

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let reply = match line.parse::<Command>() {
            Ok(command) => execute(state, command).await,
            Err(e) => Err(e),
        };

        match reply {
            Ok(Reply::Json(value)) => println!("{}", value),
            Ok(Reply::Text(text)) => println!("{}", text),
            Ok(Reply::Quit) => return Ok(ConsoleEnd::Quit),
            Err(e) => match serde_json::to_string(&e.to_response()) {
                Ok(json) => println!("{}", json),
                Err(_) => println!("{}", e),
            },
        }
    }

    Ok(ConsoleEnd::Closed)
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(%e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(%e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping sync node...");
}
