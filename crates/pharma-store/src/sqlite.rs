//! # SQLite Durable Store
//!
//! Serves the synchronous [`DurableStore`] contract on top of async SQLite.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SqliteStore                                        │
//! │                                                                         │
//! │  open() ──► load every row into the mirror (once)                      │
//! │                                                                         │
//! │  get(key) ───────────► mirror (RwLock<HashMap>)                         │
//! │                                                                         │
//! │  set(key, v) ──┬─────► mirror updated immediately                       │
//! │                │                                                        │
//! │                └─────► mpsc ──► writer task ──► UPSERT kv_entries       │
//! │                                 (one task, so writes land in            │
//! │                                  call order)                            │
//! │                                                                         │
//! │  flush().await ──────► barrier through the same channel                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failed background write is logged with its kind; the mirror keeps the
//! new value, so the process sees its own write even when the disk did not.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::durable::{report_dropped_write, DurableStore};
use crate::error::{StoreError, StoreResult};
use crate::pool::{Database, DbConfig};
use crate::repository::kv::KvRepository;

enum WriteOp {
    Put { key: String, json: String },
    Delete { key: String },
    Flush(oneshot::Sender<()>),
}

/// Durable store backed by a SQLite file.
pub struct SqliteStore {
    db: Database,
    mirror: RwLock<HashMap<String, Value>>,
    writer: mpsc::UnboundedSender<WriteOp>,
}

impl SqliteStore {
    /// Opens the database, loads every entry and starts the writer task.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn open(config: DbConfig) -> StoreResult<Self> {
        let db = Database::new(config).await?;
        let rows = db.kv().load_all().await?;

        let mut mirror = HashMap::with_capacity(rows.len());
        for (key, json) in rows {
            match serde_json::from_str::<Value>(&json) {
                Ok(value) => {
                    mirror.insert(key, value);
                }
                Err(e) => warn!(key = %key, ?e, "Skipping unreadable durable entry"),
            }
        }

        info!(entries = mirror.len(), "Durable store loaded");

        let (writer, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(db.kv(), rx));

        Ok(Self {
            db,
            mirror: RwLock::new(mirror),
            writer,
        })
    }

    /// Waits until every write issued before this call is committed.
    pub async fn flush(&self) -> StoreResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.writer
            .send(WriteOp::Flush(done_tx))
            .map_err(|_| StoreError::WriterClosed)?;
        done_rx.await.map_err(|_| StoreError::WriterClosed)
    }

    /// Flushes pending writes and closes the pool.
    pub async fn close(&self) {
        if let Err(e) = self.flush().await {
            warn!(?e, "Flush before close failed");
        }
        self.db.close().await;
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn enqueue(&self, key: &str, op: WriteOp) {
        if self.writer.send(op).is_err() {
            report_dropped_write(key, &StoreError::WriterClosed);
        }
    }
}

impl DurableStore for SqliteStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.mirror
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &Value) {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                report_dropped_write(key, &StoreError::serialization(key, e));
                return;
            }
        };

        self.mirror
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.clone());

        self.enqueue(
            key,
            WriteOp::Put {
                key: key.to_string(),
                json,
            },
        );
    }

    fn remove(&self, key: &str) {
        self.mirror
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        self.enqueue(
            key,
            WriteOp::Delete {
                key: key.to_string(),
            },
        );
    }

    fn keys(&self) -> Vec<String> {
        self.mirror
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

async fn run_writer(repo: KvRepository, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    debug!("Durable store writer started");

    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Put { key, json } => {
                if let Err(e) = repo.upsert(&key, &json).await {
                    let e = match e {
                        StoreError::QuotaExceeded { .. } => {
                            StoreError::QuotaExceeded { key: key.clone() }
                        }
                        other => other,
                    };
                    report_dropped_write(&key, &e);
                }
            }
            WriteOp::Delete { key } => {
                if let Err(e) = repo.delete(&key).await {
                    report_dropped_write(&key, &e);
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    debug!("Durable store writer stopped");
}

// =============================================================================
// Unit Tests
// =============================================================================
