//! # Storage Error Types
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  sqlx::Error / serde_json::Error                                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  StoreError (this module) ← categorised: quota / serialization /       │
//! │       │                     storage                                    │
//! │       ▼                                                                 │
//! │  DurableStore::set  ← caught here, logged with its kind, dropped       │
//! │                                                                         │
//! │  Async setup paths (SqliteStore::open, flush) return it to the caller. │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Durable storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The write would exceed the configured capacity.
    ///
    /// ## When This Occurs
    /// - `MemoryStore::with_quota` limit reached
    /// - SQLite reports the disk or database is full
    ///
    /// This is the one failure that silently loses data, so it is logged
    /// under its own kind.
    #[error("Storage quota exceeded writing {key}")]
    QuotaExceeded { key: String },

    /// Value could not be turned into JSON, or stored JSON could not be read.
    #[error("Serialization failed for {key}: {reason}")]
    Serialization { key: String, reason: String },

    /// Database connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// The background writer has stopped; the store was closed or dropped.
    #[error("Durable store writer is closed")]
    WriterClosed,

    #[error("Internal storage error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn serialization(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        StoreError::Serialization {
            key: key.into(),
            reason: err.to_string(),
        }
    }

    /// Short category used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::QuotaExceeded { .. } => "quota",
            StoreError::Serialization { .. } => "serialization",
            _ => "storage",
        }
    }
}

/// Convert sqlx errors to StoreError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::Database "full"   → StoreError::QuotaExceeded
/// sqlx::Error::Database other    → StoreError::QueryFailed
/// sqlx::Error::PoolTimedOut      → StoreError::PoolExhausted
/// sqlx::Error::PoolClosed        → StoreError::ConnectionFailed
/// Other                          → StoreError::Internal
/// ```
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();
                if msg.contains("database or disk is full") {
                    StoreError::QuotaExceeded {
                        key: "unknown".to_string(),
                    }
                } else {
                    StoreError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => StoreError::PoolExhausted,

            sqlx::Error::PoolClosed => StoreError::ConnectionFailed("Pool is closed".to_string()),

            _ => StoreError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::MigrationFailed(err.to_string())
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
