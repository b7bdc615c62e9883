//! # Node Error Type
//!
//! Unified error type for startup and console commands.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Flow in the Sync Node                          │
//! │                                                                         │
//! │  startup ──► SyncError (config, url)   ──┐                              │
//! │          ──► StoreError (sqlite open)  ──┼──► AppError ──► exit code 1  │
//! │          ──► io::Error (data dir)      ──┘                              │
//! │                                                                         │
//! │  console ──► AppError::UnknownCommand / InvalidArgument                 │
//! │              printed as {"code": ..., "message": ...}, loop continues   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::Serialize;
use thiserror::Error;

use pharma_store::StoreError;
use pharma_sync::SyncError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No database path available; set PHARMA_DB_PATH")]
    NoDatabasePath,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Sync error: {0}")]
    Sync(SyncError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Machine-readable code printed by the console.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::UnknownCommand(_) => "UNKNOWN_COMMAND",
            AppError::InvalidArgument(_) => "VALIDATION_ERROR",
            AppError::NoDatabasePath | AppError::Config(_) => "CONFIG_ERROR",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::Sync(_) => "SYNC_ERROR",
            AppError::Io(_) => "INTERNAL",
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

/// Splits configuration problems out of the generic sync bucket so the
/// operator sees them as such.
impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        if err.is_config_error() {
            AppError::Config(err.to_string())
        } else {
            AppError::Sync(err)
        }
    }
}

/// JSON shape of a failed console command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_mapped_separately() {
        let err: AppError = SyncError::InvalidUrl("http://x".into()).into();
        assert_eq!(err.code(), "CONFIG_ERROR");

        let err: AppError = SyncError::Timeout(5).into();
        assert_eq!(err.code(), "SYNC_ERROR");
    }

    #[test]
    fn test_error_response_serializes() {
        let response = AppError::UnknownCommand("fly".into()).to_response();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["code"], "UNKNOWN_COMMAND");
        assert_eq!(json["message"], "Unknown command: fly");
    }
}
