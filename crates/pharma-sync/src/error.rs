//! # Sync Error Types
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SyncError                                       │
//! │                                                                         │
//! │  Configuration      InvalidConfig, InvalidUrl, ConfigLoad/SaveFailed,   │
//! │                     MissingCredentials                                  │
//! │                     → status no-api-key, never retried                  │
//! │                                                                         │
//! │  Remote             AuthFailed, ConnectionFailed, Disconnected,         │
//! │                     Timeout, Rejected, WebSocketError                   │
//! │                     → treated as "remote unreachable", retried          │
//! │                                                                         │
//! │  Protocol           InvalidMessage, SerializationFailed,                │
//! │                     DeserializationFailed, UnexpectedMessageType        │
//! │                                                                         │
//! │  Storage            Storage (from pharma-store)                         │
//! │                                                                         │
//! │  Internal           Internal, ShuttingDown, ChannelError                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! None of these cross the facade boundary during normal operation: the
//! engine turns them into a `SyncStatus` and a log line.

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// API key or project id absent or malformed.
    #[error("Remote backend not configured: {0}")]
    MissingCredentials(String),

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// The backend refused the credentials.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Disconnected from remote backend")]
    Disconnected,

    /// Request timed out.
    #[error("Remote request timed out after {0} ms")]
    Timeout(u64),

    /// The backend answered with an error for this request.
    #[error("Remote rejected {operation}: {reason}")]
    Rejected { operation: String, reason: String },

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessageType { expected: String, actual: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    /// Engine was cleaned up; no further work is accepted.
    #[error("Sync engine is shut down")]
    ShuttingDown,

    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<pharma_store::StoreError> for SyncError {
    fn from(err: pharma_store::StoreError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<pharma_core::CoreError> for SyncError {
    fn from(err: pharma_core::CoreError) -> Self {
        SyncError::DeserializationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// True for failures that mean "remote unreachable right now".
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::Timeout(_)
                | SyncError::WebSocketError(_)
                | SyncError::Rejected { .. }
                | SyncError::AuthFailed(_)
        )
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingCredentials(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMessage(_)
                | SyncError::SerializationFailed(_)
                | SyncError::DeserializationFailed(_)
                | SyncError::UnexpectedMessageType { .. }
        )
    }

    pub(crate) fn rejected(operation: &str, reason: impl Into<String>) -> Self {
        SyncError::Rejected {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }
}
