//! # Error Types
//!
//! Domain-specific error types for pharma-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  pharma-core errors (this file)                                        │
//! │  ├── CoreError        - Snapshot decoding / schema errors              │
//! │  └── ValidationError  - Credential and identifier format failures      │
//! │                                                                         │
//! │  pharma-store errors (separate crate)                                  │
//! │  └── StoreError       - Durable storage failures (always swallowed     │
//! │                         and logged at the DurableStore boundary)       │
//! │                                                                         │
//! │  pharma-sync errors (separate crate)                                   │
//! │  └── SyncError        - Config, remote, protocol failures              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while interpreting collection snapshots.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Path does not name one of the synced collections.
    #[error("Unknown collection path: {0}")]
    UnknownCollection(String),

    /// A snapshot carried the tag of a different collection.
    ///
    /// ## When This Occurs
    /// - A remote writer stored an inward-entry envelope under `inventory`
    /// - A cached value was copied between keys by hand
    #[error("Snapshot for {expected} is tagged as {found}")]
    CollectionMismatch { expected: String, found: String },

    /// Snapshot was written by a newer schema than this build understands.
    #[error("Snapshot for {path} has schema version {found}, newest supported is {supported}")]
    UnsupportedSchemaVersion {
        path: String,
        found: u32,
        supported: u32,
    },

    /// JSON did not match the expected snapshot shape.
    #[error("Failed to decode {path} snapshot: {reason}")]
    SnapshotDecode { path: String, reason: String },

    /// JSON encoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too short.
    #[error("{field} must be at least {min} characters")]
    TooShort { field: String, min: usize },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (illegal characters, bad prefix).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// The value is a template placeholder left in a config file.
    #[error("{field} is still a placeholder value")]
    Placeholder { field: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::UnsupportedSchemaVersion {
            path: "inventory".to_string(),
            found: 3,
            supported: 1,
        };
        assert_eq!(
            err.to_string(),
            "Snapshot for inventory has schema version 3, newest supported is 1"
        );
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Placeholder {
            field: "api_key".to_string(),
        };
        assert_eq!(err.to_string(), "api_key is still a placeholder value");

        let err = ValidationError::TooShort {
            field: "project_id".to_string(),
            min: 4,
        };
        assert_eq!(err.to_string(), "project_id must be at least 4 characters");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "path".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
