//! Error types for fieldsync-core

use thiserror::Error;

/// Result type alias using fieldsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fieldsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed request; nothing was changed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller lacks the role required for the operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Operation is not allowed in the record's current state
    #[error("Invalid state: {0}")]
    State(String),

    /// Sync cannot start under current connectivity/power/pause conditions
    #[error("Sync unavailable: {0}")]
    SyncUnavailable(String),

    /// Persisted record could not be decoded
    #[error("Corrupted record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Stable machine-readable code used by the API surface.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Database(_) | Self::Sqlite(_) | Self::Io(_) => "STORAGE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::State(_) => "STATE_ERROR",
            Self::SyncUnavailable(_) => "SYNC_UNAVAILABLE",
            Self::CorruptRecord { .. } => "CORRUPT_RECORD",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_distinguish_request_failures() {
        assert_eq!(Error::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(Error::state("x").code(), "STATE_ERROR");
        assert_eq!(
            Error::PermissionDenied("x".into()).code(),
            "PERMISSION_DENIED"
        );
        assert_eq!(Error::NotFound("x".into()).code(), "NOT_FOUND");
    }
}
