use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] fieldsync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("{message} ({code})")]
    Api { code: &'static str, message: String },
    #[error("Invalid JSON for {field}: {reason}")]
    InvalidJson { field: &'static str, reason: String },
    #[error("Invalid {kind} ID: {value}")]
    InvalidId { kind: &'static str, value: String },
    #[error("No entity data provided. Pass --data or pipe JSON on stdin.")]
    MissingData,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Sync server is not configured. Pass --server-url or set FIELDSYNC_SERVER_URL."
    )]
    SyncNotConfigured,
}
