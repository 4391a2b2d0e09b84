//! Server exchange seam: how a queued mutation reaches the server.

mod http;

pub use http::HttpServerExchange;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::QueueItem;

/// Server acknowledgement of an applied mutation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeAck {
    /// Server-side modification time of the entity after the write (Unix ms)
    #[serde(default)]
    pub server_modified_at: Option<i64>,
}

/// Why a submission did not apply
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    /// The server holds a version the local mutation did not start from
    #[error("server rejected the mutation with a version conflict")]
    VersionConflict {
        server_version: Value,
        server_modified_at: Option<i64>,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("exchange timed out")]
    Timeout,
}

impl ExchangeError {
    /// Transport failures and timeouts are worth retrying; conflicts are not
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout)
    }
}

/// Submits one mutation to the server
#[async_trait]
pub trait ServerExchange: Send + Sync {
    async fn submit(&self, item: &QueueItem) -> Result<ExchangeAck, ExchangeError>;
}
