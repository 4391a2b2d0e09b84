//! Database layer for fieldsync

mod conflict_repository;
mod connection;
mod entity_repository;
mod migrations;
mod queue_repository;
mod rule_repository;
mod session_repository;
mod update_repository;

pub use conflict_repository::{ConflictFilter, SqliteConflictRepository};
pub use connection::Database;
pub use entity_repository::SqliteEntityRepository;
pub use queue_repository::{CorruptEntry, DurableQueue, QueueEntry, SqliteQueueRepository};
pub use rule_repository::SqliteRuleRepository;
pub use session_repository::SqliteSessionRepository;
pub use update_repository::SqliteUpdateRepository;

use std::str::FromStr;

use crate::error::Error;

/// Decode a stored text column into a typed value.
fn decode<T: FromStr<Err = E>, E: std::fmt::Display>(
    id: &str,
    column: &str,
    value: &str,
) -> Result<T, Error> {
    value.parse().map_err(|error: E| Error::CorruptRecord {
        id: id.to_string(),
        reason: format!("{column}: {error}"),
    })
}

/// Decode a stored JSON column.
fn decode_json<T: serde::de::DeserializeOwned>(
    id: &str,
    column: &str,
    value: &str,
) -> Result<T, Error> {
    serde_json::from_str(value).map_err(|error| Error::CorruptRecord {
        id: id.to_string(),
        reason: format!("{column}: {error}"),
    })
}

/// `SQLite` stores counters as i64.
fn to_u32(id: &str, column: &str, value: i64) -> Result<u32, Error> {
    u32::try_from(value).map_err(|_| Error::CorruptRecord {
        id: id.to_string(),
        reason: format!("{column}: {value} out of range"),
    })
}
