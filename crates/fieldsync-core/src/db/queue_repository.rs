//! Durable queue repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{decode, decode_json, to_u32};
use crate::error::{Error, Result};
use crate::models::{ConflictId, EntityType, Payload, QueueItem, QueueItemId, QueueStatus};

const COLUMNS: &str = "id, entity_type, entity_id, action, payload, priority, priority_score, \
     priority_reason, status, retry_count, last_error, conflict_id, created_at, updated_at";

/// A persisted entry that could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptEntry {
    pub id: String,
    pub reason: String,
}

/// One stored queue row: either a usable item or the reason it is unreadable
pub type QueueEntry = std::result::Result<QueueItem, CorruptEntry>;

/// Persistence contract for queued mutations
pub trait DurableQueue {
    /// Persist a new item
    fn enqueue(&self, item: &QueueItem) -> Result<()>;

    /// Head of the queue: up to `limit` pending items in sync order, unchanged
    fn dequeue_batch(&self, limit: usize) -> Result<Vec<QueueItem>>;

    /// Set an item's status
    fn mark_status(&self, id: &QueueItemId, status: QueueStatus) -> Result<()>;

    /// Delete an item; returns whether it existed
    fn remove(&self, id: &QueueItemId) -> Result<bool>;

    /// Every stored entry, corrupt ones included
    fn list_all(&self) -> Result<Vec<QueueEntry>>;
}

/// `SQLite` implementation of `DurableQueue`
pub struct SqliteQueueRepository<'a> {
    conn: &'a Connection,
    now: i64,
}

impl<'a> SqliteQueueRepository<'a> {
    /// `now` stamps `updated_at` on every write made through this repository
    pub const fn new(conn: &'a Connection, now: i64) -> Self {
        Self { conn, now }
    }

    /// Fetch one item; a corrupt row is reported as an error
    pub fn get(&self, id: &QueueItemId) -> Result<Option<QueueItem>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM queue_items WHERE id = ?"),
                params![id.as_str()],
                RawQueueRow::read,
            )
            .optional()?;
        raw.map(RawQueueRow::decode).transpose()
    }

    /// Valid items targeting one entity, oldest first
    pub fn list_by_entity(&self, entity_id: &str) -> Result<Vec<QueueItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM queue_items WHERE entity_id = ? ORDER BY created_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![entity_id], RawQueueRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|raw| raw.decode().ok())
            .collect())
    }

    /// Write every mutable column of an existing item
    pub fn save(&self, item: &QueueItem) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE queue_items SET action = ?, payload = ?, priority = ?, priority_score = ?,
                priority_reason = ?, status = ?, retry_count = ?, last_error = ?, conflict_id = ?,
                updated_at = ?
             WHERE id = ?",
            params![
                item.action.as_str(),
                item.payload.to_json().to_string(),
                item.priority.as_str(),
                item.priority_score,
                item.priority_reason,
                item.status.as_str(),
                item.retry_count,
                item.last_error,
                item.conflict_id.map(|id| id.as_str()),
                self.now,
                item.id.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("queue item {}", item.id)));
        }
        Ok(())
    }

    /// Persist a recalculated score without touching anything else
    pub fn update_score(&self, id: &QueueItemId, score: u8, reason: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE queue_items SET priority_score = ?, priority_reason = ? WHERE id = ?",
            params![score, reason, id.as_str()],
        )?;
        Ok(())
    }

    /// Swap the payload of a conflicted item; returns false for any other status
    pub fn replace_payload(&self, id: &QueueItemId, payload: &Payload) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE queue_items SET payload = ?, updated_at = ?
             WHERE id = ? AND status = 'CONFLICTED'",
            params![payload.to_json().to_string(), self.now, id.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Move every row in `from` to `to`; returns how many moved
    pub fn reset_status(&self, from: QueueStatus, to: QueueStatus) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE queue_items SET status = ?, updated_at = ? WHERE status = ?",
            params![to.as_str(), self.now, from.as_str()],
        )?;
        Ok(changed)
    }

    /// Count of stored rows per status
    pub fn count_by_status(&self, status: QueueStatus) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM queue_items WHERE status = ?",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn read_all(&self, sql: &str) -> Result<Vec<RawQueueRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map([], RawQueueRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl DurableQueue for SqliteQueueRepository<'_> {
    fn enqueue(&self, item: &QueueItem) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO queue_items ({COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                item.id.as_str(),
                item.entity_type().as_str(),
                item.entity_id,
                item.action.as_str(),
                item.payload.to_json().to_string(),
                item.priority.as_str(),
                item.priority_score,
                item.priority_reason,
                item.status.as_str(),
                item.retry_count,
                item.last_error,
                item.conflict_id.map(|id| id.as_str()),
                item.created_at,
                item.updated_at,
            ],
        )?;
        Ok(())
    }

    fn dequeue_batch(&self, limit: usize) -> Result<Vec<QueueItem>> {
        let rows = self.read_all(&format!(
            "SELECT {COLUMNS} FROM queue_items WHERE status = 'PENDING'
             ORDER BY priority_score DESC, created_at ASC"
        ))?;

        let mut batch = Vec::new();
        for raw in rows {
            if batch.len() >= limit {
                break;
            }
            match raw.decode() {
                Ok(item) => batch.push(item),
                Err(error) => tracing::warn!("Skipping unreadable queue entry: {error}"),
            }
        }
        Ok(batch)
    }

    fn mark_status(&self, id: &QueueItemId, status: QueueStatus) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE queue_items SET status = ?, updated_at = ? WHERE id = ?",
            params![status.as_str(), self.now, id.as_str()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("queue item {id}")));
        }
        Ok(())
    }

    fn remove(&self, id: &QueueItemId) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM queue_items WHERE id = ?", params![id.as_str()])?;
        Ok(changed > 0)
    }

    fn list_all(&self) -> Result<Vec<QueueEntry>> {
        let rows = self.read_all(&format!(
            "SELECT {COLUMNS} FROM queue_items ORDER BY created_at ASC"
        ))?;
        Ok(rows
            .into_iter()
            .map(|raw| {
                let id = raw.id.clone();
                raw.decode().map_err(|error| CorruptEntry {
                    id,
                    reason: match error {
                        Error::CorruptRecord { reason, .. } => reason,
                        other => other.to_string(),
                    },
                })
            })
            .collect())
    }
}

/// Row as stored, before any decoding that could fail
struct RawQueueRow {
    id: String,
    entity_type: String,
    entity_id: String,
    action: String,
    payload: String,
    priority: String,
    priority_score: i64,
    priority_reason: String,
    status: String,
    retry_count: i64,
    last_error: Option<String>,
    conflict_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawQueueRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            action: row.get(3)?,
            payload: row.get(4)?,
            priority: row.get(5)?,
            priority_score: row.get(6)?,
            priority_reason: row.get(7)?,
            status: row.get(8)?,
            retry_count: row.get(9)?,
            last_error: row.get(10)?,
            conflict_id: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn decode(self) -> Result<QueueItem> {
        let id = self.id.as_str();
        let entity_type: EntityType = decode(id, "entity_type", &self.entity_type)?;
        let data = decode_json(id, "payload", &self.payload)?;
        let payload = Payload::from_json(entity_type, data).map_err(|error| Error::CorruptRecord {
            id: id.to_string(),
            reason: format!("payload: {error}"),
        })?;
        let priority_score = u8::try_from(self.priority_score)
            .ok()
            .filter(|score| *score <= 100)
            .ok_or_else(|| Error::CorruptRecord {
                id: id.to_string(),
                reason: format!("priority_score: {} out of range", self.priority_score),
            })?;
        let conflict_id = self
            .conflict_id
            .as_deref()
            .map(|value| decode::<ConflictId, _>(id, "conflict_id", value))
            .transpose()?;

        Ok(QueueItem {
            id: decode(id, "id", id)?,
            entity_id: self.entity_id,
            action: decode(id, "action", &self.action)?,
            payload,
            priority: decode(id, "priority", &self.priority)?,
            priority_score,
            priority_reason: self.priority_reason,
            status: decode(id, "status", &self.status)?,
            retry_count: to_u32(id, "retry_count", self.retry_count)?,
            last_error: self.last_error,
            conflict_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
