//! Optimistic update repository

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{decode, decode_json, to_u32};
use crate::error::{Error, Result};
use crate::models::{
    EntitySyncState, EntityType, OptimisticUpdate, Payload, QueueItemId, UpdateId, UpdateStats, UpdateStatus,
};

const COLUMNS: &str = "id, entity_type, entity_id, operation, payload, previous_state, \
     previous_deleted, previous_sync_state, queue_item_id, status, retry_count, last_error, \
     created_at, updated_at";

/// `SQLite` storage for optimistic updates
pub struct SqliteUpdateRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteUpdateRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, update: &OptimisticUpdate) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO optimistic_updates ({COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                update.id.as_str(),
                update.entity_type.as_str(),
                update.entity_id,
                update.operation.as_str(),
                update.payload.to_json().to_string(),
                update.previous_state.as_ref().map(ToString::to_string),
                update.previous_deleted,
                update.previous_sync_state.map(EntitySyncState::as_str),
                update.queue_item_id.as_str(),
                update.status.as_str(),
                update.retry_count,
                update.last_error,
                update.created_at,
                update.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Write the mutable lifecycle columns
    pub fn save(&self, update: &OptimisticUpdate) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE optimistic_updates
             SET status = ?, retry_count = ?, last_error = ?, updated_at = ?
             WHERE id = ?",
            params![
                update.status.as_str(),
                update.retry_count,
                update.last_error,
                update.updated_at,
                update.id.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("update {}", update.id)));
        }
        Ok(())
    }

    pub fn get(&self, id: &UpdateId) -> Result<Option<OptimisticUpdate>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM optimistic_updates WHERE id = ?"),
                params![id.as_str()],
                RawUpdate::read,
            )
            .optional()?;
        raw.map(RawUpdate::decode).transpose()
    }

    /// The most recent update carried by a queue item
    pub fn find_by_queue_item(&self, queue_item_id: &QueueItemId) -> Result<Option<OptimisticUpdate>> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM optimistic_updates WHERE queue_item_id = ?
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![queue_item_id.as_str()],
                RawUpdate::read,
            )
            .optional()?;
        raw.map(RawUpdate::decode).transpose()
    }

    /// Updates for one entity, oldest first
    pub fn list_by_entity(&self, entity_id: &str) -> Result<Vec<OptimisticUpdate>> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM optimistic_updates WHERE entity_id = ?
                 ORDER BY created_at ASC, id ASC"
            ),
            params![entity_id],
        )
    }

    pub fn list_by_status(&self, status: UpdateStatus) -> Result<Vec<OptimisticUpdate>> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM optimistic_updates WHERE status = ?
                 ORDER BY created_at ASC, id ASC"
            ),
            params![status.as_str()],
        )
    }

    pub fn stats(&self) -> Result<UpdateStats> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM optimistic_updates GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stats = UpdateStats::default();
        for (status, count) in counts {
            let count = usize::try_from(count).unwrap_or_default();
            stats.total += count;
            match decode::<UpdateStatus, _>("stats", "status", &status)? {
                UpdateStatus::Pending => stats.pending += count,
                UpdateStatus::Confirmed => stats.confirmed += count,
                UpdateStatus::Failed => stats.failed += count,
                UpdateStatus::RolledBack => stats.rolled_back += count,
            }
        }
        Ok(stats)
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<OptimisticUpdate>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, RawUpdate::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawUpdate::decode).collect()
    }
}

struct RawUpdate {
    id: String,
    entity_type: String,
    entity_id: String,
    operation: String,
    payload: String,
    previous_state: Option<String>,
    previous_deleted: bool,
    previous_sync_state: Option<String>,
    queue_item_id: String,
    status: String,
    retry_count: i64,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawUpdate {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            operation: row.get(3)?,
            payload: row.get(4)?,
            previous_state: row.get(5)?,
            previous_deleted: row.get(6)?,
            previous_sync_state: row.get(7)?,
            queue_item_id: row.get(8)?,
            status: row.get(9)?,
            retry_count: row.get(10)?,
            last_error: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn decode(self) -> Result<OptimisticUpdate> {
        let id = self.id.as_str();
        let entity_type: EntityType = decode(id, "entity_type", &self.entity_type)?;
        let payload = Payload::from_json(entity_type, decode_json(id, "payload", &self.payload)?)
            .map_err(|error| Error::CorruptRecord {
                id: id.to_string(),
                reason: format!("payload: {error}"),
            })?;
        let previous_state = self
            .previous_state
            .as_deref()
            .map(|state| decode_json(id, "previous_state", state))
            .transpose()?;
        let previous_sync_state: Option<EntitySyncState> = self
            .previous_sync_state
            .as_deref()
            .map(|state| decode(id, "previous_sync_state", state))
            .transpose()?;

        Ok(OptimisticUpdate {
            id: decode(id, "id", id)?,
            entity_type,
            entity_id: self.entity_id,
            operation: decode(id, "operation", &self.operation)?,
            payload,
            previous_state,
            previous_deleted: self.previous_deleted,
            previous_sync_state,
            queue_item_id: decode(id, "queue_item_id", &self.queue_item_id)?,
            status: decode(id, "status", &self.status)?,
            retry_count: to_u32(id, "retry_count", self.retry_count)?,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
