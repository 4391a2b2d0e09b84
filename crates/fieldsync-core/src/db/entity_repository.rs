//! Locally visible entity state

use rusqlite::{params, Connection, OptionalExtension};

use super::{decode, decode_json};
use crate::error::Result;
use crate::models::{EntitySyncState, EntityType, LocalEntity};

/// `SQLite` storage for the optimistic local copy of each entity
pub struct SqliteEntityRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteEntityRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<LocalEntity>> {
        let row = self
            .conn
            .query_row(
                "SELECT data, sync_state, is_deleted, updated_at FROM local_entities
                 WHERE entity_type = ? AND entity_id = ?",
                params![entity_type.as_str(), entity_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(data, sync_state, is_deleted, updated_at)| {
            Ok(LocalEntity {
                entity_type,
                entity_id: entity_id.to_string(),
                data: decode_json(entity_id, "data", &data)?,
                sync_state: decode(entity_id, "sync_state", &sync_state)?,
                is_deleted,
                updated_at,
            })
        })
        .transpose()
    }

    /// Insert or replace an entity
    pub fn upsert(&self, entity: &LocalEntity) -> Result<()> {
        self.conn.execute(
            "INSERT INTO local_entities (entity_type, entity_id, data, sync_state, is_deleted, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                data = excluded.data,
                sync_state = excluded.sync_state,
                is_deleted = excluded.is_deleted,
                updated_at = excluded.updated_at",
            params![
                entity.entity_type.as_str(),
                entity.entity_id,
                entity.data.to_string(),
                entity.sync_state.as_str(),
                entity.is_deleted,
                entity.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn set_sync_state(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        sync_state: EntitySyncState,
        updated_at: i64,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE local_entities SET sync_state = ?, updated_at = ?
             WHERE entity_type = ? AND entity_id = ?",
            params![sync_state.as_str(), updated_at, entity_type.as_str(), entity_id],
        )?;
        Ok(changed > 0)
    }

    /// Remove an entity entirely; returns whether it existed
    pub fn delete(&self, entity_type: EntityType, entity_id: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM local_entities WHERE entity_type = ? AND entity_id = ?",
            params![entity_type.as_str(), entity_id],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn upsert_replaces_and_delete_removes() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteEntityRepository::new(db.connection());
        let mut entity = LocalEntity {
            entity_type: EntityType::Incident,
            entity_id: "inc-1".to_string(),
            data: json!({ "name": "Flood" }),
            sync_state: EntitySyncState::Pending,
            is_deleted: false,
            updated_at: 5,
        };
        repo.upsert(&entity).unwrap();

        entity.data = json!({ "name": "Flash flood" });
        entity.sync_state = EntitySyncState::Synced;
        repo.upsert(&entity).unwrap();
        assert_eq!(repo.get(EntityType::Incident, "inc-1").unwrap(), Some(entity));
        assert_eq!(repo.get(EntityType::Entity, "inc-1").unwrap(), None);

        assert!(repo.delete(EntityType::Incident, "inc-1").unwrap());
        assert_eq!(repo.get(EntityType::Incident, "inc-1").unwrap(), None);
    }
}
