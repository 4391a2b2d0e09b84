//! Sync session history

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::{params, Connection, Row};

use super::{decode, decode_json, to_u32};
use crate::error::Result;
use crate::models::SyncSession;

const COLUMNS: &str = "id, trigger_reason, started_at, ended_at, status, items_processed, \
     items_succeeded, items_failed, conflicts_detected, bytes_synced, errors";

/// `SQLite` storage for finished sync sessions
pub struct SqliteSessionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSessionRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert or overwrite a session record
    pub fn save(&self, session: &SyncSession) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO sync_sessions ({COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                session.id.as_str(),
                session.trigger,
                session.started_at,
                session.ended_at,
                session.status.as_str(),
                session.items_processed,
                session.items_succeeded,
                session.items_failed,
                session.conflicts_detected,
                i64::try_from(session.bytes_synced).unwrap_or(i64::MAX),
                serde_json::to_string(&session.errors)?,
            ],
        )?;
        Ok(())
    }

    /// Most recent sessions first
    pub fn recent(&self, limit: usize) -> Result<Vec<SyncSession>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM sync_sessions ORDER BY started_at DESC, id DESC LIMIT ?"
        ))?;
        let rows = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], RawSession::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawSession::decode).collect()
    }
}

struct RawSession {
    id: String,
    trigger: String,
    started_at: i64,
    ended_at: Option<i64>,
    status: String,
    items_processed: i64,
    items_succeeded: i64,
    items_failed: i64,
    conflicts_detected: i64,
    bytes_synced: i64,
    errors: String,
}

impl RawSession {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            trigger: row.get(1)?,
            started_at: row.get(2)?,
            ended_at: row.get(3)?,
            status: row.get(4)?,
            items_processed: row.get(5)?,
            items_succeeded: row.get(6)?,
            items_failed: row.get(7)?,
            conflicts_detected: row.get(8)?,
            bytes_synced: row.get(9)?,
            errors: row.get(10)?,
        })
    }

    fn decode(self) -> Result<SyncSession> {
        let id = self.id.as_str();
        Ok(SyncSession {
            id: decode(id, "id", id)?,
            trigger: self.trigger,
            started_at: self.started_at,
            ended_at: self.ended_at,
            status: decode(id, "status", &self.status)?,
            items_processed: to_u32(id, "items_processed", self.items_processed)?,
            items_succeeded: to_u32(id, "items_succeeded", self.items_succeeded)?,
            items_failed: to_u32(id, "items_failed", self.items_failed)?,
            conflicts_detected: to_u32(id, "conflicts_detected", self.conflicts_detected)?,
            bytes_synced: u64::try_from(self.bytes_synced).unwrap_or_default(),
            errors: decode_json(id, "errors", &self.errors)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{SessionErrorKind, SessionStatus};
    use pretty_assertions::assert_eq;

    #[test]
    fn sessions_are_listed_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteSessionRepository::new(db.connection());

        let mut first = SyncSession::start("manual", 100);
        first.record_error(Some("item".into()), SessionErrorKind::Transient, "timeout", 150);
        first.close(SessionStatus::Completed, 200);
        let mut second = SyncSession::start("scheduled", 300);
        second.close(SessionStatus::Paused, 310);
        repo.save(&first).unwrap();
        repo.save(&second).unwrap();

        let recent = repo.recent(10).unwrap();
        assert_eq!(recent, vec![second, first]);
        assert_eq!(repo.recent(1).unwrap().len(), 1);
    }
}
