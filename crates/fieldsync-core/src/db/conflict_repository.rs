//! Conflict repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{decode, decode_json};
use crate::error::{Error, Result};
use crate::models::{
    Conflict, ConflictId, ConflictSeverity, ConflictStatus, ConflictType, EntityType,
};

const COLUMNS: &str = "id, entity_id, entity_type, conflict_type, severity, status, \
     local_version, server_version, conflicting_fields, local_modified_at, server_modified_at, \
     detected_at, audit_trail, resolution";

/// Optional narrowing applied to conflict listings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictFilter {
    pub status: Option<ConflictStatus>,
    pub severity: Option<ConflictSeverity>,
    pub conflict_type: Option<ConflictType>,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
}

impl ConflictFilter {
    fn where_clause(&self) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(status) = self.status {
            clauses.push("status = ?");
            values.push(status.as_str().to_string());
        }
        if let Some(severity) = self.severity {
            clauses.push("severity = ?");
            values.push(severity.as_str().to_string());
        }
        if let Some(conflict_type) = self.conflict_type {
            clauses.push("conflict_type = ?");
            values.push(conflict_type.as_str().to_string());
        }
        if let Some(entity_type) = self.entity_type {
            clauses.push("entity_type = ?");
            values.push(entity_type.as_str().to_string());
        }
        if let Some(entity_id) = &self.entity_id {
            clauses.push("entity_id = ?");
            values.push(entity_id.clone());
        }

        if clauses.is_empty() {
            (String::new(), values)
        } else {
            (format!("WHERE {}", clauses.join(" AND ")), values)
        }
    }
}

const fn severity_rank(severity: ConflictSeverity) -> i64 {
    match severity {
        ConflictSeverity::Low => 0,
        ConflictSeverity::High => 1,
        ConflictSeverity::Critical => 2,
    }
}

/// `SQLite` storage for conflicts and their audit trails
pub struct SqliteConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteConflictRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, conflict: &Conflict) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO conflicts ({COLUMNS}, severity_rank)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                conflict.id.as_str(),
                conflict.entity_id,
                conflict.entity_type.as_str(),
                conflict.conflict_type.as_str(),
                conflict.severity.as_str(),
                conflict.status.as_str(),
                conflict.local_version.to_string(),
                conflict.server_version.to_string(),
                serde_json::to_string(&conflict.conflicting_fields)?,
                conflict.local_modified_at,
                conflict.server_modified_at,
                conflict.detected_at,
                serde_json::to_string(&conflict.audit_trail)?,
                conflict
                    .resolution
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                severity_rank(conflict.severity),
            ],
        )?;
        Ok(())
    }

    /// Persist a resolution, but only while the stored row is still pending.
    ///
    /// Returns false when another writer resolved it first.
    pub fn resolve_if_pending(&self, conflict: &Conflict) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE conflicts SET status = ?, audit_trail = ?, resolution = ?
             WHERE id = ? AND status = 'PENDING'",
            params![
                conflict.status.as_str(),
                serde_json::to_string(&conflict.audit_trail)?,
                conflict
                    .resolution
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                conflict.id.as_str(),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get(&self, id: &ConflictId) -> Result<Option<Conflict>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM conflicts WHERE id = ?"),
                params![id.as_str()],
                RawConflict::read,
            )
            .optional()?;
        raw.map(RawConflict::decode).transpose()
    }

    /// Filtered page in review order (severity desc, detection asc)
    pub fn list(&self, filter: &ConflictFilter, limit: usize, offset: usize) -> Result<Vec<Conflict>> {
        let (where_clause, values) = filter.where_clause();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {COLUMNS} FROM conflicts {where_clause}
             ORDER BY severity_rank DESC, detected_at ASC, id ASC
             LIMIT {limit} OFFSET {}",
            offset as i64
        );
        self.query(&sql, values)
    }

    pub fn count(&self, filter: &ConflictFilter) -> Result<usize> {
        let (where_clause, values) = filter.where_clause();
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM conflicts {where_clause}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Conflicts recorded for one entity, oldest first
    pub fn list_by_entity(&self, entity_id: &str, include_resolved: bool) -> Result<Vec<Conflict>> {
        let status_clause = if include_resolved {
            ""
        } else {
            "AND status = 'PENDING'"
        };
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM conflicts WHERE entity_id = ? {status_clause}
                 ORDER BY detected_at ASC, id ASC"
            ),
            vec![entity_id.to_string()],
        )
    }

    /// (status, severity, count) triples
    pub fn counts(&self) -> Result<Vec<(ConflictStatus, ConflictSeverity, usize)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, severity, COUNT(*) FROM conflicts GROUP BY status, severity")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(status, severity, count)| {
                Ok((
                    decode("counts", "status", &status)?,
                    decode("counts", "severity", &severity)?,
                    usize::try_from(count).unwrap_or_default(),
                ))
            })
            .collect()
    }

    fn query(&self, sql: &str, values: Vec<String>) -> Result<Vec<Conflict>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), RawConflict::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawConflict::decode).collect()
    }
}

struct RawConflict {
    id: String,
    entity_id: String,
    entity_type: String,
    conflict_type: String,
    severity: String,
    status: String,
    local_version: String,
    server_version: String,
    conflicting_fields: String,
    local_modified_at: Option<i64>,
    server_modified_at: Option<i64>,
    detected_at: i64,
    audit_trail: String,
    resolution: Option<String>,
}

impl RawConflict {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_id: row.get(1)?,
            entity_type: row.get(2)?,
            conflict_type: row.get(3)?,
            severity: row.get(4)?,
            status: row.get(5)?,
            local_version: row.get(6)?,
            server_version: row.get(7)?,
            conflicting_fields: row.get(8)?,
            local_modified_at: row.get(9)?,
            server_modified_at: row.get(10)?,
            detected_at: row.get(11)?,
            audit_trail: row.get(12)?,
            resolution: row.get(13)?,
        })
    }

    fn decode(self) -> Result<Conflict> {
        let id = self.id.as_str();
        let resolution = self
            .resolution
            .as_deref()
            .map(|resolution| decode_json(id, "resolution", resolution))
            .transpose()?;

        let conflict = Conflict {
            id: decode(id, "id", id)?,
            entity_id: self.entity_id,
            entity_type: decode(id, "entity_type", &self.entity_type)?,
            conflict_type: decode(id, "conflict_type", &self.conflict_type)?,
            severity: decode(id, "severity", &self.severity)?,
            local_version: decode_json(id, "local_version", &self.local_version)?,
            server_version: decode_json(id, "server_version", &self.server_version)?,
            conflicting_fields: decode_json(id, "conflicting_fields", &self.conflicting_fields)?,
            status: decode(id, "status", &self.status)?,
            local_modified_at: self.local_modified_at,
            server_modified_at: self.server_modified_at,
            detected_at: self.detected_at,
            audit_trail: decode_json(id, "audit_trail", &self.audit_trail)?,
            resolution,
        };

        if conflict.status == ConflictStatus::Resolved && conflict.resolution.is_none() {
            return Err(Error::CorruptRecord {
                id: conflict.id.as_str(),
                reason: "resolved conflict without resolution".to_string(),
            });
        }
        Ok(conflict)
    }
}
