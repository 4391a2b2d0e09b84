//! Priority rule repository

use rusqlite::{params, Connection, Row};

use super::{decode, decode_json};
use crate::error::{Error, Result};
use crate::models::{PriorityRule, RuleId};

const COLUMNS: &str =
    "id, name, entity_type, conditions, priority_modifier, is_active, created_by, created_at";

/// `SQLite` storage for operator-defined priority rules
pub struct SqliteRuleRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteRuleRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, rule: &PriorityRule) -> Result<()> {
        self.conn.execute(
            &format!("INSERT INTO priority_rules ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"),
            params![
                rule.id.as_str(),
                rule.name,
                rule.entity_type.as_str(),
                serde_json::to_string(&rule.conditions)?,
                rule.priority_modifier,
                rule.is_active,
                rule.created_by,
                rule.created_at,
            ],
        )?;
        Ok(())
    }

    /// All rules, oldest first
    pub fn list(&self) -> Result<Vec<PriorityRule>> {
        self.query(&format!(
            "SELECT {COLUMNS} FROM priority_rules ORDER BY created_at ASC"
        ))
    }

    /// Rules that take part in scoring
    pub fn list_active(&self) -> Result<Vec<PriorityRule>> {
        self.query(&format!(
            "SELECT {COLUMNS} FROM priority_rules WHERE is_active = 1 ORDER BY created_at ASC"
        ))
    }

    pub fn set_active(&self, id: &RuleId, is_active: bool) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE priority_rules SET is_active = ? WHERE id = ?",
            params![is_active, id.as_str()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("priority rule {id}")));
        }
        Ok(())
    }

    fn query(&self, sql: &str) -> Result<Vec<PriorityRule>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map([], RawRule::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawRule::decode).collect()
    }
}

struct RawRule {
    id: String,
    name: String,
    entity_type: String,
    conditions: String,
    priority_modifier: i32,
    is_active: bool,
    created_by: String,
    created_at: i64,
}

impl RawRule {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            entity_type: row.get(2)?,
            conditions: row.get(3)?,
            priority_modifier: row.get(4)?,
            is_active: row.get(5)?,
            created_by: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<PriorityRule> {
        let id = self.id.as_str();
        Ok(PriorityRule {
            id: decode(id, "id", id)?,
            name: self.name,
            entity_type: decode(id, "entity_type", &self.entity_type)?,
            conditions: decode_json(id, "conditions", &self.conditions)?,
            priority_modifier: self.priority_modifier,
            is_active: self.is_active,
            created_by: self.created_by,
            created_at: self.created_at,
        })
    }
}
