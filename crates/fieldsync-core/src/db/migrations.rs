//! Database migrations

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Migration to version 1: queue, rules and optimistic state
fn migrate_v1(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS queue_items (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            action TEXT NOT NULL,
            payload TEXT NOT NULL,
            priority TEXT NOT NULL,
            priority_score INTEGER NOT NULL DEFAULT 0,
            priority_reason TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            conflict_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_queue_items_order
            ON queue_items(priority_score DESC, created_at ASC);
        CREATE INDEX IF NOT EXISTS idx_queue_items_entity ON queue_items(entity_id);
        CREATE INDEX IF NOT EXISTS idx_queue_items_status ON queue_items(status);

        CREATE TABLE IF NOT EXISTS priority_rules (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            conditions TEXT NOT NULL,
            priority_modifier INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_by TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS local_entities (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            sync_state TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (entity_type, entity_id)
        );

        CREATE TABLE IF NOT EXISTS optimistic_updates (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            previous_state TEXT,
            queue_item_id TEXT NOT NULL,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_updates_entity ON optimistic_updates(entity_id);
        CREATE INDEX IF NOT EXISTS idx_updates_queue_item ON optimistic_updates(queue_item_id);
        CREATE INDEX IF NOT EXISTS idx_updates_status ON optimistic_updates(status);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);
        ",
    )?;
    tx.commit()?;

    tracing::info!("Database migrated to version 1");
    Ok(())
}

/// Migration to version 2: conflicts and session history
fn migrate_v2(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conflicts (
            id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            conflict_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            severity_rank INTEGER NOT NULL,
            status TEXT NOT NULL,
            local_version TEXT NOT NULL,
            server_version TEXT NOT NULL,
            conflicting_fields TEXT NOT NULL,
            local_modified_at INTEGER,
            server_modified_at INTEGER,
            detected_at INTEGER NOT NULL,
            audit_trail TEXT NOT NULL,
            resolution TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_conflicts_entity ON conflicts(entity_id);
        CREATE INDEX IF NOT EXISTS idx_conflicts_pending
            ON conflicts(status, severity_rank DESC, detected_at ASC);

        CREATE TABLE IF NOT EXISTS sync_sessions (
            id TEXT PRIMARY KEY,
            trigger_reason TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            status TEXT NOT NULL,
            items_processed INTEGER NOT NULL DEFAULT 0,
            items_succeeded INTEGER NOT NULL DEFAULT 0,
            items_failed INTEGER NOT NULL DEFAULT 0,
            conflicts_detected INTEGER NOT NULL DEFAULT 0,
            bytes_synced INTEGER NOT NULL DEFAULT 0,
            errors TEXT NOT NULL DEFAULT '[]'
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_started ON sync_sessions(started_at DESC);

        INSERT OR IGNORE INTO schema_version (version) VALUES (2);
        ",
    )?;
    tx.commit()?;

    tracing::info!("Database migrated to version 2");
    Ok(())
}

/// Migration to version 3: entity flags captured before each optimistic update
fn migrate_v3(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        "
        ALTER TABLE optimistic_updates
            ADD COLUMN previous_deleted INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE optimistic_updates ADD COLUMN previous_sync_state TEXT;
        ",
    )?;
    tx.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [CURRENT_VERSION],
    )?;
    tx.commit()?;

    tracing::info!("Database migrated to version {CURRENT_VERSION}");
    Ok(())
}
