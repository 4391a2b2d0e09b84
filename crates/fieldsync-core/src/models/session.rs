//! Sync session model

use serde::{Deserialize, Serialize};

use super::id::{text_enum, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Running,
    /// Every eligible item was attempted
    Completed,
    /// Stopped at an item boundary because sync was paused
    Paused,
    /// Aborted by a session-level failure such as lost connectivity
    Failed,
    /// Stopped because the session deadline passed
    TimedOut,
}

text_enum!(SessionStatus {
    Running => "RUNNING",
    Completed => "COMPLETED",
    Paused => "PAUSED",
    Failed => "FAILED",
    TimedOut => "TIMED_OUT",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionErrorKind {
    /// Network error or timeout; the item stays queued
    Transient,
    /// Server version mismatch; routed to conflict resolution
    Conflict,
    /// Item could not be read or rebuilt; skipped
    Fatal,
    /// Session-level connectivity loss
    Connectivity,
}

/// One error recorded during a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    pub item_id: Option<String>,
    pub kind: SessionErrorKind,
    pub message: String,
    /// When the error was recorded (Unix ms)
    pub at: i64,
}

/// One run of the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: SessionId,
    /// Why the session started (`manual`, `scheduled`, `connectivity_restored`, ...)
    pub trigger: String,
    /// Start timestamp (Unix ms)
    pub started_at: i64,
    /// End timestamp (Unix ms); set once closed
    pub ended_at: Option<i64>,
    pub status: SessionStatus,
    pub items_processed: u32,
    pub items_succeeded: u32,
    pub items_failed: u32,
    pub conflicts_detected: u32,
    pub bytes_synced: u64,
    pub errors: Vec<SessionError>,
}

impl SyncSession {
    pub(crate) fn start(trigger: impl Into<String>, started_at: i64) -> Self {
        Self {
            id: SessionId::new(),
            trigger: trigger.into(),
            started_at,
            ended_at: None,
            status: SessionStatus::Running,
            items_processed: 0,
            items_succeeded: 0,
            items_failed: 0,
            conflicts_detected: 0,
            bytes_synced: 0,
            errors: Vec::new(),
        }
    }

    pub(crate) fn record_error(
        &mut self,
        item_id: Option<String>,
        kind: SessionErrorKind,
        message: impl Into<String>,
        at: i64,
    ) {
        self.errors.push(SessionError {
            item_id,
            kind,
            message: message.into(),
            at,
        });
    }

    pub(crate) fn close(&mut self, status: SessionStatus, ended_at: i64) {
        self.status = status;
        self.ended_at = Some(ended_at);
    }

    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }
}
