//! Optimistic update and local entity models

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::{text_enum, QueueItemId, UpdateId};
use super::queue_item::{EntityType, Payload, QueueAction};

/// Lifecycle of an optimistic update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStatus {
    Pending,
    Confirmed,
    Failed,
    RolledBack,
}

text_enum!(UpdateStatus {
    Pending => "PENDING",
    Confirmed => "CONFIRMED",
    Failed => "FAILED",
    RolledBack => "ROLLED_BACK",
});

impl UpdateStatus {
    /// `Confirmed` and `RolledBack` never change again
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::RolledBack)
    }
}

/// Client-visible projection of a queued mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimisticUpdate {
    pub id: UpdateId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: QueueAction,
    pub payload: Payload,
    /// Entity state before the update; `None` when the entity did not exist
    pub previous_state: Option<Value>,
    /// Soft delete flag of the entity before the update
    #[serde(default)]
    pub previous_deleted: bool,
    /// Sync state of the entity before the update
    #[serde(default)]
    pub previous_sync_state: Option<EntitySyncState>,
    /// Durable queue item carrying the mutation
    pub queue_item_id: QueueItemId,
    pub status: UpdateStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last transition timestamp (Unix ms)
    pub updated_at: i64,
}

/// Aggregate counts over all tracked updates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStats {
    pub total: usize,
    pub pending: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub rolled_back: usize,
}

/// Sync state of the locally visible copy of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntitySyncState {
    Pending,
    Synced,
    Failed,
}

text_enum!(EntitySyncState {
    Pending => "PENDING",
    Synced => "SYNCED",
    Failed => "FAILED",
});

/// Locally visible state of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntity {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub data: Value,
    pub sync_state: EntitySyncState,
    /// Soft delete flag
    pub is_deleted: bool,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(UpdateStatus::Confirmed.is_terminal());
        assert!(UpdateStatus::RolledBack.is_terminal());
        assert!(!UpdateStatus::Failed.is_terminal());
        assert!(!UpdateStatus::Pending.is_terminal());
    }
}
