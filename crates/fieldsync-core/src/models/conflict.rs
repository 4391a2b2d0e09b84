//! Sync conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::{text_enum, ConflictId};
use super::queue_item::EntityType;

/// How the local and server versions diverge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// Ordinary field values differ
    FieldLevel,
    /// Only timestamp-like fields differ
    Timestamp,
    /// One side deleted the entity
    Delete,
}

text_enum!(ConflictType {
    FieldLevel => "FIELD_LEVEL",
    Timestamp => "TIMESTAMP",
    Delete => "DELETE",
});

/// Review urgency of a conflict, ordered `Low < High < Critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictSeverity {
    Low,
    High,
    Critical,
}

text_enum!(ConflictSeverity {
    Low => "LOW",
    High => "HIGH",
    Critical => "CRITICAL",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

text_enum!(ConflictStatus {
    Pending => "PENDING",
    Resolved => "RESOLVED",
});

/// Policy deciding the final value of a conflicted entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    LocalWins,
    ServerWins,
    Manual,
}

text_enum!(ResolutionStrategy {
    LocalWins => "LOCAL_WINS",
    ServerWins => "SERVER_WINS",
    Manual => "MANUAL",
});

/// Role of the person resolving or overriding a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolverRole {
    FieldWorker,
    Coordinator,
    Supervisor,
    Admin,
}

text_enum!(ResolverRole {
    FieldWorker => "FIELD_WORKER",
    Coordinator => "COORDINATOR",
    Supervisor => "SUPERVISOR",
    Admin => "ADMIN",
});

/// Review marker attached to override audit entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationLevel {
    Standard,
    Supervisor,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Detected,
    Resolved,
    Overridden,
}

/// One append-only audit trail entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the action happened (Unix ms)
    pub timestamp: i64,
    pub action: AuditAction,
    /// User id, or `system` for automatic actions
    pub actor: String,
    pub details: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_level: Option<EscalationLevel>,
}

/// Outcome recorded when a conflict is resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    pub resolved_by: String,
    pub justification: String,
    /// Entity data that becomes authoritative
    pub final_data: Value,
    /// Resolution timestamp (Unix ms)
    pub resolved_at: i64,
    /// Whether the privileged override path was used
    #[serde(default)]
    pub is_override: bool,
}

/// Detected divergence between the local and server copy of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub local_version: Value,
    pub server_version: Value,
    /// Divergent field paths, sorted
    pub conflicting_fields: Vec<String>,
    pub status: ConflictStatus,
    /// Last local edit (Unix ms), when known
    pub local_modified_at: Option<i64>,
    /// Last server edit (Unix ms), when known
    pub server_modified_at: Option<i64>,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
    pub audit_trail: Vec<AuditEntry>,
    pub resolution: Option<Resolution>,
}

impl Conflict {
    pub fn is_pending(&self) -> bool {
        self.status == ConflictStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_by_urgency() {
        assert!(ConflictSeverity::Critical > ConflictSeverity::High);
        assert!(ConflictSeverity::High > ConflictSeverity::Low);
    }

    #[test]
    fn strategy_parses_cli_spelling() {
        assert_eq!(
            "local-wins".parse::<ResolutionStrategy>(),
            Ok(ResolutionStrategy::LocalWins)
        );
        assert_eq!(
            "MANUAL".parse::<ResolutionStrategy>(),
            Ok(ResolutionStrategy::Manual)
        );
    }
}
