//! Data models for fieldsync

mod conflict;
mod connectivity;
mod id;
mod page;
mod priority_rule;
mod queue_item;
mod session;
mod update;

pub use conflict::{
    AuditAction, AuditEntry, Conflict, ConflictSeverity, ConflictStatus, ConflictType,
    EscalationLevel, Resolution, ResolutionStrategy, ResolverRole,
};
pub use connectivity::{ConnectionQuality, ConnectionType, ConnectivityStatus};
pub use id::{ConflictId, QueueItemId, RuleId, SessionId, UpdateId};
pub use page::Page;
pub use priority_rule::{ConditionOperator, PriorityRule, RuleCondition};
pub use queue_item::{
    lookup_path, AssessmentData, AssessmentType, EntityType, FieldMap, Payload, PriorityTier,
    QueueAction, QueueItem, QueueStatus, ResponseData, ResponseStatus,
};
pub use session::{SessionError, SessionErrorKind, SessionStatus, SyncSession};
pub use update::{EntitySyncState, LocalEntity, OptimisticUpdate, UpdateStats, UpdateStatus};
