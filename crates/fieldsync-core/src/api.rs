//! Request/response surface over the sync core.
//!
//! Every call returns an [`ApiResponse`] envelope instead of a `Result`, so
//! hosts can forward it unchanged to a UI or serialize it as JSON.

use std::sync::Arc;

use serde::Serialize;

use crate::conflict::{
    ConflictEngine, ConflictQuery, ConflictStats, OverrideRequest, ResolutionSuggestion,
    ResolveRequest,
};
use crate::error::{Error, Result};
use crate::models::{
    Conflict, ConflictId, EntityType, LocalEntity, OptimisticUpdate, Page, SyncSession,
    UpdateId, UpdateStats,
};
use crate::orchestrator::{SyncOrchestrator, SyncStatus};
use crate::scheduler::Clock;
use crate::tracker::{RetryOutcome, UpdateTracker};

/// Envelope returned by every API call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub error_code: Option<&'static str>,
    /// Response time (Unix ms)
    pub timestamp: i64,
}

impl<T> ApiResponse<T> {
    fn from_result(result: Result<T>, timestamp: i64) -> Self {
        match result {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                error: None,
                error_code: None,
                timestamp,
            },
            Err(error) => {
                tracing::debug!("API call failed with {}: {error}", error.code());
                Self {
                    success: false,
                    data: None,
                    error_code: Some(error.code()),
                    error: Some(error.to_string()),
                    timestamp,
                }
            }
        }
    }

    pub fn into_result(self) -> std::result::Result<T, String> {
        match (self.data, self.error) {
            (Some(data), _) if self.success => Ok(data),
            (_, Some(error)) => Err(error),
            _ => Err("empty response".to_string()),
        }
    }
}

/// Local view of one entity together with its update history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityUpdates {
    pub entity: Option<LocalEntity>,
    pub updates: Vec<OptimisticUpdate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RollbackSummary {
    pub rolled_back: usize,
}

#[derive(Clone)]
pub struct SyncApi {
    conflicts: ConflictEngine,
    tracker: UpdateTracker,
    orchestrator: SyncOrchestrator,
    clock: Arc<dyn Clock>,
}

impl SyncApi {
    pub fn new(
        conflicts: ConflictEngine,
        tracker: UpdateTracker,
        orchestrator: SyncOrchestrator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            conflicts,
            tracker,
            orchestrator,
            clock,
        }
    }

    fn respond<T>(&self, result: Result<T>) -> ApiResponse<T> {
        ApiResponse::from_result(result, self.clock.now_millis())
    }

    // Conflicts

    pub async fn list_conflicts(&self, query: &ConflictQuery) -> ApiResponse<Page<Conflict>> {
        self.respond(self.conflicts.list(query).await)
    }

    pub async fn get_conflict(&self, id: &ConflictId) -> ApiResponse<Conflict> {
        self.respond(self.conflicts.get_conflict(id).await)
    }

    pub async fn resolve_conflict(&self, request: ResolveRequest) -> ApiResponse<Conflict> {
        self.respond(self.conflicts.resolve(request).await)
    }

    pub async fn override_conflict(&self, request: OverrideRequest) -> ApiResponse<Conflict> {
        self.respond(self.conflicts.override_resolution(request).await)
    }

    pub async fn conflict_audit(
        &self,
        entity_id: &str,
        include_resolved: bool,
    ) -> ApiResponse<Vec<Conflict>> {
        let result = if entity_id.trim().is_empty() {
            Err(Error::validation("entity id must not be empty"))
        } else {
            self.conflicts
                .get_audit_trail(entity_id, include_resolved)
                .await
        };
        self.respond(result)
    }

    pub async fn suggest_resolution(&self, id: &ConflictId) -> ApiResponse<ResolutionSuggestion> {
        let result = self
            .conflicts
            .get_conflict(id)
            .await
            .map(|conflict| ConflictEngine::suggest_resolution(&conflict));
        self.respond(result)
    }

    pub async fn conflict_stats(&self) -> ApiResponse<ConflictStats> {
        self.respond(self.conflicts.stats().await)
    }

    // Sync

    pub async fn sync_status(&self) -> ApiResponse<SyncStatus> {
        self.respond(self.orchestrator.get_status().await)
    }

    pub async fn trigger_sync(&self, reason: &str) -> ApiResponse<SyncSession> {
        self.respond(self.orchestrator.trigger_immediate_sync(reason).await)
    }

    pub async fn pause_sync(&self) -> ApiResponse<SyncStatus> {
        self.orchestrator.pause();
        self.sync_status().await
    }

    pub async fn resume_sync(&self) -> ApiResponse<SyncStatus> {
        self.orchestrator.resume();
        self.sync_status().await
    }

    pub async fn sync_history(&self, limit: usize) -> ApiResponse<Vec<SyncSession>> {
        self.respond(self.orchestrator.recent_sessions(limit).await)
    }

    // Optimistic updates

    pub async fn entity_updates(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> ApiResponse<EntityUpdates> {
        self.respond(self.load_entity_updates(entity_type, entity_id).await)
    }

    async fn load_entity_updates(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<EntityUpdates> {
        Ok(EntityUpdates {
            entity: self.tracker.entity_state(entity_type, entity_id).await?,
            updates: self.tracker.updates_for_entity(entity_id).await?,
        })
    }

    pub async fn get_update(&self, id: &UpdateId) -> ApiResponse<OptimisticUpdate> {
        self.respond(self.tracker.get(id).await)
    }

    pub async fn retry_update(&self, id: &UpdateId) -> ApiResponse<RetryOutcome> {
        self.respond(self.tracker.retry(id).await)
    }

    pub async fn rollback_update(&self, id: &UpdateId) -> ApiResponse<OptimisticUpdate> {
        self.respond(self.tracker.rollback(id).await)
    }

    pub async fn rollback_failed(&self) -> ApiResponse<RollbackSummary> {
        let result = self
            .tracker
            .rollback_all_failed()
            .await
            .map(|rolled_back| RollbackSummary { rolled_back });
        self.respond(result)
    }

    pub async fn update_stats(&self) -> ApiResponse<UpdateStats> {
        self.respond(self.tracker.stats().await)
    }
}
