//! Optimistic updates: local changes that are visible immediately and later
//! confirmed, failed, retried or rolled back.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RetryPolicy;
use crate::db::{DurableQueue, SqliteEntityRepository, SqliteQueueRepository, SqliteUpdateRepository};
use crate::error::{Error, Result};
use crate::events::{Observers, Subscription};
use crate::models::{
    EntitySyncState, EntityType, LocalEntity, OptimisticUpdate, Payload, PriorityTier,
    QueueAction, QueueItem, QueueItemId, QueueStatus, UpdateId, UpdateStats, UpdateStatus,
};
use crate::scheduler::{ScheduledJob, Scheduler};
use crate::services::{QueueService, Store};

/// A local change to apply optimistically
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub entity_id: String,
    pub operation: QueueAction,
    pub payload: Payload,
    #[serde(default)]
    pub priority: PriorityTier,
    /// Entity state before the change; read from the local store when absent
    #[serde(default)]
    pub previous_state: Option<Value>,
}

/// Result of a retry request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryOutcome {
    /// The mutation is queued again
    Resubmitted { attempt: u32 },
    /// Retry budget exhausted; nothing changed
    LimitReached { retry_count: u32 },
}

/// Transition notifications
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    Confirmed(OptimisticUpdate),
    Failed {
        update: OptimisticUpdate,
        error: String,
    },
    RolledBack(OptimisticUpdate),
}

type UpdateHandler = Box<dyn Fn(&OptimisticUpdate) + Send + Sync>;
type ErrorHandler = Box<dyn Fn(&OptimisticUpdate, &str) + Send + Sync>;

/// Optional handlers for update transitions
#[derive(Default)]
pub struct UpdateCallbacks {
    pub on_success: Option<UpdateHandler>,
    pub on_error: Option<ErrorHandler>,
    pub on_rollback: Option<UpdateHandler>,
}

/// Tracks optimistic updates and keeps the local entity store in step
#[derive(Clone)]
pub struct UpdateTracker {
    store: Store,
    queue: QueueService,
    scheduler: Scheduler,
    retry: RetryPolicy,
    events: Observers<UpdateEvent>,
}

impl UpdateTracker {
    pub fn new(store: Store, queue: QueueService, scheduler: Scheduler, retry: RetryPolicy) -> Self {
        Self {
            store,
            queue,
            scheduler,
            retry,
            events: Observers::new(),
        }
    }

    pub fn subscribe(&self, callbacks: UpdateCallbacks) -> Subscription {
        self.events.subscribe(move |event| match event {
            UpdateEvent::Confirmed(update) => {
                if let Some(handler) = &callbacks.on_success {
                    handler(update);
                }
            }
            UpdateEvent::Failed { update, error } => {
                if let Some(handler) = &callbacks.on_error {
                    handler(update, error);
                }
            }
            UpdateEvent::RolledBack(update) => {
                if let Some(handler) = &callbacks.on_rollback {
                    handler(update);
                }
            }
        })
    }

    /// Apply a change locally and queue it for the server.
    pub async fn apply(&self, request: ApplyRequest) -> Result<UpdateId> {
        if request.entity_id.trim().is_empty() {
            return Err(Error::validation("update requires an entity id"));
        }

        let now = self.scheduler.now_millis();
        let entity_type = request.payload.entity_type();
        let update = self
            .store
            .write(|conn| {
                let entities = SqliteEntityRepository::new(conn);
                let existing = entities.get(entity_type, &request.entity_id)?;
                let previous_deleted = existing.as_ref().is_some_and(|entity| entity.is_deleted);
                let previous_sync_state = existing.as_ref().map(|entity| entity.sync_state);
                let previous_state = request
                    .previous_state
                    .or_else(|| existing.map(|entity| entity.data));

                let item = QueueItem::new_at(
                    request.entity_id.clone(),
                    request.operation,
                    request.payload.clone(),
                    request.priority,
                    now,
                );
                let item = self.queue.stage(conn, item, now)?;

                entities.upsert(&LocalEntity {
                    entity_type,
                    entity_id: request.entity_id.clone(),
                    data: request.payload.to_json(),
                    sync_state: EntitySyncState::Pending,
                    is_deleted: request.operation == QueueAction::Delete,
                    updated_at: now,
                })?;

                let update = OptimisticUpdate {
                    id: UpdateId::new(),
                    entity_type,
                    entity_id: request.entity_id,
                    operation: request.operation,
                    payload: request.payload,
                    previous_state,
                    previous_deleted,
                    previous_sync_state,
                    queue_item_id: item.id,
                    status: UpdateStatus::Pending,
                    retry_count: 0,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                };
                SqliteUpdateRepository::new(conn).insert(&update)?;
                Ok(update)
            })
            .await?;

        tracing::debug!(
            "Applied {} on {} {} as update {}",
            update.operation,
            update.entity_type,
            update.entity_id,
            update.id
        );
        Ok(update.id)
    }

    pub async fn get(&self, id: &UpdateId) -> Result<OptimisticUpdate> {
        self.store
            .read(|conn| SqliteUpdateRepository::new(conn).get(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("update {id}")))
    }

    /// Mark a pending update as accepted by the server.
    pub async fn confirm(&self, id: &UpdateId) -> Result<OptimisticUpdate> {
        let update = self.get(id).await?;
        self.confirm_update(update).await
    }

    /// Confirm the pending update carried by a queue item; items queued
    /// without one yield `None`.
    pub async fn confirm_queue_item(&self, queue_item_id: &QueueItemId) -> Result<Option<OptimisticUpdate>> {
        match self.find_by_queue_item(queue_item_id).await? {
            Some(update) if update.status == UpdateStatus::Pending => {
                self.confirm_update(update).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    async fn confirm_update(&self, mut update: OptimisticUpdate) -> Result<OptimisticUpdate> {
        ensure_status(&update, UpdateStatus::Pending, "confirm")?;

        let now = self.scheduler.now_millis();
        update.status = UpdateStatus::Confirmed;
        update.last_error = None;
        update.updated_at = now;
        self.store
            .write(|conn| {
                SqliteUpdateRepository::new(conn).save(&update)?;
                SqliteEntityRepository::new(conn).set_sync_state(
                    update.entity_type,
                    &update.entity_id,
                    EntitySyncState::Synced,
                    now,
                )?;
                Ok(())
            })
            .await?;

        tracing::debug!("Update {} confirmed", update.id);
        self.events.emit(&UpdateEvent::Confirmed(update.clone()));
        Ok(update)
    }

    /// Record a failed delivery and, when allowed, schedule an automatic retry.
    pub async fn fail(&self, id: &UpdateId, message: &str, retryable: bool) -> Result<OptimisticUpdate> {
        let mut update = self.get(id).await?;
        ensure_status(&update, UpdateStatus::Pending, "fail")?;

        let now = self.scheduler.now_millis();
        update.status = UpdateStatus::Failed;
        update.last_error = Some(message.to_string());
        update.updated_at = now;
        self.store
            .write(|conn| {
                SqliteUpdateRepository::new(conn).save(&update)?;
                SqliteEntityRepository::new(conn).set_sync_state(
                    update.entity_type,
                    &update.entity_id,
                    EntitySyncState::Failed,
                    now,
                )?;
                Ok(())
            })
            .await?;

        tracing::warn!("Update {} failed: {message}", update.id);
        self.events.emit(&UpdateEvent::Failed {
            update: update.clone(),
            error: message.to_string(),
        });

        if self.retry.auto_retry && retryable && update.retry_count < self.retry.max_retries {
            let delay = self.retry.delay_for(update.retry_count);
            self.scheduler
                .schedule_after(delay, ScheduledJob::RetryUpdate(update.id));
            tracing::debug!("Retry of update {} scheduled in {delay:?}", update.id);
        }
        Ok(update)
    }

    /// Fail the update carried by a queue item, if there is one.
    pub async fn fail_queue_item(
        &self,
        queue_item_id: &QueueItemId,
        message: &str,
        retryable: bool,
    ) -> Result<Option<OptimisticUpdate>> {
        match self.find_by_queue_item(queue_item_id).await? {
            Some(update) if update.status == UpdateStatus::Pending => {
                self.fail(&update.id, message, retryable).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Send a failed update back to the queue. Updates held by a conflict
    /// are refused until the conflict is resolved.
    pub async fn retry(&self, id: &UpdateId) -> Result<RetryOutcome> {
        let mut update = self.get(id).await?;
        ensure_status(&update, UpdateStatus::Failed, "retry")?;

        if update.retry_count >= self.retry.max_retries {
            tracing::info!(
                "Update {} reached the retry limit ({})",
                update.id,
                self.retry.max_retries
            );
            return Ok(RetryOutcome::LimitReached {
                retry_count: update.retry_count,
            });
        }

        let now = self.scheduler.now_millis();
        update.status = UpdateStatus::Pending;
        update.retry_count += 1;
        update.updated_at = now;
        self.store
            .write(|conn| {
                ensure_not_conflicted(conn, &update, now, "retry")?;
                SqliteUpdateRepository::new(conn).save(&update)?;
                requeue(conn, &update, now)
            })
            .await?;
        self.scheduler.cancel_job(ScheduledJob::RetryUpdate(update.id));

        tracing::info!("Update {} resubmitted (attempt {})", update.id, update.retry_count);
        Ok(RetryOutcome::Resubmitted {
            attempt: update.retry_count,
        })
    }

    /// Undo a failed update: restore the previous entity state and drop the
    /// queued mutation. Updates held by an unresolved conflict are refused;
    /// the conflict's resolution settles them.
    pub async fn rollback(&self, id: &UpdateId) -> Result<OptimisticUpdate> {
        let mut update = self.get(id).await?;
        ensure_status(&update, UpdateStatus::Failed, "roll back")?;

        let now = self.scheduler.now_millis();
        update.status = UpdateStatus::RolledBack;
        update.updated_at = now;
        self.store
            .write(|conn| {
                ensure_not_conflicted(conn, &update, now, "roll back")?;
                SqliteUpdateRepository::new(conn).save(&update)?;
                let entities = SqliteEntityRepository::new(conn);
                match &update.previous_state {
                    Some(state) => entities.upsert(&LocalEntity {
                        entity_type: update.entity_type,
                        entity_id: update.entity_id.clone(),
                        data: state.clone(),
                        sync_state: update.previous_sync_state.unwrap_or(EntitySyncState::Synced),
                        is_deleted: update.previous_deleted,
                        updated_at: now,
                    })?,
                    None => {
                        entities.delete(update.entity_type, &update.entity_id)?;
                    }
                }
                SqliteQueueRepository::new(conn, now).remove(&update.queue_item_id)?;
                Ok(())
            })
            .await?;
        self.scheduler.cancel_job(ScheduledJob::RetryUpdate(update.id));

        tracing::info!("Update {} rolled back", update.id);
        self.events.emit(&UpdateEvent::RolledBack(update.clone()));
        Ok(update)
    }

    /// Roll back every failed update not waiting on a conflict; returns how
    /// many were rolled back.
    pub async fn rollback_all_failed(&self) -> Result<usize> {
        let failed = self
            .store
            .read(|conn| SqliteUpdateRepository::new(conn).list_by_status(UpdateStatus::Failed))
            .await?;

        let mut rolled_back = 0;
        for update in failed {
            match self.rollback(&update.id).await {
                Ok(_) => rolled_back += 1,
                Err(Error::State(reason)) => tracing::debug!("Skipping rollback: {reason}"),
                Err(error) => return Err(error),
            }
        }
        Ok(rolled_back)
    }

    /// The conflict behind a queue item was resolved in favour of local or
    /// merged data: the update is pending again and the entity shows `data`.
    pub async fn requeue_after_resolution(
        &self,
        queue_item_id: &QueueItemId,
        data: &Value,
    ) -> Result<Option<OptimisticUpdate>> {
        let Some(mut update) = self.find_by_queue_item(queue_item_id).await? else {
            return Ok(None);
        };
        if update.status.is_terminal() {
            return Ok(None);
        }

        let now = self.scheduler.now_millis();
        update.status = UpdateStatus::Pending;
        update.updated_at = now;
        self.store
            .write(|conn| {
                SqliteUpdateRepository::new(conn).save(&update)?;
                let entities = SqliteEntityRepository::new(conn);
                let is_deleted = entities
                    .get(update.entity_type, &update.entity_id)?
                    .is_some_and(|entity| entity.is_deleted);
                entities.upsert(&LocalEntity {
                    entity_type: update.entity_type,
                    entity_id: update.entity_id.clone(),
                    data: data.clone(),
                    sync_state: EntitySyncState::Pending,
                    is_deleted,
                    updated_at: now,
                })
            })
            .await?;
        self.scheduler.cancel_job(ScheduledJob::RetryUpdate(update.id));
        Ok(Some(update))
    }

    /// The conflict was resolved in favour of the server: the update is
    /// rolled back and the entity adopts the server state.
    pub async fn discard_after_resolution(
        &self,
        queue_item_id: &QueueItemId,
        server_state: &Value,
    ) -> Result<Option<OptimisticUpdate>> {
        let Some(mut update) = self.find_by_queue_item(queue_item_id).await? else {
            return Ok(None);
        };
        if update.status.is_terminal() {
            return Ok(None);
        }

        let now = self.scheduler.now_millis();
        update.status = UpdateStatus::RolledBack;
        update.updated_at = now;
        self.store
            .write(|conn| {
                SqliteUpdateRepository::new(conn).save(&update)?;
                SqliteEntityRepository::new(conn).upsert(&LocalEntity {
                    entity_type: update.entity_type,
                    entity_id: update.entity_id.clone(),
                    data: server_state.clone(),
                    sync_state: EntitySyncState::Synced,
                    is_deleted: false,
                    updated_at: now,
                })
            })
            .await?;
        self.scheduler.cancel_job(ScheduledJob::RetryUpdate(update.id));

        self.events.emit(&UpdateEvent::RolledBack(update.clone()));
        Ok(Some(update))
    }

    pub async fn stats(&self) -> Result<UpdateStats> {
        self.store
            .read(|conn| SqliteUpdateRepository::new(conn).stats())
            .await
    }

    /// Locally visible state of an entity
    pub async fn entity_state(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<LocalEntity>> {
        self.store
            .read(|conn| SqliteEntityRepository::new(conn).get(entity_type, entity_id))
            .await
    }

    pub async fn updates_for_entity(&self, entity_id: &str) -> Result<Vec<OptimisticUpdate>> {
        self.store
            .read(|conn| SqliteUpdateRepository::new(conn).list_by_entity(entity_id))
            .await
    }

    async fn find_by_queue_item(&self, queue_item_id: &QueueItemId) -> Result<Option<OptimisticUpdate>> {
        self.store
            .read(|conn| SqliteUpdateRepository::new(conn).find_by_queue_item(queue_item_id))
            .await
    }
}

/// Return the update's queue item and entity to pending.
fn requeue(conn: &Connection, update: &OptimisticUpdate, now: i64) -> Result<()> {
    let queue = SqliteQueueRepository::new(conn, now);
    if queue.get(&update.queue_item_id)?.is_some() {
        queue.mark_status(&update.queue_item_id, QueueStatus::Pending)?;
    } else {
        tracing::warn!(
            "Queue item {} for update {} is gone; re-queueing the payload",
            update.queue_item_id,
            update.id
        );
        let mut item = QueueItem::new_at(
            update.entity_id.clone(),
            update.operation,
            update.payload.clone(),
            PriorityTier::Normal,
            now,
        );
        item.id = update.queue_item_id;
        queue.enqueue(&item)?;
    }
    SqliteEntityRepository::new(conn).set_sync_state(
        update.entity_type,
        &update.entity_id,
        EntitySyncState::Pending,
        now,
    )?;
    Ok(())
}

/// Refuse to act on an update whose queue item is parked behind a conflict.
fn ensure_not_conflicted(
    conn: &Connection,
    update: &OptimisticUpdate,
    now: i64,
    action: &str,
) -> Result<()> {
    let item = match SqliteQueueRepository::new(conn, now).get(&update.queue_item_id) {
        Ok(item) => item,
        Err(Error::CorruptRecord { .. }) => None,
        Err(error) => return Err(error),
    };
    match item {
        Some(item) if item.status == QueueStatus::Conflicted => Err(Error::state(format!(
            "cannot {action} update {} while conflict {} awaits resolution",
            update.id,
            item.conflict_id
                .map_or_else(|| "(unknown)".to_string(), |id| id.to_string()),
        ))),
        _ => Ok(()),
    }
}

fn ensure_status(update: &OptimisticUpdate, expected: UpdateStatus, action: &str) -> Result<()> {
    if update.status == expected {
        Ok(())
    } else {
        Err(Error::state(format!(
            "cannot {action} update {} in status {}",
            update.id, update.status
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PriorityWeights;
    use crate::priority::PriorityAssigner;
    use crate::scheduler::{Clock, ManualClock};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        clock: ManualClock,
        scheduler: Scheduler,
        queue: QueueService,
        tracker: UpdateTracker,
    }

    fn fixture(retry: RetryPolicy) -> Fixture {
        let clock = ManualClock::new(1_700_000_000_000);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Store::open_in_memory().unwrap();
        let assigner =
            Arc::new(PriorityAssigner::new(PriorityWeights::default(), Arc::clone(&shared)).unwrap());
        let queue = QueueService::new(store.clone(), assigner, Arc::clone(&shared));
        let scheduler = Scheduler::new(shared);
        let tracker = UpdateTracker::new(store, queue.clone(), scheduler.clone(), retry);
        Fixture {
            clock,
            scheduler,
            queue,
            tracker,
        }
    }

    fn shelter_update(entity_id: &str, tents: u32) -> ApplyRequest {
        ApplyRequest {
            entity_id: entity_id.to_string(),
            operation: QueueAction::Update,
            payload: Payload::from_json(
                EntityType::Assessment,
                json!({ "assessment_type": "SHELTER", "tents": tents }),
            )
            .unwrap(),
            priority: PriorityTier::Normal,
            previous_state: None,
        }
    }

    #[tokio::test]
    async fn apply_writes_entity_queue_item_and_update() {
        let fx = fixture(RetryPolicy::default());
        let id = fx.tracker.apply(shelter_update("site-1", 4)).await.unwrap();

        let update = fx.tracker.get(&id).await.unwrap();
        assert_eq!(update.status, UpdateStatus::Pending);
        assert_eq!(update.previous_state, None);

        let entity = fx
            .tracker
            .entity_state(EntityType::Assessment, "site-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.sync_state, EntitySyncState::Pending);
        assert_eq!(entity.data["tents"], json!(4));

        let item = fx.queue.get(&update.queue_item_id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert!(item.priority_score > 0);
    }

    #[tokio::test]
    async fn second_apply_captures_previous_local_state() {
        let fx = fixture(RetryPolicy::default());
        fx.tracker.apply(shelter_update("site-1", 4)).await.unwrap();
        let second = fx.tracker.apply(shelter_update("site-1", 9)).await.unwrap();

        let update = fx.tracker.get(&second).await.unwrap();
        assert_eq!(update.previous_state.unwrap()["tents"], json!(4));
        assert_eq!(fx.tracker.updates_for_entity("site-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn confirm_fires_success_once() {
        let fx = fixture(RetryPolicy::default());
        let successes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&successes);
        let _subscription = fx.tracker.subscribe(UpdateCallbacks {
            on_success: Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..UpdateCallbacks::default()
        });

        let id = fx.tracker.apply(shelter_update("site-1", 4)).await.unwrap();
        let update = fx.tracker.get(&id).await.unwrap();
        let confirmed = fx
            .tracker
            .confirm_queue_item(&update.queue_item_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(confirmed.status, UpdateStatus::Confirmed);
        assert!(matches!(fx.tracker.confirm(&id).await, Err(Error::State(_))));
        assert_eq!(successes.load(Ordering::SeqCst), 1);

        let entity = fx
            .tracker
            .entity_state(EntityType::Assessment, "site-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.sync_state, EntitySyncState::Synced);
    }

    #[tokio::test]
    async fn failure_schedules_automatic_retry_with_backoff() {
        let fx = fixture(RetryPolicy::default());
        let id = fx.tracker.apply(shelter_update("site-1", 4)).await.unwrap();
        fx.tracker.fail(&id, "gateway timeout", true).await.unwrap();

        let job = ScheduledJob::RetryUpdate(id);
        assert_eq!(
            fx.scheduler.next_due_of(job),
            Some(fx.clock.now_millis() + 5_000)
        );

        fx.clock.advance(Duration::from_secs(5));
        assert_eq!(fx.scheduler.take_due(), vec![job]);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_not_rescheduled() {
        let fx = fixture(RetryPolicy::default());
        let id = fx.tracker.apply(shelter_update("site-1", 4)).await.unwrap();
        fx.tracker.fail(&id, "conflict", false).await.unwrap();
        assert_eq!(fx.scheduler.next_due(), None);
    }

    #[tokio::test]
    async fn retry_stops_at_the_ceiling() {
        let fx = fixture(RetryPolicy {
            auto_retry: false,
            max_retries: 2,
            ..RetryPolicy::default()
        });
        let id = fx.tracker.apply(shelter_update("site-1", 4)).await.unwrap();

        for attempt in 1..=2 {
            fx.tracker.fail(&id, "offline", true).await.unwrap();
            assert_eq!(
                fx.tracker.retry(&id).await.unwrap(),
                RetryOutcome::Resubmitted { attempt }
            );
        }

        fx.tracker.fail(&id, "offline", true).await.unwrap();
        assert_eq!(
            fx.tracker.retry(&id).await.unwrap(),
            RetryOutcome::LimitReached { retry_count: 2 }
        );
        let update = fx.tracker.get(&id).await.unwrap();
        assert_eq!(update.status, UpdateStatus::Failed);
        assert_eq!(update.retry_count, 2);
    }

    #[tokio::test]
    async fn retry_rejects_unknown_and_non_failed_updates() {
        let fx = fixture(RetryPolicy::default());
        assert!(matches!(
            fx.tracker.retry(&UpdateId::new()).await,
            Err(Error::NotFound(_))
        ));

        let id = fx.tracker.apply(shelter_update("site-1", 4)).await.unwrap();
        assert!(matches!(fx.tracker.retry(&id).await, Err(Error::State(_))));
    }

    #[tokio::test]
    async fn rollback_restores_previous_state_and_drops_queue_item() {
        let fx = fixture(RetryPolicy::default());
        let rollbacks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&rollbacks);
        let subscription = fx.tracker.subscribe(UpdateCallbacks {
            on_rollback: Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..UpdateCallbacks::default()
        });

        let mut request = shelter_update("site-1", 9);
        request.previous_state = Some(json!({ "assessment_type": "SHELTER", "tents": 2 }));
        let id = fx.tracker.apply(request).await.unwrap();
        assert!(matches!(fx.tracker.rollback(&id).await, Err(Error::State(_))));

        fx.tracker.fail(&id, "rejected", true).await.unwrap();
        let rolled_back = fx.tracker.rollback(&id).await.unwrap();
        assert_eq!(rolled_back.status, UpdateStatus::RolledBack);
        assert_eq!(fx.scheduler.next_due(), None);
        assert!(fx.queue.get(&rolled_back.queue_item_id).await.unwrap().is_none());

        let entity = fx
            .tracker
            .entity_state(EntityType::Assessment, "site-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.data["tents"], json!(2));
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);

        subscription.unsubscribe();
    }

    #[tokio::test]
    async fn rollback_keeps_the_prior_entity_flags() {
        let fx = fixture(RetryPolicy::default());
        fx.tracker.apply(shelter_update("site-1", 4)).await.unwrap();
        let mut removal = shelter_update("site-1", 4);
        removal.operation = QueueAction::Delete;
        fx.tracker.apply(removal).await.unwrap();

        let revived = fx.tracker.apply(shelter_update("site-1", 7)).await.unwrap();
        let update = fx.tracker.get(&revived).await.unwrap();
        assert!(update.previous_deleted);
        assert_eq!(update.previous_sync_state, Some(EntitySyncState::Pending));

        fx.tracker.fail(&revived, "rejected", false).await.unwrap();
        fx.tracker.rollback(&revived).await.unwrap();
        let entity = fx
            .tracker
            .entity_state(EntityType::Assessment, "site-1")
            .await
            .unwrap()
            .unwrap();
        assert!(entity.is_deleted);
        assert_eq!(entity.sync_state, EntitySyncState::Pending);
        assert_eq!(entity.data["tents"], json!(4));
    }

    #[tokio::test]
    async fn rollback_of_a_create_removes_the_entity() {
        let fx = fixture(RetryPolicy::default());
        let created = fx.tracker.apply(shelter_update("site-1", 1)).await.unwrap();
        let other = fx.tracker.apply(shelter_update("site-2", 1)).await.unwrap();
        fx.tracker.fail(&created, "rejected", false).await.unwrap();
        fx.tracker.fail(&other, "rejected", false).await.unwrap();

        assert_eq!(fx.tracker.rollback_all_failed().await.unwrap(), 2);
        assert!(fx
            .tracker
            .entity_state(EntityType::Assessment, "site-1")
            .await
            .unwrap()
            .is_none());

        let stats = fx.tracker.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.rolled_back, 2);
    }

    #[tokio::test]
    async fn settlement_after_conflict_resolution() {
        let fx = fixture(RetryPolicy::default());
        let kept = fx.tracker.apply(shelter_update("site-1", 4)).await.unwrap();
        let dropped = fx.tracker.apply(shelter_update("site-2", 4)).await.unwrap();
        fx.tracker.fail(&kept, "version conflict", false).await.unwrap();
        fx.tracker.fail(&dropped, "version conflict", false).await.unwrap();

        let kept = fx.tracker.get(&kept).await.unwrap();
        let merged = json!({ "assessment_type": "SHELTER", "tents": 6 });
        let requeued = fx
            .tracker
            .requeue_after_resolution(&kept.queue_item_id, &merged)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(requeued.status, UpdateStatus::Pending);
        assert_eq!(requeued.retry_count, 0);

        let dropped = fx.tracker.get(&dropped).await.unwrap();
        let server = json!({ "assessment_type": "SHELTER", "tents": 3 });
        let discarded = fx
            .tracker
            .discard_after_resolution(&dropped.queue_item_id, &server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(discarded.status, UpdateStatus::RolledBack);

        let entity = fx
            .tracker
            .entity_state(EntityType::Assessment, "site-2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.data, server);
        assert_eq!(entity.sync_state, EntitySyncState::Synced);
    }
}
