//! Queue service: scoring-aware access to the durable queue and its rules.

use std::sync::Arc;

use rusqlite::Connection;
use serde::Serialize;

use super::Store;
use crate::db::{DurableQueue, QueueEntry, SqliteQueueRepository, SqliteRuleRepository};
use crate::error::{Error, Result};
use crate::models::{Payload, PriorityRule, QueueItem, QueueItemId, QueueStatus, RuleId};
use crate::priority::PriorityAssigner;
use crate::scheduler::Clock;

/// Item counts per queue status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub pending: usize,
    pub syncing: usize,
    pub conflicted: usize,
    pub failed: usize,
    /// Rows that could not be decoded
    pub corrupt: usize,
}

/// Durable queue plus the priority rules used to score it
#[derive(Clone)]
pub struct QueueService {
    store: Store,
    assigner: Arc<PriorityAssigner>,
    clock: Arc<dyn Clock>,
}

impl QueueService {
    pub fn new(store: Store, assigner: Arc<PriorityAssigner>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            assigner,
            clock,
        }
    }

    pub fn assigner(&self) -> &PriorityAssigner {
        &self.assigner
    }

    /// Score a new item against the active rules and persist it.
    pub async fn enqueue(&self, item: QueueItem) -> Result<QueueItem> {
        let now = self.clock.now_millis();
        self.store
            .write(|conn| self.stage(conn, item, now))
            .await
    }

    /// Score and insert inside a caller-owned transaction.
    pub(crate) fn stage(&self, conn: &Connection, mut item: QueueItem, now: i64) -> Result<QueueItem> {
        if item.entity_id.trim().is_empty() {
            return Err(Error::validation("queue item requires an entity id"));
        }

        let rules = SqliteRuleRepository::new(conn).list_active()?;
        let scored = self.assigner.score_at(&item, &rules, now);
        item.priority_score = scored.score;
        item.priority_reason = scored.reason;
        SqliteQueueRepository::new(conn, now).enqueue(&item)?;

        tracing::debug!(
            "Queued {} {} for {} with score {}",
            item.action,
            item.entity_type(),
            item.entity_id,
            item.priority_score
        );
        Ok(item)
    }

    pub async fn get(&self, id: &QueueItemId) -> Result<Option<QueueItem>> {
        let now = self.clock.now_millis();
        self.store
            .read(|conn| SqliteQueueRepository::new(conn, now).get(id))
            .await
    }

    /// Every stored entry, including unreadable ones
    pub async fn list_all(&self) -> Result<Vec<QueueEntry>> {
        let now = self.clock.now_millis();
        self.store
            .read(|conn| SqliteQueueRepository::new(conn, now).list_all())
            .await
    }

    /// Up to `limit` pending items in the order the next session would send them
    pub async fn next_batch(&self, limit: usize) -> Result<Vec<QueueItem>> {
        let now = self.clock.now_millis();
        self.store
            .read(|conn| SqliteQueueRepository::new(conn, now).dequeue_batch(limit))
            .await
    }

    pub async fn list_by_entity(&self, entity_id: &str) -> Result<Vec<QueueItem>> {
        let now = self.clock.now_millis();
        self.store
            .read(|conn| SqliteQueueRepository::new(conn, now).list_by_entity(entity_id))
            .await
    }

    pub async fn mark_status(&self, id: &QueueItemId, status: QueueStatus) -> Result<()> {
        let now = self.clock.now_millis();
        self.store
            .write(|conn| SqliteQueueRepository::new(conn, now).mark_status(id, status))
            .await
    }

    /// Persist an item's mutable state; `updated_at` is stamped with the clock
    pub async fn save(&self, item: &QueueItem) -> Result<()> {
        let now = self.clock.now_millis();
        self.store
            .write(|conn| SqliteQueueRepository::new(conn, now).save(item))
            .await
    }

    pub async fn remove(&self, id: &QueueItemId) -> Result<bool> {
        let now = self.clock.now_millis();
        self.store
            .write(|conn| SqliteQueueRepository::new(conn, now).remove(id))
            .await
    }

    /// Return items left `SYNCING` by an interrupted session to the pending
    /// queue. Only safe while no session is exchanging.
    pub async fn release_interrupted(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let released = self
            .store
            .write(|conn| {
                SqliteQueueRepository::new(conn, now)
                    .reset_status(QueueStatus::Syncing, QueueStatus::Pending)
            })
            .await?;
        if released > 0 {
            tracing::warn!("Released {released} queue item(s) left syncing by an interrupted session");
        }
        Ok(released)
    }

    /// Replace the payload of a conflicted item with resolved data
    pub async fn replace_payload(&self, id: &QueueItemId, payload: &Payload) -> Result<bool> {
        let now = self.clock.now_millis();
        self.store
            .write(|conn| SqliteQueueRepository::new(conn, now).replace_payload(id, payload))
            .await
    }

    /// Rescore every readable pending item, persist the results and return
    /// them in sync order.
    pub async fn recalculate_scores(&self) -> Result<Vec<QueueItem>> {
        let now = self.clock.now_millis();
        let assigner = Arc::clone(&self.assigner);
        self.store
            .write(move |conn| {
                let repo = SqliteQueueRepository::new(conn, now);
                let rules = SqliteRuleRepository::new(conn).list_active()?;
                let pending = repo
                    .list_all()?
                    .into_iter()
                    .filter_map(std::result::Result::ok)
                    .filter(|item| item.status == QueueStatus::Pending)
                    .collect::<Vec<_>>();

                let mut rescored = assigner.recalculate_all(pending, &rules);
                for item in &rescored {
                    repo.update_score(&item.id, item.priority_score, &item.priority_reason)?;
                }
                PriorityAssigner::sort_for_sync(&mut rescored);
                Ok(rescored)
            })
            .await
    }

    pub async fn summary(&self) -> Result<QueueSummary> {
        let entries = self.list_all().await?;
        let mut summary = QueueSummary::default();
        for entry in &entries {
            match entry {
                Ok(item) => match item.status {
                    QueueStatus::Pending => summary.pending += 1,
                    QueueStatus::Syncing => summary.syncing += 1,
                    QueueStatus::Conflicted => summary.conflicted += 1,
                    QueueStatus::Failed => summary.failed += 1,
                },
                Err(_) => summary.corrupt += 1,
            }
        }
        Ok(summary)
    }

    /// Store a new rule after checking it can ever apply.
    pub async fn add_rule(&self, rule: PriorityRule) -> Result<PriorityRule> {
        if rule.name.trim().is_empty() {
            return Err(Error::validation("rule name must not be empty"));
        }
        if rule.conditions.is_empty() {
            return Err(Error::validation("rule needs at least one condition"));
        }
        if rule
            .conditions
            .iter()
            .any(|condition| condition.field.trim().is_empty())
        {
            return Err(Error::validation("rule condition field must not be empty"));
        }

        self.store
            .write(|conn| SqliteRuleRepository::new(conn).insert(&rule))
            .await?;
        tracing::info!("Added priority rule '{}' ({:+})", rule.name, rule.priority_modifier);
        Ok(rule)
    }

    pub async fn list_rules(&self) -> Result<Vec<PriorityRule>> {
        self.store
            .read(|conn| SqliteRuleRepository::new(conn).list())
            .await
    }

    pub async fn active_rules(&self) -> Result<Vec<PriorityRule>> {
        self.store
            .read(|conn| SqliteRuleRepository::new(conn).list_active())
            .await
    }

    pub async fn set_rule_active(&self, id: &RuleId, is_active: bool) -> Result<()> {
        self.store
            .write(|conn| SqliteRuleRepository::new(conn).set_active(id, is_active))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PriorityWeights;
    use crate::models::{
        ConditionOperator, EntityType, PriorityTier, QueueAction, RuleCondition,
    };
    use crate::scheduler::ManualClock;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000_000;

    fn service() -> (ManualClock, QueueService) {
        let clock = ManualClock::new(NOW);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let assigner =
            Arc::new(PriorityAssigner::new(PriorityWeights::default(), Arc::clone(&shared)).unwrap());
        let store = Store::open_in_memory().unwrap();
        (clock, QueueService::new(store, assigner, shared))
    }

    fn item(kind: &str, tier: PriorityTier) -> QueueItem {
        QueueItem::new_at(
            format!("{kind}-site"),
            QueueAction::Create,
            Payload::from_json(
                EntityType::Assessment,
                json!({ "assessment_type": kind, "district": "Konduga" }),
            )
            .unwrap(),
            tier,
            NOW,
        )
    }

    #[tokio::test]
    async fn enqueue_scores_with_active_rules() {
        let (_clock, queue) = service();
        queue
            .add_rule(PriorityRule::new(
                "Konduga focus",
                EntityType::Assessment,
                vec![RuleCondition::new(
                    "district",
                    ConditionOperator::Equals,
                    json!("Konduga"),
                )],
                8,
                "coordinator",
            ))
            .await
            .unwrap();

        let stored = queue.enqueue(item("FOOD", PriorityTier::Normal)).await.unwrap();
        assert_eq!(stored.priority_score, 30 + 8);
        assert_eq!(queue.get(&stored.id).await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn recalculation_persists_and_orders_by_score() {
        let (clock, queue) = service();
        let low = queue.enqueue(item("FOOD", PriorityTier::Low)).await.unwrap();
        let health = queue.enqueue(item("HEALTH", PriorityTier::High)).await.unwrap();

        clock.advance(Duration::from_secs(4 * 60 * 60));
        let ordered = queue.recalculate_scores().await.unwrap();
        let ids = ordered.iter().map(|item| item.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![health.id, low.id]);

        let refreshed = queue.get(&low.id).await.unwrap().unwrap();
        assert_eq!(refreshed.priority_score, low.priority_score + 2);
        assert_eq!(queue.next_batch(1).await.unwrap()[0].id, health.id);
    }

    #[tokio::test]
    async fn rules_require_conditions_and_a_name() {
        let (_clock, queue) = service();
        let empty = PriorityRule::new("empty", EntityType::Response, Vec::new(), 5, "admin");
        assert!(matches!(queue.add_rule(empty).await, Err(Error::Validation(_))));

        let unnamed = PriorityRule::new(
            " ",
            EntityType::Response,
            vec![RuleCondition::new("status", ConditionOperator::Equals, json!("PLANNED"))],
            5,
            "admin",
        );
        assert!(matches!(queue.add_rule(unnamed).await, Err(Error::Validation(_))));
        assert!(queue.list_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn summary_counts_statuses() {
        let (_clock, queue) = service();
        let first = queue.enqueue(item("FOOD", PriorityTier::Low)).await.unwrap();
        queue.enqueue(item("WASH", PriorityTier::Low)).await.unwrap();
        queue.mark_status(&first.id, QueueStatus::Failed).await.unwrap();

        let summary = queue.summary().await.unwrap();
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.corrupt, 0);
    }

    #[tokio::test]
    async fn interrupted_items_return_to_pending() {
        let (_clock, queue) = service();
        let stuck = queue.enqueue(item("HEALTH", PriorityTier::High)).await.unwrap();
        let failed = queue.enqueue(item("FOOD", PriorityTier::Low)).await.unwrap();
        queue.mark_status(&stuck.id, QueueStatus::Syncing).await.unwrap();
        queue.mark_status(&failed.id, QueueStatus::Failed).await.unwrap();

        assert_eq!(queue.release_interrupted().await.unwrap(), 1);
        assert_eq!(queue.get(&stuck.id).await.unwrap().unwrap().status, QueueStatus::Pending);
        assert_eq!(queue.get(&failed.id).await.unwrap().unwrap().status, QueueStatus::Failed);
        assert_eq!(queue.release_interrupted().await.unwrap(), 0);
    }
}
