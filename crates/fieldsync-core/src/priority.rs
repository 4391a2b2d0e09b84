//! Urgency scoring for queued mutations.
//!
//! Scoring is synchronous and side-effect free: the same item, rules and clock
//! reading always produce the same score and reason.

use std::cmp::Reverse;
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::config::PriorityWeights;
use crate::error::{Error, Result};
use crate::models::{
    lookup_path, AssessmentType, ConditionOperator, Payload, PriorityRule, PriorityTier,
    QueueItem, ResponseStatus, RuleCondition,
};
use crate::scheduler::Clock;

const MILLIS_PER_HOUR: i64 = 3_600_000;

/// Score plus the factors that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriorityScore {
    /// Always within 0..=100
    pub score: u8,
    pub reason: String,
}

/// Assigns 0-100 urgency scores to queue items
pub struct PriorityAssigner {
    weights: PriorityWeights,
    keywords: Option<Regex>,
    clock: Arc<dyn Clock>,
}

impl PriorityAssigner {
    pub fn new(weights: PriorityWeights, clock: Arc<dyn Clock>) -> Result<Self> {
        let keywords = build_keyword_pattern(&weights.emergency_keywords)?;
        Ok(Self {
            weights,
            keywords,
            clock,
        })
    }

    /// Score an item at the current clock reading.
    pub fn score(&self, item: &QueueItem, rules: &[PriorityRule]) -> PriorityScore {
        self.score_at(item, rules, self.clock.now_millis())
    }

    /// Score an item as of `now` (Unix ms).
    pub fn score_at(&self, item: &QueueItem, rules: &[PriorityRule], now: i64) -> PriorityScore {
        let weights = &self.weights;
        let data = item.payload.to_json();
        let mut total = 0_i64;
        let mut factors = Vec::new();

        let base = match item.priority {
            PriorityTier::Low => weights.tier_low,
            PriorityTier::Normal => weights.tier_normal,
            PriorityTier::High => weights.tier_high,
        };
        total += i64::from(base);
        factors.push(format!("Base priority {}: {base}", item.priority));

        if item.payload.category() == Some(AssessmentType::Health) {
            total += i64::from(weights.health_bonus);
            factors.push(format!("Health category +{}", weights.health_bonus));
        }

        if self.contains_emergency_keyword(&data) {
            total += i64::from(weights.keyword_bonus);
            factors.push(format!("Emergency keywords +{}", weights.keyword_bonus));
        }

        if let Some(population) = self.affected_population(&data) {
            let bonus = self.population_bonus(population);
            if bonus > 0 {
                total += i64::from(bonus);
                factors.push(format!("Affected population {population} +{bonus}"));
            }
        }

        if let Payload::Response(response) = &item.payload {
            if let Some(planned_date) = response.planned_date {
                let urgency = self.delivery_bonus(planned_date, now);
                if urgency > 0 {
                    total += i64::from(urgency);
                    factors.push(format!("Delivery urgency +{urgency}"));
                }

                let finished = matches!(
                    response.status,
                    Some(ResponseStatus::Completed | ResponseStatus::Cancelled)
                );
                let overdue = planned_date < now && !finished;
                if overdue || response.status == Some(ResponseStatus::InProgress) {
                    total += i64::from(weights.active_delivery_bonus);
                    let label = if overdue { "Overdue" } else { "Active" };
                    factors.push(format!(
                        "{label} delivery +{}",
                        weights.active_delivery_bonus
                    ));
                }
            }
        }

        let applied = rules
            .iter()
            .filter(|rule| rule.targets(item.entity_type()))
            .filter(|rule| {
                rule.conditions
                    .iter()
                    .any(|condition| condition_matches(condition, &data))
            })
            .collect::<Vec<_>>();
        if !applied.is_empty() {
            let modifier = applied
                .iter()
                .map(|rule| i64::from(rule.priority_modifier))
                .sum::<i64>();
            total += modifier;
            factors.push(format!(
                "Custom rules applied: {} ({modifier:+})",
                applied.len()
            ));
        }

        let age_bonus = self.age_bonus(item.created_at, now);
        if age_bonus > 0 {
            total += i64::from(age_bonus);
            let hours = (now - item.created_at).max(0) / MILLIS_PER_HOUR;
            factors.push(format!("Age {hours}h +{age_bonus}"));
        }

        PriorityScore {
            score: u8::try_from(total.clamp(0, 100)).unwrap_or(100),
            reason: factors.join("; "),
        }
    }

    /// Rescore every item; only score and reason change.
    pub fn recalculate_all(&self, items: Vec<QueueItem>, rules: &[PriorityRule]) -> Vec<QueueItem> {
        let now = self.clock.now_millis();
        items
            .into_iter()
            .map(|mut item| {
                let scored = self.score_at(&item, rules, now);
                item.priority_score = scored.score;
                item.priority_reason = scored.reason;
                item
            })
            .collect()
    }

    /// Order items for a sync pass: highest score first, older first on ties.
    pub fn sort_for_sync(items: &mut [QueueItem]) {
        items.sort_by_key(|item| (Reverse(item.priority_score), item.created_at));
    }

    fn contains_emergency_keyword(&self, data: &Value) -> bool {
        let Some(pattern) = &self.keywords else {
            return false;
        };
        let mut texts = Vec::new();
        collect_text(data, &mut texts);
        texts.iter().any(|text| pattern.is_match(text))
    }

    fn affected_population(&self, data: &Value) -> Option<u64> {
        self.weights
            .population_fields
            .iter()
            .find_map(|field| lookup_path(data, field).and_then(as_number))
            .filter(|population| population.is_finite() && *population > 0.0)
            .map(|population| population.round() as u64)
    }

    fn population_bonus(&self, population: u64) -> i32 {
        let saturation = self.weights.population_saturation.max(1);
        let capped = population.min(saturation);
        let bonus = i64::from(self.weights.population_max_bonus) * i64::try_from(capped).unwrap_or(0)
            / i64::try_from(saturation).unwrap_or(1);
        i32::try_from(bonus).unwrap_or(self.weights.population_max_bonus)
    }

    fn delivery_bonus(&self, planned_date: i64, now: i64) -> i32 {
        let max_bonus = f64::from(self.weights.delivery_max_bonus);
        let hours_remaining = (planned_date - now) as f64 / MILLIS_PER_HOUR as f64;
        if hours_remaining <= 0.0 {
            return self.weights.delivery_max_bonus;
        }
        (max_bonus * 24.0 / (24.0 + hours_remaining)).round() as i32
    }

    fn age_bonus(&self, created_at: i64, now: i64) -> i32 {
        let hours = (now - created_at).max(0) / MILLIS_PER_HOUR;
        let points = hours / i64::from(self.weights.age_hours_per_point.max(1));
        i32::try_from(points.min(i64::from(self.weights.age_max_bonus)))
            .unwrap_or(self.weights.age_max_bonus)
    }
}

/// Evaluate one rule condition against the payload data.
pub fn condition_matches(condition: &RuleCondition, data: &Value) -> bool {
    let Some(actual) = lookup_path(data, &condition.field) else {
        return false;
    };
    let expected = &condition.value;

    match condition.operator {
        ConditionOperator::Equals => {
            actual == expected
                || (actual.is_number()
                    && expected.is_number()
                    && as_number(actual) == as_number(expected))
        }
        ConditionOperator::GreaterThan => match (as_number(actual), as_number(expected)) {
            (Some(actual), Some(expected)) => actual > expected,
            _ => false,
        },
        ConditionOperator::Contains => stringify(actual)
            .to_lowercase()
            .contains(&stringify(expected).to_lowercase()),
    }
}

fn build_keyword_pattern(keywords: &[String]) -> Result<Option<Regex>> {
    let escaped = keywords
        .iter()
        .map(|keyword| keyword.trim())
        .filter(|keyword| !keyword.is_empty())
        .map(regex::escape)
        .collect::<Vec<_>>();
    if escaped.is_empty() {
        return Ok(None);
    }

    Regex::new(&format!(r"(?i)\b(?:{})\b", escaped.join("|")))
        .map(Some)
        .map_err(|error| Error::Config(format!("invalid emergency keyword set: {error}")))
}

fn collect_text<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(text) => out.push(text),
        Value::Array(values) => values.iter().for_each(|value| collect_text(value, out)),
        Value::Object(fields) => fields.values().for_each(|value| collect_text(value, out)),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, QueueAction, RuleCondition};
    use crate::scheduler::ManualClock;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000_000;

    fn assigner() -> (ManualClock, PriorityAssigner) {
        let clock = ManualClock::new(NOW);
        let assigner =
            PriorityAssigner::new(PriorityWeights::default(), Arc::new(clock.clone())).unwrap();
        (clock, assigner)
    }

    fn assessment(kind: &str, tier: PriorityTier, extra: Value) -> QueueItem {
        let mut data = json!({ "assessment_type": kind });
        if let (Value::Object(target), Value::Object(fields)) = (&mut data, extra) {
            target.extend(fields);
        }
        QueueItem::new_at(
            "entity-1",
            QueueAction::Create,
            Payload::from_json(EntityType::Assessment, data).unwrap(),
            tier,
            NOW,
        )
    }

    fn response(planned_date: i64, status: &str) -> QueueItem {
        QueueItem::new_at(
            "response-1",
            QueueAction::Update,
            Payload::from_json(
                EntityType::Response,
                json!({
                    "response_type": "FOOD",
                    "planned_date": planned_date,
                    "status": status,
                }),
            )
            .unwrap(),
            PriorityTier::Normal,
            NOW,
        )
    }

    #[test]
    fn high_tier_health_without_keywords_scores_above_sixty() {
        let (_clock, assigner) = assigner();
        let item = assessment("HEALTH", PriorityTier::High, json!({}));
        let scored = assigner.score(&item, &[]);
        assert!(scored.score > 60, "score was {}", scored.score);
        assert_eq!(scored.reason, "Base priority HIGH: 50; Health category +25");
    }

    #[test]
    fn normal_tier_health_with_outbreak_keywords_scores_above_sixty() {
        let (_clock, assigner) = assigner();
        let item = assessment(
            "HEALTH",
            PriorityTier::Normal,
            json!({ "observations": "Suspected disease outbreak in camp B" }),
        );
        let scored = assigner.score(&item, &[]);
        assert!(scored.score > 60, "score was {}", scored.score);
        assert!(scored.reason.contains("Emergency keywords +20"));
    }

    #[test]
    fn health_emergency_beats_plain_shelter() {
        let (_clock, assigner) = assigner();
        let health = assessment(
            "HEALTH",
            PriorityTier::Normal,
            json!({ "notes": "cholera cases rising", "affected_population": 5000 }),
        );
        let shelter = assessment(
            "SHELTER",
            PriorityTier::Normal,
            json!({ "notes": "tents needed", "affected_population": 5000 }),
        );
        assert!(assigner.score(&health, &[]).score > assigner.score(&shelter, &[]).score);
    }

    #[test]
    fn keywords_match_whole_words_only() {
        let (_clock, assigner) = assigner();
        let item = assessment(
            "WASH",
            PriorityTier::Low,
            json!({ "notes": "hypercritically reviewed" }),
        );
        assert!(!assigner.score(&item, &[]).reason.contains("Emergency"));
    }

    #[test]
    fn score_is_clamped_when_every_bonus_is_maxed() {
        let (clock, assigner) = assigner();
        let item = assessment(
            "HEALTH",
            PriorityTier::High,
            json!({
                "notes": "critical epidemic with fatalities",
                "affected_population": 1_000_000,
            }),
        );
        let rule = PriorityRule::new(
            "everything",
            EntityType::Assessment,
            vec![RuleCondition::new(
                "assessment_type",
                ConditionOperator::Equals,
                json!("HEALTH"),
            )],
            500,
            "admin",
        );
        clock.advance(Duration::from_secs(60 * 60 * 24 * 30));
        assert_eq!(assigner.score(&item, &[rule]).score, 100);
    }

    #[test]
    fn negative_rules_cannot_push_below_zero() {
        let (_clock, assigner) = assigner();
        let item = assessment("FOOD", PriorityTier::Low, json!({}));
        let rule = PriorityRule::new(
            "deprioritise",
            EntityType::Assessment,
            vec![RuleCondition::new(
                "assessment_type",
                ConditionOperator::Contains,
                json!("fo"),
            )],
            -500,
            "admin",
        );
        assert_eq!(assigner.score(&item, &[rule]).score, 0);
    }

    #[test]
    fn population_bonus_saturates() {
        let (_clock, assigner) = assigner();
        let half = assessment("FOOD", PriorityTier::Low, json!({ "affected_population": 500 }));
        let full = assessment("FOOD", PriorityTier::Low, json!({ "affected_population": "1000" }));
        let huge = assessment("FOOD", PriorityTier::Low, json!({ "affected_population": 90_000 }));

        assert_eq!(assigner.score(&half, &[]).score, 10 + 7);
        assert_eq!(assigner.score(&full, &[]).score, 10 + 15);
        assert_eq!(assigner.score(&huge, &[]).score, 10 + 15);
    }

    #[test]
    fn matching_rule_increases_score() {
        let (_clock, assigner) = assigner();
        let rule = PriorityRule::new(
            "large camps",
            EntityType::Assessment,
            vec![
                RuleCondition::new("camp.size", ConditionOperator::GreaterThan, json!(200)),
                RuleCondition::new("district", ConditionOperator::Equals, json!("Bama")),
            ],
            12,
            "coordinator-1",
        );
        let matching = assessment("SHELTER", PriorityTier::Normal, json!({ "camp": { "size": 450 } }));
        let other = assessment("SHELTER", PriorityTier::Normal, json!({ "camp": { "size": 50 } }));

        let matched = assigner.score(&matching, &[rule.clone()]);
        let unmatched = assigner.score(&other, &[rule]);
        assert_eq!(matched.score, unmatched.score + 12);
        assert!(matched.reason.contains("Custom rules applied: 1 (+12)"));
    }

    #[test]
    fn rules_stack_and_ignore_inactive_or_other_types() {
        let (_clock, assigner) = assigner();
        let condition = RuleCondition::new("notes", ConditionOperator::Contains, json!("FLOOD"));
        let first = PriorityRule::new("a", EntityType::Assessment, vec![condition.clone()], 5, "x");
        let second = PriorityRule::new("b", EntityType::Assessment, vec![condition.clone()], 7, "x");
        let mut inactive = PriorityRule::new("c", EntityType::Assessment, vec![condition.clone()], 9, "x");
        inactive.is_active = false;
        let other_type = PriorityRule::new("d", EntityType::Incident, vec![condition], 11, "x");

        let item = assessment("WASH", PriorityTier::Low, json!({ "notes": "Flood water rising" }));
        let scored = assigner.score(&item, &[first, second, inactive, other_type]);
        assert_eq!(scored.score, 10 + 12);
        assert!(scored.reason.contains("Custom rules applied: 2 (+12)"));
    }

    #[test]
    fn condition_operators() {
        let data = json!({ "count": 5, "label": "Urgent Care", "ratio": "2.5" });
        let cond = |field: &str, operator, value| RuleCondition::new(field, operator, value);

        assert!(condition_matches(&cond("count", ConditionOperator::Equals, json!(5.0)), &data));
        assert!(!condition_matches(&cond("count", ConditionOperator::Equals, json!("5")), &data));
        assert!(condition_matches(&cond("ratio", ConditionOperator::GreaterThan, json!(2)), &data));
        assert!(!condition_matches(&cond("label", ConditionOperator::GreaterThan, json!(1)), &data));
        assert!(condition_matches(&cond("label", ConditionOperator::Contains, json!("care")), &data));
        assert!(condition_matches(&cond("count", ConditionOperator::Contains, json!("5")), &data));
        assert!(!condition_matches(&cond("missing", ConditionOperator::Contains, json!("")), &data));
    }

    #[test]
    fn response_deadline_urgency_grows_as_deadline_nears() {
        let (_clock, assigner) = assigner();
        let hour = MILLIS_PER_HOUR;
        let far = assigner.score(&response(NOW + 240 * hour, "PLANNED"), &[]).score;
        let soon = assigner.score(&response(NOW + 2 * hour, "PLANNED"), &[]).score;
        let overdue = assigner.score(&response(NOW - hour, "PLANNED"), &[]);

        assert!(soon > far);
        assert_eq!(overdue.score, 30 + 20 + 10);
        assert!(overdue.reason.contains("Overdue delivery +10"));
    }

    #[test]
    fn in_progress_response_gets_active_bonus() {
        let (_clock, assigner) = assigner();
        let planned = assigner.score(&response(NOW + 24 * MILLIS_PER_HOUR, "PLANNED"), &[]);
        let active = assigner.score(&response(NOW + 24 * MILLIS_PER_HOUR, "IN_PROGRESS"), &[]);
        assert_eq!(active.score, planned.score + 10);
    }

    #[test]
    fn recalculate_all_is_idempotent_and_monotonic_in_age() {
        let (clock, assigner) = assigner();
        let items = vec![
            assessment("FOOD", PriorityTier::Low, json!({})),
            assessment("HEALTH", PriorityTier::Normal, json!({})),
        ];

        let first = assigner.recalculate_all(items, &[]);
        let second = assigner.recalculate_all(first.clone(), &[]);
        assert_eq!(first, second);

        clock.advance(Duration::from_secs(6 * 60 * 60));
        let later = assigner.recalculate_all(second.clone(), &[]);
        for (before, after) in second.iter().zip(&later) {
            assert!(after.priority_score >= before.priority_score);
        }
        assert!(later[0].priority_reason.contains("Age 6h +3"));
    }

    #[test]
    fn age_bonus_is_capped() {
        let (clock, assigner) = assigner();
        let item = assessment("FOOD", PriorityTier::Low, json!({}));
        clock.advance(Duration::from_secs(60 * 60 * 24 * 365));
        assert_eq!(assigner.score(&item, &[]).score, 10 + 10);
    }

    #[test]
    fn sort_for_sync_orders_by_score_then_age() {
        let mut older = assessment("FOOD", PriorityTier::Low, json!({}));
        older.priority_score = 40;
        older.created_at = NOW - 10;
        let mut newer = older.clone();
        newer.created_at = NOW;
        let mut top = older.clone();
        top.priority_score = 90;
        top.created_at = NOW + 10;

        let mut items = vec![newer.clone(), top.clone(), older.clone()];
        PriorityAssigner::sort_for_sync(&mut items);
        let order = items.iter().map(|item| item.created_at).collect::<Vec<_>>();
        assert_eq!(order, vec![top.created_at, older.created_at, newer.created_at]);
    }
}
