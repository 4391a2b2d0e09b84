//! Operator-administered priority rules

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::{text_enum, RuleId};
use super::queue_item::EntityType;

/// Comparison applied by a rule condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionOperator {
    /// Exact match (numbers compared numerically)
    Equals,
    /// Numeric comparison; numeric strings are accepted
    GreaterThan,
    /// Case-insensitive substring on the stringified value
    Contains,
}

text_enum!(ConditionOperator {
    Equals => "EQUALS",
    GreaterThan => "GREATER_THAN",
    Contains => "CONTAINS",
});

/// One condition of a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Dotted field path into the payload data
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
    /// Advisory only; scoring uses the rule-level modifier
    #[serde(default)]
    pub modifier: i32,
}

impl RuleCondition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            modifier: 0,
        }
    }
}

/// A weighting rule applied on top of the built-in scoring heuristics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityRule {
    pub id: RuleId,
    pub name: String,
    /// Entity type the rule targets
    pub entity_type: EntityType,
    /// Conditions; the rule applies when any of them matches
    pub conditions: Vec<RuleCondition>,
    /// Score added when the rule applies
    pub priority_modifier: i32,
    /// Only active rules take part in scoring
    pub is_active: bool,
    /// Author of the rule
    pub created_by: String,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
}

impl PriorityRule {
    /// Create an active rule
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        entity_type: EntityType,
        conditions: Vec<RuleCondition>,
        priority_modifier: i32,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: RuleId::new(),
            name: name.into(),
            entity_type,
            conditions,
            priority_modifier,
            is_active: true,
            created_by: created_by.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Whether this rule takes part in scoring items of `entity_type`
    pub fn targets(&self, entity_type: EntityType) -> bool {
        self.is_active && self.entity_type == entity_type
    }
}
