//! Queued mutation model and entity payloads

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::id::{text_enum, ConflictId, QueueItemId};

/// Free-form fields carried alongside the typed part of a payload
pub type FieldMap = Map<String, Value>;

/// Kind of entity a mutation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Assessment,
    Response,
    Entity,
    Incident,
}

text_enum!(EntityType {
    Assessment => "ASSESSMENT",
    Response => "RESPONSE",
    Entity => "ENTITY",
    Incident => "INCIDENT",
});

/// Humanitarian sector of an assessment or response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssessmentType {
    Health,
    Wash,
    Shelter,
    Food,
    Security,
    Population,
}

text_enum!(AssessmentType {
    Health => "HEALTH",
    Wash => "WASH",
    Shelter => "SHELTER",
    Food => "FOOD",
    Security => "SECURITY",
    Population => "POPULATION",
});

/// Delivery status of a planned response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Planned,
    InProgress,
    Completed,
    Cancelled,
}

/// Mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueAction {
    Create,
    Update,
    Delete,
}

text_enum!(QueueAction {
    Create => "CREATE",
    Update => "UPDATE",
    Delete => "DELETE",
});

/// Operator-chosen urgency tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriorityTier {
    Low,
    #[default]
    Normal,
    High,
}

text_enum!(PriorityTier {
    Low => "LOW",
    Normal => "NORMAL",
    High => "HIGH",
});

/// Lifecycle of a queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    /// Waiting for the next sync session
    Pending,
    /// Currently being exchanged with the server
    Syncing,
    /// Rejected by the server; waiting on conflict resolution
    Conflicted,
    /// Retries exhausted; needs a manual retry
    Failed,
}

text_enum!(QueueStatus {
    Pending => "PENDING",
    Syncing => "SYNCING",
    Conflicted => "CONFLICTED",
    Failed => "FAILED",
});

/// Typed assessment fields plus everything else the form captured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentData {
    pub assessment_type: AssessmentType,
    #[serde(flatten)]
    pub fields: FieldMap,
}

/// Typed response fields plus everything else the form captured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    pub response_type: AssessmentType,
    /// Planned delivery time (Unix ms); RFC 3339 text is accepted on input
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_millis"
    )]
    pub planned_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
    #[serde(flatten)]
    pub fields: FieldMap,
}

/// Entity-shaped mutation body, tagged by entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Payload {
    Assessment(AssessmentData),
    Response(ResponseData),
    Entity(FieldMap),
    Incident(FieldMap),
}

impl Payload {
    /// Entity type this payload belongs to
    pub const fn entity_type(&self) -> EntityType {
        match self {
            Self::Assessment(_) => EntityType::Assessment,
            Self::Response(_) => EntityType::Response,
            Self::Entity(_) => EntityType::Entity,
            Self::Incident(_) => EntityType::Incident,
        }
    }

    /// Humanitarian sector, when the entity carries one
    pub const fn category(&self) -> Option<AssessmentType> {
        match self {
            Self::Assessment(data) => Some(data.assessment_type),
            Self::Response(data) => Some(data.response_type),
            Self::Entity(_) | Self::Incident(_) => None,
        }
    }

    /// Untagged JSON projection of the entity data
    pub fn to_json(&self) -> Value {
        let value = match self {
            Self::Assessment(data) => serde_json::to_value(data),
            Self::Response(data) => serde_json::to_value(data),
            Self::Entity(fields) | Self::Incident(fields) => Ok(Value::Object(fields.clone())),
        };
        value.unwrap_or_default()
    }

    /// Rebuild a payload from an entity type and its untagged data
    pub fn from_json(entity_type: EntityType, data: Value) -> serde_json::Result<Self> {
        serde_json::from_value(serde_json::json!({
            "entity_type": entity_type.as_str(),
            "data": data,
        }))
    }

    /// Look up a dotted field path (`location.district`) in the entity data
    pub fn field(&self, path: &str) -> Option<Value> {
        lookup_path(&self.to_json(), path).cloned()
    }
}

/// Walk a dotted path through nested JSON objects.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| current.get(segment))
}

/// A mutation awaiting synchronization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique identifier
    pub id: QueueItemId,
    /// Entity the mutation targets
    pub entity_id: String,
    /// Mutation kind
    pub action: QueueAction,
    /// Entity-shaped body
    pub payload: Payload,
    /// Operator-chosen tier
    pub priority: PriorityTier,
    /// Computed urgency, always within 0..=100
    pub priority_score: u8,
    /// Human-readable justification of the score
    pub priority_reason: String,
    /// Queue lifecycle status
    pub status: QueueStatus,
    /// Failed delivery attempts; never decreases
    pub retry_count: u32,
    /// Last delivery error, if any
    pub last_error: Option<String>,
    /// Conflict holding this item, while conflicted or once settled
    pub conflict_id: Option<ConflictId>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
}

impl QueueItem {
    /// Create a pending mutation stamped with the current time
    #[must_use]
    pub fn new(
        entity_id: impl Into<String>,
        action: QueueAction,
        payload: Payload,
        priority: PriorityTier,
    ) -> Self {
        Self::new_at(
            entity_id,
            action,
            payload,
            priority,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    /// Create a pending mutation with an explicit creation time
    #[must_use]
    pub fn new_at(
        entity_id: impl Into<String>,
        action: QueueAction,
        payload: Payload,
        priority: PriorityTier,
        created_at: i64,
    ) -> Self {
        Self {
            id: QueueItemId::new(),
            entity_id: entity_id.into(),
            action,
            payload,
            priority,
            priority_score: 0,
            priority_reason: String::new(),
            status: QueueStatus::Pending,
            retry_count: 0,
            last_error: None,
            conflict_id: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// Entity type carried by the payload
    pub const fn entity_type(&self) -> EntityType {
        self.payload.entity_type()
    }

    /// Serialized size of the payload, used for sync volume accounting
    pub fn payload_size(&self) -> u64 {
        serde_json::to_vec(&self.payload).map_or(0, |bytes| bytes.len() as u64)
    }

    /// The local version of the entity as the server should see it
    pub fn local_snapshot(&self) -> Value {
        let mut snapshot = self.payload.to_json();
        if self.action == QueueAction::Delete {
            if let Value::Object(fields) = &mut snapshot {
                fields.insert("is_deleted".to_string(), Value::Bool(true));
            }
        }
        snapshot
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Millis(i64),
    Text(String),
}

fn deserialize_optional_millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawTimestamp>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawTimestamp::Millis(millis)) => Ok(Some(millis)),
        Some(RawTimestamp::Text(text)) => chrono::DateTime::parse_from_rfc3339(text.trim())
            .map(|at| Some(at.timestamp_millis()))
            .map_err(serde::de::Error::custom),
    }
}
