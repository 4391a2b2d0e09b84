//! Conflict detection, classification and resolution.
//!
//! A conflict moves from `PENDING` to `RESOLVED` exactly once. Every change is
//! recorded as an append-only audit entry on the conflict itself.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{ResolutionPolicy, SeverityPolicy};
use crate::db::{ConflictFilter, SqliteConflictRepository};
use crate::error::{Error, Result};
use crate::models::{
    AuditAction, AuditEntry, Conflict, ConflictId, ConflictSeverity, ConflictStatus,
    ConflictType, EntityType, EscalationLevel, Page, Resolution, ResolutionStrategy,
    ResolverRole,
};
use crate::scheduler::Clock;
use crate::services::Store;

/// Both sides of a version mismatch reported by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionInput {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub local_version: Value,
    pub server_version: Value,
    pub local_modified_at: Option<i64>,
    pub server_modified_at: Option<i64>,
}

/// Outcome of comparing two snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub conflicting_fields: Vec<String>,
}

/// Ordinary resolution request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub conflict_id: ConflictId,
    pub strategy: ResolutionStrategy,
    /// Required for `MANUAL`, refused otherwise
    #[serde(default)]
    pub merged_data: Option<Value>,
    pub justification: String,
    pub resolved_by: String,
}

/// Privileged resolution request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideRequest {
    pub conflict_id: ConflictId,
    pub strategy: ResolutionStrategy,
    /// Required for `MANUAL`, refused otherwise
    #[serde(default)]
    pub forced_data: Option<Value>,
    pub reason: String,
    pub overridden_by: String,
    pub role: ResolverRole,
    #[serde(default)]
    pub emergency_override: bool,
}

/// Filtered, paginated listing request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictQuery {
    #[serde(flatten)]
    pub filter: ConflictFilter,
    pub page: usize,
    pub page_size: usize,
}

impl Default for ConflictQuery {
    fn default() -> Self {
        Self {
            filter: ConflictFilter::default(),
            page: 1,
            page_size: 20,
        }
    }
}

/// Advisory strategy for a conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionSuggestion {
    pub strategy: ResolutionStrategy,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConflictStats {
    pub pending: usize,
    pub pending_critical: usize,
    pub pending_high: usize,
    pub pending_low: usize,
    pub resolved: usize,
}

/// Detects and resolves synchronization conflicts
#[derive(Clone)]
pub struct ConflictEngine {
    store: Store,
    clock: Arc<dyn Clock>,
    severity: SeverityPolicy,
    resolution: ResolutionPolicy,
}

impl ConflictEngine {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        severity: SeverityPolicy,
        resolution: ResolutionPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            severity,
            resolution,
        }
    }

    /// Diff two snapshots and decide type and severity.
    pub fn classify(&self, local: &Value, server: &Value) -> Classification {
        let mut fields = Vec::new();
        diff_paths(local, server, "", &mut fields);

        let conflict_type = if is_marked_deleted(local) || is_marked_deleted(server) {
            ConflictType::Delete
        } else if fields
            .iter()
            .all(|path| listed(&self.severity.timestamp_fields, path))
        {
            ConflictType::Timestamp
        } else {
            ConflictType::FieldLevel
        };

        let severity = if conflict_type == ConflictType::Delete
            || fields.len() >= self.severity.critical_field_count
        {
            ConflictSeverity::Critical
        } else if fields.len() >= self.severity.high_field_count
            || fields
                .iter()
                .any(|path| listed(&self.severity.sensitive_fields, path))
        {
            ConflictSeverity::High
        } else {
            ConflictSeverity::Low
        };

        Classification {
            conflict_type,
            severity,
            conflicting_fields: fields,
        }
    }

    /// Record a new pending conflict.
    pub async fn detect(&self, input: DetectionInput) -> Result<Conflict> {
        let now = self.clock.now_millis();
        let classification = self.classify(&input.local_version, &input.server_version);

        let conflict = Conflict {
            id: ConflictId::new(),
            entity_id: input.entity_id,
            entity_type: input.entity_type,
            conflict_type: classification.conflict_type,
            severity: classification.severity,
            local_version: input.local_version,
            server_version: input.server_version,
            status: ConflictStatus::Pending,
            local_modified_at: input.local_modified_at,
            server_modified_at: input.server_modified_at,
            detected_at: now,
            audit_trail: vec![AuditEntry {
                timestamp: now,
                action: AuditAction::Detected,
                actor: "system".to_string(),
                details: json!({
                    "conflict_type": classification.conflict_type,
                    "severity": classification.severity,
                    "conflicting_fields": classification.conflicting_fields,
                }),
                escalation_level: None,
            }],
            conflicting_fields: classification.conflicting_fields,
            resolution: None,
        };

        self.store
            .write(|conn| SqliteConflictRepository::new(conn).insert(&conflict))
            .await?;
        tracing::info!(
            "Detected {} conflict {} on {} {} ({} fields)",
            conflict.severity,
            conflict.id,
            conflict.entity_type,
            conflict.entity_id,
            conflict.conflicting_fields.len()
        );
        Ok(conflict)
    }

    /// Pending conflicts, most severe first, then oldest first
    pub async fn list_pending(&self, filter: ConflictFilter) -> Result<Vec<Conflict>> {
        let filter = ConflictFilter {
            status: Some(ConflictStatus::Pending),
            ..filter
        };
        self.store
            .read(|conn| SqliteConflictRepository::new(conn).list(&filter, usize::MAX, 0))
            .await
    }

    pub async fn list(&self, query: &ConflictQuery) -> Result<Page<Conflict>> {
        if query.page == 0 || query.page_size == 0 {
            return Err(Error::validation("page and page size start at 1"));
        }

        let offset = Page::<Conflict>::offset(query.page, query.page_size);
        let (items, total) = self
            .store
            .read(|conn| {
                let repo = SqliteConflictRepository::new(conn);
                Ok((
                    repo.list(&query.filter, query.page_size, offset)?,
                    repo.count(&query.filter)?,
                ))
            })
            .await?;
        Ok(Page::new(items, total, query.page, query.page_size))
    }

    pub async fn get_conflict(&self, id: &ConflictId) -> Result<Conflict> {
        self.store
            .read(|conn| SqliteConflictRepository::new(conn).get(id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))
    }

    /// Resolve a pending conflict with one of the ordinary strategies.
    pub async fn resolve(&self, request: ResolveRequest) -> Result<Conflict> {
        require_text(
            &request.justification,
            self.resolution.min_justification_len,
            "justification",
        )?;
        require_actor(&request.resolved_by, "resolver id")?;
        check_data(request.strategy, request.merged_data.as_ref(), "merged data")?;

        let mut conflict = self.get_conflict(&request.conflict_id).await?;
        ensure_pending(&conflict)?;

        let now = self.clock.now_millis();
        let final_data = final_data(&conflict, request.strategy, request.merged_data);
        conflict.audit_trail.push(AuditEntry {
            timestamp: now,
            action: AuditAction::Resolved,
            actor: request.resolved_by.clone(),
            details: json!({
                "strategy": request.strategy,
                "justification": request.justification,
            }),
            escalation_level: None,
        });
        conflict.status = ConflictStatus::Resolved;
        conflict.resolution = Some(Resolution {
            strategy: request.strategy,
            resolved_by: request.resolved_by,
            justification: request.justification,
            final_data,
            resolved_at: now,
            is_override: false,
        });

        self.persist_resolution(&conflict).await?;
        tracing::info!(
            "Resolved conflict {} with {}",
            conflict.id,
            request.strategy
        );
        Ok(conflict)
    }

    /// Privileged resolution with role checks and an escalation level.
    pub async fn override_resolution(&self, request: OverrideRequest) -> Result<Conflict> {
        require_text(
            &request.reason,
            self.resolution.min_override_reason_len,
            "override reason",
        )?;
        require_actor(&request.overridden_by, "overriding user id")?;
        check_data(request.strategy, request.forced_data.as_ref(), "forced data")?;

        let mut conflict = self.get_conflict(&request.conflict_id).await?;
        ensure_pending(&conflict)?;

        if request.emergency_override && request.role != ResolverRole::Admin {
            return Err(Error::PermissionDenied(
                "emergency overrides require the ADMIN role".to_string(),
            ));
        }
        if conflict.severity == ConflictSeverity::Critical && request.role < ResolverRole::Supervisor
        {
            return Err(Error::PermissionDenied(
                "critical conflicts require the SUPERVISOR or ADMIN role".to_string(),
            ));
        }

        let escalation = if request.emergency_override {
            EscalationLevel::Emergency
        } else if conflict.severity == ConflictSeverity::Critical
            || request.role >= ResolverRole::Supervisor
        {
            EscalationLevel::Supervisor
        } else {
            EscalationLevel::Standard
        };

        let now = self.clock.now_millis();
        let final_data = final_data(&conflict, request.strategy, request.forced_data);
        conflict.audit_trail.push(AuditEntry {
            timestamp: now,
            action: AuditAction::Overridden,
            actor: request.overridden_by.clone(),
            details: json!({
                "strategy": request.strategy,
                "reason": request.reason,
                "role": request.role,
                "emergency_override": request.emergency_override,
            }),
            escalation_level: Some(escalation),
        });
        conflict.status = ConflictStatus::Resolved;
        conflict.resolution = Some(Resolution {
            strategy: request.strategy,
            resolved_by: request.overridden_by,
            justification: request.reason,
            final_data,
            resolved_at: now,
            is_override: true,
        });

        self.persist_resolution(&conflict).await?;
        tracing::warn!(
            "Conflict {} overridden with {} by {} ({:?} escalation)",
            conflict.id,
            request.strategy,
            request.role,
            escalation
        );
        Ok(conflict)
    }

    /// Conflicts recorded for an entity, oldest first
    pub async fn get_audit_trail(
        &self,
        entity_id: &str,
        include_resolved: bool,
    ) -> Result<Vec<Conflict>> {
        self.store
            .read(|conn| {
                SqliteConflictRepository::new(conn).list_by_entity(entity_id, include_resolved)
            })
            .await
    }

    /// Advisory strategy; never changes the conflict.
    pub fn suggest_resolution(conflict: &Conflict) -> ResolutionSuggestion {
        if conflict.severity == ConflictSeverity::Critical {
            return ResolutionSuggestion {
                strategy: ResolutionStrategy::Manual,
                reason: "Critical conflicts need a reviewed manual merge".to_string(),
            };
        }

        if conflict.local_modified_at > conflict.server_modified_at {
            ResolutionSuggestion {
                strategy: ResolutionStrategy::LocalWins,
                reason: "Local copy was modified more recently".to_string(),
            }
        } else {
            ResolutionSuggestion {
                strategy: ResolutionStrategy::ServerWins,
                reason: "Server copy is at least as recent as the local copy".to_string(),
            }
        }
    }

    pub async fn stats(&self) -> Result<ConflictStats> {
        let counts = self
            .store
            .read(|conn| SqliteConflictRepository::new(conn).counts())
            .await?;

        let mut stats = ConflictStats::default();
        for (status, severity, count) in counts {
            match status {
                ConflictStatus::Resolved => stats.resolved += count,
                ConflictStatus::Pending => {
                    stats.pending += count;
                    match severity {
                        ConflictSeverity::Critical => stats.pending_critical += count,
                        ConflictSeverity::High => stats.pending_high += count,
                        ConflictSeverity::Low => stats.pending_low += count,
                    }
                }
            }
        }
        Ok(stats)
    }

    async fn persist_resolution(&self, conflict: &Conflict) -> Result<()> {
        let stored = self
            .store
            .write(|conn| SqliteConflictRepository::new(conn).resolve_if_pending(conflict))
            .await?;
        if !stored {
            return Err(Error::state(format!(
                "conflict {} was resolved concurrently",
                conflict.id
            )));
        }
        Ok(())
    }
}

fn require_text(text: &str, min_len: usize, label: &str) -> Result<()> {
    if text.trim().chars().count() < min_len {
        return Err(Error::validation(format!(
            "{label} must be at least {min_len} characters"
        )));
    }
    Ok(())
}

fn require_actor(actor: &str, label: &str) -> Result<()> {
    if actor.trim().is_empty() {
        return Err(Error::validation(format!("{label} is required")));
    }
    Ok(())
}

fn check_data(strategy: ResolutionStrategy, data: Option<&Value>, label: &str) -> Result<()> {
    match (strategy, data) {
        (ResolutionStrategy::Manual, Some(Value::Object(_))) => Ok(()),
        (ResolutionStrategy::Manual, Some(_)) => {
            Err(Error::validation(format!("{label} must be a JSON object")))
        }
        (ResolutionStrategy::Manual, None) => Err(Error::validation(format!(
            "MANUAL resolution requires {label}"
        ))),
        (strategy, Some(_)) => Err(Error::validation(format!(
            "{strategy} resolution does not accept {label}"
        ))),
        (_, None) => Ok(()),
    }
}

fn ensure_pending(conflict: &Conflict) -> Result<()> {
    if conflict.is_pending() {
        Ok(())
    } else {
        Err(Error::state(format!(
            "conflict {} is already resolved",
            conflict.id
        )))
    }
}

fn final_data(conflict: &Conflict, strategy: ResolutionStrategy, supplied: Option<Value>) -> Value {
    match strategy {
        ResolutionStrategy::LocalWins => conflict.local_version.clone(),
        ResolutionStrategy::ServerWins => conflict.server_version.clone(),
        ResolutionStrategy::Manual => supplied.unwrap_or(Value::Null),
    }
}

/// Does the last segment of `path` name one of `fields`?
fn listed(fields: &[String], path: &str) -> bool {
    let leaf = path.rsplit('.').next().unwrap_or(path);
    fields.iter().any(|field| field == leaf || field == path)
}

fn is_marked_deleted(value: &Value) -> bool {
    value.get("is_deleted") == Some(&Value::Bool(true))
        || value.get("deleted") == Some(&Value::Bool(true))
        || value.get("deleted_at").is_some_and(|at| !at.is_null())
}

/// Collect dotted paths where the two values differ. Objects are walked;
/// arrays and scalars compare whole.
fn diff_paths(local: &Value, server: &Value, prefix: &str, out: &mut Vec<String>) {
    match (local, server) {
        (Value::Object(left), Value::Object(right)) => {
            let keys = left.keys().chain(right.keys()).collect::<BTreeSet<_>>();
            for key in keys {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                match (left.get(key), right.get(key)) {
                    (Some(l), Some(r)) => diff_paths(l, r, &path, out),
                    _ => out.push(path),
                }
            }
        }
        (left, right) if left != right => {
            out.push(if prefix.is_empty() {
                "$".to_string()
            } else {
                prefix.to_string()
            });
        }
        _ => {}
    }
}
