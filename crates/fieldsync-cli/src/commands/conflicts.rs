use fieldsync_core::conflict::{ConflictQuery, OverrideRequest, ResolveRequest};
use fieldsync_core::db::ConflictFilter;
use fieldsync_core::models::{Conflict, ConflictId};
use fieldsync_core::SyncRuntime;

use crate::cli::{ConflictListArgs, OverrideArgs, ResolveArgs};
use crate::commands::common::{emit, format_sync_timestamp, parse_id, parse_optional_json};
use crate::error::CliError;

pub fn query_from_args(args: ConflictListArgs) -> ConflictQuery {
    ConflictQuery {
        filter: ConflictFilter {
            status: args.status.map(Into::into),
            severity: args.severity.map(Into::into),
            conflict_type: None,
            entity_type: args.entity_type.map(Into::into),
            entity_id: args.entity_id,
        },
        page: args.page,
        page_size: args.page_size,
    }
}

pub async fn run_conflicts_list(
    args: ConflictListArgs,
    as_json: bool,
    runtime: &SyncRuntime,
) -> Result<(), CliError> {
    let response = runtime.api().list_conflicts(&query_from_args(args)).await;
    emit(response, as_json, |page| {
        if page.items.is_empty() {
            return vec!["No conflicts found.".to_string()];
        }
        let mut lines = page
            .items
            .iter()
            .map(format_conflict_line)
            .collect::<Vec<_>>();
        lines.push(format!(
            "Page {} ({} of {} total){}",
            page.page,
            page.items.len(),
            page.total,
            if page.has_more { ", more available" } else { "" }
        ));
        lines
    })
}

pub fn format_conflict_line(conflict: &Conflict) -> String {
    format!(
        "{} {:<8} {:<8} {:<11} {}/{} fields: {}",
        conflict.id,
        conflict.status.as_str(),
        conflict.severity.as_str(),
        conflict.conflict_type.as_str(),
        conflict.entity_type,
        conflict.entity_id,
        conflict.conflicting_fields.join(", "),
    )
}

pub fn format_conflict_detail(conflict: &Conflict) -> Vec<String> {
    let mut lines = vec![
        format_conflict_line(conflict),
        format!("Detected: {}", format_sync_timestamp(conflict.detected_at)),
        format!("Local:  {}", conflict.local_version),
        format!("Server: {}", conflict.server_version),
    ];
    if let Some(resolution) = &conflict.resolution {
        lines.push(format!(
            "Resolved {} by {} at {}{}: {}",
            resolution.strategy,
            resolution.resolved_by,
            format_sync_timestamp(resolution.resolved_at),
            if resolution.is_override { " (override)" } else { "" },
            resolution.justification
        ));
    }
    lines.push("Audit trail:".to_string());
    lines.extend(conflict.audit_trail.iter().map(|entry| {
        format!(
            "  {} {:?} by {}: {}",
            format_sync_timestamp(entry.timestamp),
            entry.action,
            entry.actor,
            entry.details
        )
    }));
    lines
}

pub async fn run_conflicts_show(
    id: &str,
    as_json: bool,
    runtime: &SyncRuntime,
) -> Result<(), CliError> {
    let conflict_id: ConflictId = parse_id("conflict", id)?;
    let response = runtime.api().get_conflict(&conflict_id).await;
    emit(response, as_json, format_conflict_detail)
}

pub async fn run_conflicts_resolve(
    args: ResolveArgs,
    as_json: bool,
    runtime: &SyncRuntime,
) -> Result<(), CliError> {
    let request = ResolveRequest {
        conflict_id: parse_id("conflict", &args.id)?,
        strategy: args.strategy.into(),
        merged_data: parse_optional_json("merged", args.merged.as_deref())?,
        justification: args.justification,
        resolved_by: args.by,
    };
    let response = runtime.api().resolve_conflict(request).await;
    emit(response, as_json, |conflict| {
        vec![format!("Resolved conflict {}", conflict.id)]
    })
}

pub async fn run_conflicts_override(
    args: OverrideArgs,
    as_json: bool,
    runtime: &SyncRuntime,
) -> Result<(), CliError> {
    let request = OverrideRequest {
        conflict_id: parse_id("conflict", &args.id)?,
        strategy: args.strategy.into(),
        forced_data: parse_optional_json("data", args.data.as_deref())?,
        reason: args.reason,
        overridden_by: args.by,
        role: args.role.into(),
        emergency_override: args.emergency,
    };
    let response = runtime.api().override_conflict(request).await;
    emit(response, as_json, |conflict| {
        vec![format!("Overrode conflict {}", conflict.id)]
    })
}

pub async fn run_conflicts_audit(
    entity_id: &str,
    include_resolved: bool,
    as_json: bool,
    runtime: &SyncRuntime,
) -> Result<(), CliError> {
    let response = runtime
        .api()
        .conflict_audit(entity_id, include_resolved)
        .await;
    emit(response, as_json, |conflicts| {
        if conflicts.is_empty() {
            return vec![format!("No conflicts recorded for {entity_id}.")];
        }
        conflicts.iter().flat_map(format_conflict_detail).collect()
    })
}

pub async fn run_conflicts_suggest(
    id: &str,
    as_json: bool,
    runtime: &SyncRuntime,
) -> Result<(), CliError> {
    let conflict_id: ConflictId = parse_id("conflict", id)?;
    let response = runtime.api().suggest_resolution(&conflict_id).await;
    emit(response, as_json, |suggestion| {
        vec![format!("{}: {}", suggestion.strategy, suggestion.reason)]
    })
}

pub async fn run_conflicts_stats(as_json: bool, runtime: &SyncRuntime) -> Result<(), CliError> {
    let response = runtime.api().conflict_stats().await;
    emit(response, as_json, |stats| {
        vec![
            format!(
                "Pending: {} ({} critical, {} high, {} low)",
                stats.pending, stats.pending_critical, stats.pending_high, stats.pending_low
            ),
            format!("Resolved: {}", stats.resolved),
        ]
    })
}
