use fieldsync_core::api::EntityUpdates;
use fieldsync_core::models::{EntityType, OptimisticUpdate, UpdateId};
use fieldsync_core::tracker::RetryOutcome;
use fieldsync_core::SyncRuntime;

use crate::commands::common::{emit, format_sync_timestamp, parse_id};
use crate::error::CliError;

pub async fn run_updates_stats(as_json: bool, runtime: &SyncRuntime) -> Result<(), CliError> {
    let response = runtime.api().update_stats().await;
    emit(response, as_json, |stats| {
        vec![format!(
            "{} total: {} pending, {} confirmed, {} failed, {} rolled back",
            stats.total, stats.pending, stats.confirmed, stats.failed, stats.rolled_back
        )]
    })
}

pub fn format_update_line(update: &OptimisticUpdate) -> String {
    let mut line = format!(
        "{} {:<11} {:<6} {}/{} at {}",
        update.id,
        update.status.as_str(),
        update.operation.as_str(),
        update.entity_type,
        update.entity_id,
        format_sync_timestamp(update.updated_at),
    );
    if update.retry_count > 0 {
        line.push_str(&format!(" retries={}", update.retry_count));
    }
    if let Some(error) = &update.last_error {
        line.push_str(&format!(" ({error})"));
    }
    line
}

pub fn format_entity_updates(entity_updates: &EntityUpdates) -> Vec<String> {
    let mut lines = vec![match &entity_updates.entity {
        Some(entity) if entity.is_deleted => format!("Deleted locally ({})", entity.sync_state),
        Some(entity) => format!("Local state ({}): {}", entity.sync_state, entity.data),
        None => "No local copy".to_string(),
    }];
    if entity_updates.updates.is_empty() {
        lines.push("No tracked updates.".to_string());
    }
    lines.extend(entity_updates.updates.iter().map(format_update_line));
    lines
}

pub async fn run_updates_show(
    entity_type: EntityType,
    entity_id: &str,
    as_json: bool,
    runtime: &SyncRuntime,
) -> Result<(), CliError> {
    let response = runtime.api().entity_updates(entity_type, entity_id).await;
    emit(response, as_json, format_entity_updates)
}

pub async fn run_updates_get(
    id: &str,
    as_json: bool,
    runtime: &SyncRuntime,
) -> Result<(), CliError> {
    let update_id: UpdateId = parse_id("update", id)?;
    let response = runtime.api().get_update(&update_id).await;
    emit(response, as_json, |update| vec![format_update_line(update)])
}

pub async fn run_updates_retry(
    id: &str,
    as_json: bool,
    runtime: &SyncRuntime,
) -> Result<(), CliError> {
    let update_id: UpdateId = parse_id("update", id)?;
    let response = runtime.api().retry_update(&update_id).await;
    emit(response, as_json, |outcome| {
        vec![match outcome {
            RetryOutcome::Resubmitted { attempt } => {
                format!("Update {update_id} requeued (attempt {attempt})")
            }
            RetryOutcome::LimitReached { retry_count } => {
                format!("Update {update_id} reached its retry limit after {retry_count} attempts")
            }
        }]
    })
}

pub async fn run_updates_rollback(
    id: &str,
    as_json: bool,
    runtime: &SyncRuntime,
) -> Result<(), CliError> {
    let update_id: UpdateId = parse_id("update", id)?;
    let response = runtime.api().rollback_update(&update_id).await;
    emit(response, as_json, |update| {
        vec![format!("Rolled back update {}", update.id)]
    })
}

pub async fn run_updates_rollback_failed(
    as_json: bool,
    runtime: &SyncRuntime,
) -> Result<(), CliError> {
    let response = runtime.api().rollback_failed().await;
    emit(response, as_json, |summary| {
        vec![format!("Rolled back {} failed update(s)", summary.rolled_back)]
    })
}
