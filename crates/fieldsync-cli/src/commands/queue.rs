use fieldsync_core::db::CorruptEntry;
use fieldsync_core::models::{OptimisticUpdate, Payload, QueueAction, QueueItem};
use fieldsync_core::services::QueueSummary;
use fieldsync_core::tracker::ApplyRequest;
use fieldsync_core::SyncRuntime;
use serde::Serialize;
use serde_json::{json, Value};

use crate::cli::QueueAddArgs;
use crate::commands::common::{
    format_relative_time, now_millis, parse_json, print_json, read_piped_stdin,
};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct QueuedMutation {
    pub update: OptimisticUpdate,
    pub item: Option<QueueItem>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueRow {
    Item(QueueItem),
    Corrupt(CorruptEntry),
}

#[derive(Debug, Serialize)]
pub struct QueueListing {
    pub summary: QueueSummary,
    pub entries: Vec<QueueRow>,
}

pub async fn run_queue_add(
    args: QueueAddArgs,
    as_json: bool,
    runtime: &SyncRuntime,
) -> Result<(), CliError> {
    let action = QueueAction::from(args.action);
    let raw = match args.data {
        Some(data) => Some(data),
        None => read_piped_stdin()?,
    };
    let data = resolve_entity_data(action, raw.as_deref())?;
    let payload = Payload::from_json(args.entity_type.into(), data).map_err(|error| {
        CliError::InvalidJson {
            field: "data",
            reason: error.to_string(),
        }
    })?;

    let tracker = runtime.tracker();
    let update_id = tracker
        .apply(ApplyRequest {
            entity_id: args.entity_id,
            operation: action,
            payload,
            priority: args.priority.into(),
            previous_state: None,
        })
        .await?;
    let update = tracker.get(&update_id).await?;
    let item = runtime.queue().get(&update.queue_item_id).await?;

    if as_json {
        return print_json(&QueuedMutation { update, item });
    }

    println!(
        "Queued {} of {} {} (update {})",
        update.operation, update.entity_type, update.entity_id, update.id
    );
    if let Some(item) = item {
        println!("Priority {}: {}", item.priority_score, item.priority_reason);
    }
    Ok(())
}

/// Deletes may omit their data; every other mutation needs a JSON body.
pub fn resolve_entity_data(action: QueueAction, raw: Option<&str>) -> Result<Value, CliError> {
    match raw {
        Some(raw) => parse_json("data", raw),
        None if action == QueueAction::Delete => Ok(json!({})),
        None => Err(CliError::MissingData),
    }
}

pub async fn run_queue_list(
    limit: usize,
    as_json: bool,
    runtime: &SyncRuntime,
) -> Result<(), CliError> {
    let queue = runtime.queue();
    let summary = queue.summary().await?;
    let entries = queue
        .list_all()
        .await?
        .into_iter()
        .take(limit)
        .map(|entry| entry.map_or_else(QueueRow::Corrupt, QueueRow::Item))
        .collect::<Vec<_>>();

    if as_json {
        return print_json(&QueueListing { summary, entries });
    }

    for line in format_queue_lines(&summary, &entries, now_millis()) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_queue_lines(summary: &QueueSummary, entries: &[QueueRow], now_ms: i64) -> Vec<String> {
    let mut lines = vec![format!(
        "{} pending, {} syncing, {} conflicted, {} failed, {} corrupt",
        summary.pending, summary.syncing, summary.conflicted, summary.failed, summary.corrupt
    )];
    if entries.is_empty() {
        lines.push("Queue is empty.".to_string());
        return lines;
    }

    lines.extend(entries.iter().map(|entry| match entry {
        QueueRow::Item(item) => {
            let mut line = format!(
                "{:>3} {:<6} {:<10} {:<6} {}/{}  {}  {}",
                item.priority_score,
                item.priority.as_str(),
                item.status.as_str(),
                item.action.as_str(),
                item.payload.entity_type(),
                item.entity_id,
                item.id,
                format_relative_time(item.created_at, now_ms),
            );
            if item.retry_count > 0 {
                line.push_str(&format!("  retries={}", item.retry_count));
            }
            if let Some(error) = &item.last_error {
                line.push_str(&format!("  last error: {error}"));
            }
            line
        }
        QueueRow::Corrupt(entry) => format!("CORRUPT {}: {}", entry.id, entry.reason),
    }));
    lines
}

pub async fn run_queue_rescore(as_json: bool, runtime: &SyncRuntime) -> Result<(), CliError> {
    let rescored = runtime.queue().recalculate_scores().await?;
    if as_json {
        return print_json(&rescored);
    }

    println!("Rescored {} pending mutation(s)", rescored.len());
    Ok(())
}
