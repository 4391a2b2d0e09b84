use fieldsync_core::models::SyncSession;
use fieldsync_core::orchestrator::{SyncCallbacks, SyncStatus};
use fieldsync_core::SyncRuntime;

use crate::commands::common::{emit, format_relative_time, format_sync_timestamp, now_millis};
use crate::error::CliError;

pub fn format_session_line(session: &SyncSession, now_ms: i64) -> String {
    let mut line = format!(
        "{} {:<9} {} ({}): {} processed, {} ok, {} failed, {} conflicts, {} bytes",
        session.id,
        session.status.as_str(),
        session.trigger,
        format_relative_time(session.started_at, now_ms),
        session.items_processed,
        session.items_succeeded,
        session.items_failed,
        session.conflicts_detected,
        session.bytes_synced,
    );
    if !session.errors.is_empty() {
        line.push_str(&format!(", {} error(s)", session.errors.len()));
    }
    line
}

pub fn format_session_detail(session: &SyncSession, now_ms: i64) -> Vec<String> {
    let mut lines = vec![format_session_line(session, now_ms)];
    lines.extend(session.errors.iter().map(|error| {
        format!(
            "  {:?} {}: {}",
            error.kind,
            error.item_id.as_deref().unwrap_or("session"),
            error.message
        )
    }));
    lines
}

pub fn format_status_lines(status: &SyncStatus, now_ms: i64) -> Vec<String> {
    let state = if status.is_running {
        "running"
    } else if status.is_paused {
        "paused"
    } else if status.is_enabled {
        "idle"
    } else {
        "disabled"
    };
    let mut lines = vec![format!(
        "Sync {state}, {}",
        if status.connectivity.is_online { "online" } else { "offline" }
    )];
    if let Some(reason) = &status.unavailable_reason {
        lines.push(format!("Unavailable: {reason}"));
    }
    if let Some(next) = status.next_scheduled_sync {
        lines.push(format!("Next scheduled sync: {}", format_sync_timestamp(next)));
    }
    let queue = &status.queue;
    lines.push(format!(
        "Queue: {} pending, {} syncing, {} conflicted, {} failed, {} corrupt",
        queue.pending, queue.syncing, queue.conflicted, queue.failed, queue.corrupt
    ));
    match &status.last_session {
        Some(session) => lines.push(format!("Last: {}", format_session_line(session, now_ms))),
        None => lines.push("No sync sessions yet.".to_string()),
    }
    lines
}

pub async fn run_sync(
    reason: &str,
    server_configured: bool,
    as_json: bool,
    runtime: &SyncRuntime,
) -> Result<(), CliError> {
    if !server_configured {
        return Err(CliError::SyncNotConfigured);
    }

    let response = runtime.api().trigger_sync(reason).await;
    emit(response, as_json, |session| {
        format_session_detail(session, now_millis())
    })
}

/// Run the background loop until Ctrl-C.
pub async fn run_sync_watch(server_configured: bool, runtime: &SyncRuntime) -> Result<(), CliError> {
    if !server_configured {
        return Err(CliError::SyncNotConfigured);
    }

    let orchestrator = runtime.orchestrator();
    let subscription = orchestrator.subscribe(SyncCallbacks {
        on_complete: Some(Box::new(|session| {
            println!("{}", format_session_line(session, now_millis()));
        })),
        on_error: Some(Box::new(|session, error| {
            tracing::warn!("Sync session {} failed: {error}", session.id);
        })),
        ..SyncCallbacks::default()
    });
    let sync_loop = orchestrator.start();
    sync_loop.trigger("startup");
    println!("Syncing every {}s; press Ctrl-C to stop", runtime.config().sync.interval_secs);

    tokio::signal::ctrl_c().await?;
    sync_loop.shutdown().await;
    subscription.unsubscribe();
    Ok(())
}

pub async fn run_sync_status(as_json: bool, runtime: &SyncRuntime) -> Result<(), CliError> {
    let response = runtime.api().sync_status().await;
    emit(response, as_json, |status| format_status_lines(status, now_millis()))
}

pub async fn run_sync_history(
    limit: usize,
    as_json: bool,
    runtime: &SyncRuntime,
) -> Result<(), CliError> {
    let response = runtime.api().sync_history(limit).await;
    emit(response, as_json, |sessions| {
        if sessions.is_empty() {
            return vec!["No sync sessions recorded.".to_string()];
        }
        let now = now_millis();
        sessions
            .iter()
            .map(|session| format_session_line(session, now))
            .collect()
    })
}
