//! Background synchronization.
//!
//! The orchestrator drains the durable queue in priority order whenever
//! connectivity, power and the operator allow it. Sessions never overlap:
//! a trigger that arrives while one is running is refused. The scheduling
//! loop started by [`SyncOrchestrator::start`] runs due [`Scheduler`] jobs
//! (periodic sync and update retries) and reacts to triggers and to the
//! device coming back online.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SyncSettings;
use crate::conflict::{ConflictEngine, DetectionInput};
use crate::connectivity::ConnectivityMonitor;
use crate::db::SqliteSessionRepository;
use crate::error::{Error, Result};
use crate::events::{Observers, Subscription};
use crate::exchange::{ExchangeAck, ExchangeError, ServerExchange};
use crate::models::{
    ConflictStatus, ConnectivityStatus, EntityType, Payload, QueueItem, QueueItemId,
    QueueStatus, ResolutionStrategy, SessionErrorKind, SessionId, SessionStatus, SyncSession,
};
use crate::scheduler::{ScheduledJob, Scheduler};
use crate::services::{QueueService, QueueSummary, Store};
use crate::tracker::UpdateTracker;

/// Services a session reads from and writes to
#[derive(Clone)]
pub struct SyncServices {
    pub store: Store,
    pub queue: QueueService,
    pub conflicts: ConflictEngine,
    pub tracker: UpdateTracker,
    pub scheduler: Scheduler,
}

/// Progress after one item of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub session_id: SessionId,
    /// Items processed so far, including unreadable entries
    pub completed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub remaining: usize,
    pub current_item: QueueItemId,
    /// Rolling-average estimate; absent until an item has been timed
    pub estimated_remaining_ms: Option<u64>,
}

/// Snapshot of the orchestrator for status displays
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub is_running: bool,
    pub is_paused: bool,
    pub is_enabled: bool,
    pub can_sync: bool,
    /// Why a sync would be refused right now
    pub unavailable_reason: Option<String>,
    pub connectivity: ConnectivityStatus,
    /// Next periodic session (Unix ms)
    pub next_scheduled_sync: Option<i64>,
    pub last_session: Option<SyncSession>,
    pub queue: QueueSummary,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Progress(SyncProgress),
    /// Fired for every closed session
    Completed(SyncSession),
    /// Fired before `Completed` when a session closes as failed
    Failed { session: SyncSession, error: String },
}

type ProgressHandler = Box<dyn Fn(&SyncProgress) + Send + Sync>;
type SessionHandler = Box<dyn Fn(&SyncSession) + Send + Sync>;
type SessionErrorHandler = Box<dyn Fn(&SyncSession, &str) + Send + Sync>;

#[derive(Default)]
pub struct SyncCallbacks {
    pub on_progress: Option<ProgressHandler>,
    pub on_complete: Option<SessionHandler>,
    pub on_error: Option<SessionErrorHandler>,
}

struct SyncState {
    running: AtomicBool,
    paused: AtomicBool,
    enabled: AtomicBool,
    last_session: Mutex<Option<SyncSession>>,
}

/// Clears the running flag when a session ends, however it ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    services: SyncServices,
    exchange: Arc<dyn ServerExchange>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    settings: SyncSettings,
    state: Arc<SyncState>,
    events: Observers<SyncEvent>,
}

impl SyncOrchestrator {
    pub fn new(
        services: SyncServices,
        exchange: Arc<dyn ServerExchange>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        settings: SyncSettings,
    ) -> Self {
        let enabled = settings.enabled;
        Self {
            services,
            exchange,
            connectivity,
            settings,
            state: Arc::new(SyncState {
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                enabled: AtomicBool::new(enabled),
                last_session: Mutex::new(None),
            }),
            events: Observers::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    /// Online, enabled, not paused, and on power or above the battery floor
    pub fn can_sync(&self) -> bool {
        self.unavailable_reason().is_none()
    }

    fn unavailable_reason(&self) -> Option<String> {
        let status = self.connectivity.current_status();
        if !self.is_enabled() {
            Some("sync is disabled".to_string())
        } else if self.is_paused() {
            Some("sync is paused".to_string())
        } else if !status.is_online {
            Some("device is offline".to_string())
        } else if !status.power_allows_sync(self.settings.min_battery_level) {
            Some(format!(
                "battery below {}% and not charging",
                self.settings.min_battery_level
            ))
        } else {
            None
        }
    }

    pub fn pause(&self) {
        if !self.state.paused.swap(true, Ordering::SeqCst) {
            tracing::info!("Sync paused");
        }
    }

    pub fn resume(&self) {
        if self.state.paused.swap(false, Ordering::SeqCst) {
            tracing::info!("Sync resumed");
        }
    }

    /// Turn periodic sync on or off; disabling also refuses manual triggers.
    pub fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            self.schedule_next_tick();
        } else {
            self.services.scheduler.cancel_job(ScheduledJob::SyncTick);
        }
        tracing::info!("Sync {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn subscribe(&self, callbacks: SyncCallbacks) -> Subscription {
        self.events.subscribe(move |event| match event {
            SyncEvent::Progress(progress) => {
                if let Some(handler) = &callbacks.on_progress {
                    handler(progress);
                }
            }
            SyncEvent::Completed(session) => {
                if let Some(handler) = &callbacks.on_complete {
                    handler(session);
                }
            }
            SyncEvent::Failed { session, error } => {
                if let Some(handler) = &callbacks.on_error {
                    handler(session, error);
                }
            }
        })
    }

    pub fn last_session(&self) -> Option<SyncSession> {
        self.state
            .last_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn get_status(&self) -> Result<SyncStatus> {
        let unavailable_reason = self.unavailable_reason();
        Ok(SyncStatus {
            is_running: self.is_running(),
            is_paused: self.is_paused(),
            is_enabled: self.is_enabled(),
            can_sync: unavailable_reason.is_none(),
            unavailable_reason,
            connectivity: self.connectivity.current_status(),
            next_scheduled_sync: self
                .services
                .scheduler
                .next_due_of(ScheduledJob::SyncTick),
            last_session: self.last_session(),
            queue: self.services.queue.summary().await?,
        })
    }

    /// Persisted sessions, newest first
    pub async fn recent_sessions(&self, limit: usize) -> Result<Vec<SyncSession>> {
        self.services
            .store
            .read(|conn| SqliteSessionRepository::new(conn).recent(limit))
            .await
    }

    /// Run a session now and wait for it to close.
    pub async fn trigger_immediate_sync(&self, reason: &str) -> Result<SyncSession> {
        if self.is_running() {
            return Err(Error::state("a sync session is already running"));
        }
        if let Some(reason) = self.unavailable_reason() {
            return Err(Error::SyncUnavailable(reason));
        }
        let Some(_guard) = self.begin() else {
            return Err(Error::state("a sync session is already running"));
        };
        Ok(self.run_session(reason).await)
    }

    /// Run a session on a background task.
    pub fn spawn_sync(&self, reason: impl Into<String>) -> JoinHandle<Result<SyncSession>> {
        let orchestrator = self.clone();
        let reason = reason.into();
        tokio::spawn(async move { orchestrator.trigger_immediate_sync(&reason).await })
    }

    /// Run every scheduler job that is due; returns the session a periodic
    /// tick ran, if any.
    pub async fn tick(&self) -> Result<Option<SyncSession>> {
        let mut session = None;
        for job in self.services.scheduler.take_due() {
            match job {
                ScheduledJob::RetryUpdate(update_id) => {
                    match self.services.tracker.retry(&update_id).await {
                        Ok(outcome) => {
                            tracing::debug!("Automatic retry of update {update_id}: {outcome:?}");
                        }
                        Err(Error::NotFound(_) | Error::State(_)) => {
                            tracing::debug!("Skipping automatic retry of settled update {update_id}");
                        }
                        Err(error) => return Err(error),
                    }
                }
                ScheduledJob::SyncTick => {
                    self.schedule_next_tick();
                    if session.is_some() {
                        continue;
                    }
                    if let Some(reason) = self.unavailable_reason() {
                        tracing::debug!("Skipping scheduled sync: {reason}");
                        continue;
                    }
                    if let Some(_guard) = self.begin() {
                        session = Some(self.run_session("scheduled").await);
                    }
                }
            }
        }
        Ok(session)
    }

    /// Apply finished resolutions to the queue items waiting on them.
    ///
    /// Local and merged data is queued again under the resolved conflict's id;
    /// server data replaces the local entity and the mutation is dropped.
    pub async fn settle_resolved_conflicts(&self) -> Result<usize> {
        let waiting = self
            .services
            .queue
            .list_all()
            .await?
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|item| item.status == QueueStatus::Conflicted);

        let mut settled = 0;
        for mut item in waiting {
            let Some(conflict_id) = item.conflict_id else {
                continue;
            };
            let conflict = match self.services.conflicts.get_conflict(&conflict_id).await {
                Ok(conflict) => conflict,
                Err(Error::NotFound(_)) => {
                    tracing::warn!("Queue item {} references missing conflict {conflict_id}", item.id);
                    continue;
                }
                Err(error) => return Err(error),
            };
            let Some(resolution) = conflict.resolution.filter(|_| conflict.status == ConflictStatus::Resolved) else {
                continue;
            };

            match resolution.strategy {
                ResolutionStrategy::ServerWins => {
                    self.services.queue.remove(&item.id).await?;
                    self.services
                        .tracker
                        .discard_after_resolution(&item.id, &resolution.final_data)
                        .await?;
                }
                ResolutionStrategy::LocalWins | ResolutionStrategy::Manual => {
                    let payload = match Payload::from_json(item.entity_type(), resolution.final_data.clone()) {
                        Ok(payload) => payload,
                        Err(error) => {
                            tracing::warn!(
                                "Resolved data for queue item {} does not fit a {} payload: {error}",
                                item.id,
                                item.entity_type()
                            );
                            item.status = QueueStatus::Failed;
                            item.last_error = Some(format!("resolved data rejected: {error}"));
                            self.services.queue.save(&item).await?;
                            continue;
                        }
                    };
                    self.services.queue.replace_payload(&item.id, &payload).await?;
                    self.services
                        .queue
                        .mark_status(&item.id, QueueStatus::Pending)
                        .await?;
                    self.services
                        .tracker
                        .requeue_after_resolution(&item.id, &resolution.final_data)
                        .await?;
                }
            }
            tracing::info!(
                "Settled queue item {} after {} resolution of conflict {conflict_id}",
                item.id,
                resolution.strategy
            );
            settled += 1;
        }
        Ok(settled)
    }

    /// Spawn the scheduling loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> SyncLoop {
        let (commands, receiver) = mpsc::unbounded_channel();
        if self.services.scheduler.next_due_of(ScheduledJob::SyncTick).is_none() {
            self.schedule_next_tick();
        }

        let listener = commands.clone();
        let was_online = AtomicBool::new(self.connectivity.current_status().is_online);
        let subscription = self.connectivity.on_change(Box::new(move |status| {
            let previously = was_online.swap(status.is_online, Ordering::SeqCst);
            if status.is_online
                && !previously
                && listener.send(LoopCommand::ConnectivityRestored).is_err()
            {
                tracing::debug!("Sync loop already stopped");
            }
        }));

        let orchestrator = self.clone();
        let task = tokio::spawn(async move { orchestrator.run_loop(receiver).await });
        SyncLoop {
            commands,
            task,
            subscription,
        }
    }

    async fn run_loop(self, mut commands: mpsc::UnboundedReceiver<LoopCommand>) {
        tracing::info!("Sync loop started");
        loop {
            let wait = self.services.scheduler.time_until_next();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(LoopCommand::Trigger(reason)) => self.run_if_possible(&reason).await,
                    Some(LoopCommand::ConnectivityRestored) => {
                        self.run_if_possible("connectivity_restored").await;
                    }
                    Some(LoopCommand::Shutdown) | None => break,
                },
                () = self.services.scheduler.changed() => {}
                () = sleep_until_due(wait) => {
                    if let Err(error) = self.tick().await {
                        tracing::warn!("Scheduled sync work failed: {error}");
                    }
                }
            }
        }
        tracing::info!("Sync loop stopped");
    }

    async fn run_if_possible(&self, reason: &str) {
        match self.trigger_immediate_sync(reason).await {
            Ok(_) => {}
            Err(Error::SyncUnavailable(why) | Error::State(why)) => {
                tracing::debug!("Sync trigger '{reason}' ignored: {why}");
            }
            Err(error) => tracing::warn!("Sync trigger '{reason}' failed: {error}"),
        }
    }

    fn schedule_next_tick(&self) {
        if !self.is_enabled() {
            return;
        }
        let scheduler = &self.services.scheduler;
        scheduler.cancel_job(ScheduledJob::SyncTick);
        scheduler.schedule_after(self.settings.interval(), ScheduledJob::SyncTick);
    }

    fn begin(&self) -> Option<RunningGuard<'_>> {
        self.state
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunningGuard(&self.state.running))
    }

    fn now(&self) -> i64 {
        self.services.scheduler.now_millis()
    }

    async fn run_session(&self, trigger: &str) -> SyncSession {
        let mut session = SyncSession::start(trigger, self.now());
        tracing::info!("Sync session {} started ({trigger})", session.id);

        let status = match self.drain_queue(&mut session).await {
            Ok(status) => status,
            Err(error) => {
                tracing::error!("Sync session {} aborted: {error}", session.id);
                session.record_error(None, SessionErrorKind::Fatal, error.to_string(), self.now());
                SessionStatus::Failed
            }
        };
        session.close(status, self.now());

        let saved = self
            .services
            .store
            .write(|conn| SqliteSessionRepository::new(conn).save(&session))
            .await;
        if let Err(error) = saved {
            tracing::warn!("Failed to record sync session {}: {error}", session.id);
        }
        *self
            .state
            .last_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(session.clone());

        tracing::info!(
            "Sync session {} finished {}: {} succeeded, {} failed, {} conflicts, {} bytes",
            session.id,
            session.status,
            session.items_succeeded,
            session.items_failed,
            session.conflicts_detected,
            session.bytes_synced
        );
        if status == SessionStatus::Failed {
            let error = session
                .errors
                .last()
                .map_or_else(|| "sync session failed".to_string(), |error| error.message.clone());
            self.events.emit(&SyncEvent::Failed {
                session: session.clone(),
                error,
            });
        }
        self.events.emit(&SyncEvent::Completed(session.clone()));
        session
    }

    async fn drain_queue(&self, session: &mut SyncSession) -> Result<SessionStatus> {
        // Only one session runs at a time, so anything still SYNCING was cut off.
        self.services.queue.release_interrupted().await?;
        self.settle_resolved_conflicts().await?;

        for entry in self.services.queue.list_all().await? {
            if let Err(corrupt) = entry {
                tracing::warn!("Skipping unreadable queue entry {}: {}", corrupt.id, corrupt.reason);
                session.items_processed += 1;
                session.items_failed += 1;
                session.record_error(
                    Some(corrupt.id),
                    SessionErrorKind::Fatal,
                    format!("unreadable queue entry: {}", corrupt.reason),
                    self.now(),
                );
            }
        }

        let mut remaining = VecDeque::from(self.services.queue.recalculate_scores().await?);
        let deadline = session
            .started_at
            .saturating_add(duration_millis(self.settings.session_timeout()));
        let mut timings = DurationWindow::new(self.settings.duration_window);

        while !remaining.is_empty() {
            if self.is_paused() {
                tracing::info!("Sync session {} paused with {} items left", session.id, remaining.len());
                return Ok(SessionStatus::Paused);
            }
            if !self.connectivity.current_status().is_online {
                session.record_error(
                    None,
                    SessionErrorKind::Connectivity,
                    "connectivity lost during sync",
                    self.now(),
                );
                return Ok(SessionStatus::Failed);
            }
            if self.now() >= deadline {
                tracing::warn!("Sync session {} ran past its deadline", session.id);
                return Ok(SessionStatus::TimedOut);
            }

            let batch = next_batch(&mut remaining, self.settings.max_parallel_exchanges);
            let results = join_all(batch.iter().map(|item| self.submit(item))).await;

            let mut left = remaining.len() + batch.len();
            for (item, result) in batch.into_iter().zip(results) {
                let (outcome, elapsed) = result?;
                let item_id = item.id;
                self.record_outcome(session, item, outcome).await?;

                left -= 1;
                timings.record(elapsed);
                self.events.emit(&SyncEvent::Progress(SyncProgress {
                    session_id: session.id,
                    completed: session.items_processed,
                    succeeded: session.items_succeeded,
                    failed: session.items_failed,
                    remaining: left,
                    current_item: item_id,
                    estimated_remaining_ms: timings
                        .estimate(left)
                        .map(|estimate| u64::try_from(estimate.as_millis()).unwrap_or(u64::MAX)),
                }));
            }
        }
        Ok(SessionStatus::Completed)
    }

    async fn submit(
        &self,
        item: &QueueItem,
    ) -> Result<(std::result::Result<ExchangeAck, ExchangeError>, Duration)> {
        self.services
            .queue
            .mark_status(&item.id, QueueStatus::Syncing)
            .await?;

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.settings.exchange_timeout(), self.exchange.submit(item))
            .await
            .unwrap_or(Err(ExchangeError::Timeout));
        Ok((outcome, started.elapsed()))
    }

    async fn record_outcome(
        &self,
        session: &mut SyncSession,
        mut item: QueueItem,
        outcome: std::result::Result<ExchangeAck, ExchangeError>,
    ) -> Result<()> {
        session.items_processed += 1;
        let services = &self.services;

        match outcome {
            Ok(_) => {
                services.queue.remove(&item.id).await?;
                services.tracker.confirm_queue_item(&item.id).await?;
                session.items_succeeded += 1;
                session.bytes_synced += item.payload_size();
                tracing::debug!("Synced {} {} ({})", item.entity_type(), item.entity_id, item.id);
            }
            Err(ExchangeError::VersionConflict {
                server_version,
                server_modified_at,
            }) => {
                let conflict = services
                    .conflicts
                    .detect(DetectionInput {
                        entity_id: item.entity_id.clone(),
                        entity_type: item.entity_type(),
                        local_version: item.local_snapshot(),
                        server_version,
                        local_modified_at: Some(item.created_at),
                        server_modified_at,
                    })
                    .await?;

                let message = format!("version conflict {} ({})", conflict.id, conflict.severity);
                item.status = QueueStatus::Conflicted;
                item.conflict_id = Some(conflict.id);
                item.last_error = Some(message.clone());
                services.queue.save(&item).await?;
                services
                    .tracker
                    .fail_queue_item(&item.id, &message, false)
                    .await?;

                session.conflicts_detected += 1;
                session.record_error(Some(item.id.as_str()), SessionErrorKind::Conflict, message, self.now());
            }
            Err(error) => {
                let message = error.to_string();
                item.retry_count += 1;
                item.last_error = Some(message.clone());
                if item.retry_count >= self.settings.max_retries {
                    tracing::warn!(
                        "Queue item {} failed after {} attempts: {message}",
                        item.id,
                        item.retry_count
                    );
                    item.status = QueueStatus::Failed;
                    services.queue.save(&item).await?;
                    services
                        .tracker
                        .fail_queue_item(&item.id, &message, true)
                        .await?;
                } else {
                    tracing::debug!("Queue item {} will be retried: {message}", item.id);
                    item.status = QueueStatus::Pending;
                    services.queue.save(&item).await?;
                }

                session.items_failed += 1;
                session.record_error(Some(item.id.as_str()), SessionErrorKind::Transient, message, self.now());
            }
        }
        Ok(())
    }
}

enum LoopCommand {
    Trigger(String),
    ConnectivityRestored,
    Shutdown,
}

/// Handle to the running scheduling loop
pub struct SyncLoop {
    commands: mpsc::UnboundedSender<LoopCommand>,
    task: JoinHandle<()>,
    subscription: Subscription,
}

impl SyncLoop {
    /// Ask the loop to run a session; false once the loop has stopped.
    pub fn trigger(&self, reason: impl Into<String>) -> bool {
        self.commands
            .send(LoopCommand::Trigger(reason.into()))
            .is_ok()
    }

    /// Stop the loop after the current session, if any, and wait for it.
    pub async fn shutdown(self) {
        let Self {
            commands,
            task,
            subscription,
        } = self;
        subscription.unsubscribe();
        if commands.send(LoopCommand::Shutdown).is_err() {
            tracing::debug!("Sync loop already stopped");
        }
        if let Err(error) = task.await {
            tracing::warn!("Sync loop ended abnormally: {error}");
        }
    }
}

async fn sleep_until_due(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

/// Take the longest prefix of `remaining` that holds at most `limit` items
/// and no entity twice.
fn next_batch(remaining: &mut VecDeque<QueueItem>, limit: usize) -> Vec<QueueItem> {
    let mut entities: HashSet<(EntityType, String)> = HashSet::new();
    let mut batch = Vec::new();
    while batch.len() < limit.max(1) {
        let Some(next) = remaining.front() else {
            break;
        };
        if !entities.insert((next.entity_type(), next.entity_id.clone())) {
            break;
        }
        if let Some(item) = remaining.pop_front() {
            batch.push(item);
        }
    }
    batch
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Recent item durations for the time-remaining estimate
struct DurationWindow {
    capacity: usize,
    samples: VecDeque<Duration>,
}

impl DurationWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::new(),
        }
    }

    fn record(&mut self, elapsed: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
    }

    fn estimate(&self, remaining: usize) -> Option<Duration> {
        let count = u32::try_from(self.samples.len()).ok().filter(|count| *count > 0)?;
        let average = self.samples.iter().sum::<Duration>() / count;
        Some(average.saturating_mul(u32::try_from(remaining).unwrap_or(u32::MAX)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::conflict::ResolveRequest;
    use crate::connectivity::ManualConnectivity;
    use crate::models::{PriorityTier, QueueAction, UpdateStatus};
    use crate::runtime::SyncRuntime;
    use crate::scheduler::{Clock, ManualClock};
    use crate::test_support::ScriptedExchange;
    use crate::tracker::ApplyRequest;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    const START: i64 = 1_700_000_000_000;

    struct Harness {
        clock: ManualClock,
        network: ManualConnectivity,
        server: Arc<ScriptedExchange>,
        runtime: SyncRuntime,
    }

    impl Harness {
        fn orchestrator(&self) -> &SyncOrchestrator {
            self.runtime.orchestrator()
        }

        async fn record(&self, entity_id: &str, kind: &str, tier: PriorityTier) -> crate::models::UpdateId {
            self.runtime
                .tracker()
                .apply(ApplyRequest {
                    entity_id: entity_id.to_string(),
                    operation: QueueAction::Update,
                    payload: Payload::from_json(
                        EntityType::Assessment,
                        json!({ "assessment_type": kind, "notes": format!("{kind} check") }),
                    )
                    .unwrap(),
                    priority: tier,
                    previous_state: None,
                })
                .await
                .unwrap()
        }

        async fn queued(&self) -> Vec<QueueItem> {
            self.runtime
                .queue()
                .list_all()
                .await
                .unwrap()
                .into_iter()
                .map(std::result::Result::unwrap)
                .collect()
        }
    }

    fn harness_with(config: CoreConfig, server: Arc<ScriptedExchange>) -> Harness {
        let clock = ManualClock::new(START);
        let network = ManualConnectivity::default();
        let runtime = SyncRuntime::builder(config)
            .store(Store::open_in_memory().unwrap())
            .clock(Arc::new(clock.clone()))
            .connectivity(Arc::new(network.clone()))
            .exchange(server.clone())
            .build()
            .unwrap();
        Harness {
            clock,
            network,
            server,
            runtime,
        }
    }

    fn harness() -> Harness {
        harness_with(CoreConfig::default(), ScriptedExchange::new())
    }

    fn conflict_reply(server_version: Value) -> std::result::Result<ExchangeAck, ExchangeError> {
        Err(ExchangeError::VersionConflict {
            server_version,
            server_modified_at: Some(START + 1),
        })
    }

    #[tokio::test]
    async fn synced_items_leave_the_queue_and_confirm_their_update() {
        let h = harness();
        let update = h.record("site-1", "SHELTER", PriorityTier::Normal).await;

        let session = h.orchestrator().trigger_immediate_sync("manual").await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.items_processed, 1);
        assert_eq!(session.items_succeeded, 1);
        assert!(session.bytes_synced > 0);
        assert!(session.is_closed());

        assert!(h.queued().await.is_empty());
        let update = h.runtime.tracker().get(&update).await.unwrap();
        assert_eq!(update.status, UpdateStatus::Confirmed);

        let history = h.orchestrator().recent_sessions(5).await.unwrap();
        assert_eq!(history, vec![session.clone()]);
        assert_eq!(h.orchestrator().last_session(), Some(session));
    }

    #[tokio::test]
    async fn items_are_sent_in_priority_order() {
        let h = harness();
        h.record("food-1", "FOOD", PriorityTier::Low).await;
        h.record("clinic-1", "HEALTH", PriorityTier::High).await;
        h.record("shelter-1", "SHELTER", PriorityTier::Normal).await;

        h.orchestrator().trigger_immediate_sync("manual").await.unwrap();
        assert_eq!(
            h.server.submitted_entities(),
            vec!["clinic-1", "shelter-1", "food-1"]
        );
    }

    #[tokio::test]
    async fn refuses_to_start_when_sync_is_not_possible() {
        let h = harness();
        h.network.set_online(false);
        assert!(matches!(
            h.orchestrator().trigger_immediate_sync("manual").await,
            Err(Error::SyncUnavailable(_))
        ));

        h.network
            .set_status(ConnectivityStatus::online().with_battery(5, false));
        let status = h.orchestrator().get_status().await.unwrap();
        assert!(!status.can_sync);
        assert!(status.unavailable_reason.unwrap().contains("battery"));

        h.network
            .set_status(ConnectivityStatus::online().with_battery(5, true));
        h.orchestrator().pause();
        assert!(matches!(
            h.orchestrator().trigger_immediate_sync("manual").await,
            Err(Error::SyncUnavailable(_))
        ));

        h.orchestrator().resume();
        h.orchestrator().set_enabled(false);
        assert!(!h.orchestrator().can_sync());
        h.orchestrator().set_enabled(true);
        assert!(h.orchestrator().can_sync());
        assert!(h.server.submissions().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_stop_at_max_retries() {
        let mut config = CoreConfig::default();
        config.sync.max_retries = 2;
        config.retry.auto_retry = false;
        let h = harness_with(config, ScriptedExchange::new());
        let update = h.record("site-1", "WASH", PriorityTier::Normal).await;
        for _ in 0..2 {
            h.server
                .respond("site-1", Err(ExchangeError::Transport("bad gateway".into())));
        }

        let first = h.orchestrator().trigger_immediate_sync("manual").await.unwrap();
        assert_eq!(first.items_failed, 1);
        assert_eq!(first.errors[0].kind, SessionErrorKind::Transient);
        let item = h.queued().await.remove(0);
        assert_eq!((item.status, item.retry_count), (QueueStatus::Pending, 1));

        h.orchestrator().trigger_immediate_sync("manual").await.unwrap();
        let item = h.queued().await.remove(0);
        assert_eq!((item.status, item.retry_count), (QueueStatus::Failed, 2));
        assert_eq!(
            h.runtime.tracker().get(&update).await.unwrap().status,
            UpdateStatus::Failed
        );

        let third = h.orchestrator().trigger_immediate_sync("manual").await.unwrap();
        assert_eq!(third.items_processed, 0);
        assert_eq!(h.server.submissions().len(), 2);
    }

    #[tokio::test]
    async fn slow_exchanges_time_out_as_transient_failures() {
        let mut config = CoreConfig::default();
        config.sync.exchange_timeout_secs = 1;
        let h = harness_with(config, ScriptedExchange::new());
        h.record("site-1", "WASH", PriorityTier::Normal).await;
        h.server.hang("site-1");

        let session = h.orchestrator().trigger_immediate_sync("manual").await.unwrap();
        assert_eq!(session.items_failed, 1);
        assert_eq!(session.errors[0].message, ExchangeError::Timeout.to_string());

        let item = h.queued().await.remove(0);
        assert_eq!((item.status, item.retry_count), (QueueStatus::Pending, 1));
    }

    #[tokio::test]
    async fn version_conflicts_wait_for_resolution_then_resend() {
        let h = harness();
        let update = h.record("clinic-7", "HEALTH", PriorityTier::High).await;
        h.server.respond(
            "clinic-7",
            conflict_reply(json!({ "assessment_type": "HEALTH", "notes": "server copy" })),
        );

        let session = h.orchestrator().trigger_immediate_sync("manual").await.unwrap();
        assert_eq!(session.conflicts_detected, 1);
        assert_eq!(session.errors[0].kind, SessionErrorKind::Conflict);

        let item = h.queued().await.remove(0);
        assert_eq!(item.status, QueueStatus::Conflicted);
        let conflict_id = item.conflict_id.unwrap();
        assert_eq!(
            h.runtime.tracker().get(&update).await.unwrap().status,
            UpdateStatus::Failed
        );

        // Still unresolved: nothing is resent.
        h.orchestrator().trigger_immediate_sync("manual").await.unwrap();
        assert_eq!(h.server.submissions().len(), 1);

        let merged = json!({ "assessment_type": "HEALTH", "notes": "merged copy" });
        h.runtime
            .conflicts()
            .resolve(ResolveRequest {
                conflict_id,
                strategy: ResolutionStrategy::Manual,
                merged_data: Some(merged.clone()),
                justification: "Kept both observations".to_string(),
                resolved_by: "coordinator-1".to_string(),
            })
            .await
            .unwrap();

        let session = h.orchestrator().trigger_immediate_sync("manual").await.unwrap();
        assert_eq!(session.items_succeeded, 1);
        let resent = h.server.submissions().pop().unwrap();
        assert_eq!(resent.conflict_id, Some(conflict_id));
        assert_eq!(resent.payload.to_json(), merged);
        assert!(h.queued().await.is_empty());

        assert_eq!(
            h.runtime.tracker().get(&update).await.unwrap().status,
            UpdateStatus::Confirmed
        );
        let entity = h
            .runtime
            .tracker()
            .entity_state(EntityType::Assessment, "clinic-7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.data, merged);
    }

    #[tokio::test]
    async fn conflicted_updates_cannot_be_retried_or_rolled_back() {
        let h = harness();
        let update = h.record("clinic-8", "HEALTH", PriorityTier::High).await;
        h.server.respond(
            "clinic-8",
            conflict_reply(json!({ "assessment_type": "HEALTH", "notes": "server copy" })),
        );
        h.orchestrator().trigger_immediate_sync("manual").await.unwrap();

        let tracker = h.runtime.tracker();
        assert!(matches!(tracker.retry(&update).await, Err(Error::State(_))));
        assert!(matches!(tracker.rollback(&update).await, Err(Error::State(_))));
        assert_eq!(tracker.rollback_all_failed().await.unwrap(), 0);

        h.orchestrator().trigger_immediate_sync("manual").await.unwrap();
        assert_eq!(h.server.submissions().len(), 1);
        let item = h.queued().await.remove(0);
        assert_eq!(item.status, QueueStatus::Conflicted);
        assert_eq!(tracker.get(&update).await.unwrap().status, UpdateStatus::Failed);
        let pending = h.runtime.conflicts().stats().await.unwrap().pending;
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn items_left_syncing_are_sent_by_the_next_session() {
        let h = harness();
        let update = h.record("site-9", "WASH", PriorityTier::Normal).await;
        let item = h.queued().await.remove(0);
        h.runtime
            .queue()
            .mark_status(&item.id, QueueStatus::Syncing)
            .await
            .unwrap();

        let session = h.orchestrator().trigger_immediate_sync("manual").await.unwrap();
        assert_eq!(session.items_succeeded, 1);
        assert_eq!(h.server.submitted_entities(), vec!["site-9"]);
        assert!(h.queued().await.is_empty());
        assert_eq!(
            h.runtime.tracker().get(&update).await.unwrap().status,
            UpdateStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn server_wins_drops_the_local_mutation() {
        let h = harness();
        let update = h.record("site-3", "FOOD", PriorityTier::Normal).await;
        let server_copy = json!({ "assessment_type": "FOOD", "notes": "server copy" });
        h.server.respond("site-3", conflict_reply(server_copy.clone()));
        h.orchestrator().trigger_immediate_sync("manual").await.unwrap();

        let conflict_id = h.queued().await[0].conflict_id.unwrap();
        h.runtime
            .conflicts()
            .resolve(ResolveRequest {
                conflict_id,
                strategy: ResolutionStrategy::ServerWins,
                merged_data: None,
                justification: "Server data is newer".to_string(),
                resolved_by: "coordinator-1".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(h.orchestrator().settle_resolved_conflicts().await.unwrap(), 1);
        assert!(h.queued().await.is_empty());
        assert_eq!(
            h.runtime.tracker().get(&update).await.unwrap().status,
            UpdateStatus::RolledBack
        );
        let entity = h
            .runtime
            .tracker()
            .entity_state(EntityType::Assessment, "site-3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.data, server_copy);
    }

    #[tokio::test]
    async fn unreadable_entries_are_reported_and_skipped() {
        let h = harness();
        h.record("site-1", "WASH", PriorityTier::Normal).await;
        h.record("site-2", "WASH", PriorityTier::Normal).await;
        let broken = h.queued().await[0].id;
        h.runtime
            .store()
            .write(|conn| {
                conn.execute(
                    "UPDATE queue_items SET payload = 'not json' WHERE id = ?",
                    [broken.as_str()],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let session = h.orchestrator().trigger_immediate_sync("manual").await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.items_succeeded, 1);
        assert_eq!(session.items_failed, 1);
        assert_eq!(session.errors[0].kind, SessionErrorKind::Fatal);
        assert_eq!(session.errors[0].item_id, Some(broken.as_str()));
    }

    #[tokio::test]
    async fn pause_takes_effect_at_the_next_item() {
        let h = harness();
        h.record("site-1", "WASH", PriorityTier::High).await;
        h.record("site-2", "WASH", PriorityTier::Low).await;

        let orchestrator = h.orchestrator().clone();
        let progress = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&progress);
        let subscription = h.orchestrator().subscribe(SyncCallbacks {
            on_progress: Some(Box::new(move |update| {
                seen.fetch_add(1, Ordering::SeqCst);
                assert_eq!(update.remaining, 1);
                orchestrator.pause();
            })),
            ..SyncCallbacks::default()
        });

        let session = h.orchestrator().trigger_immediate_sync("manual").await.unwrap();
        assert_eq!(session.status, SessionStatus::Paused);
        assert_eq!(progress.load(Ordering::SeqCst), 1);
        assert_eq!(h.server.submitted_entities(), vec!["site-1"]);
        assert_eq!(h.queued().await.len(), 1);
        subscription.unsubscribe();
    }

    #[tokio::test]
    async fn losing_connectivity_fails_the_session() {
        let h = harness();
        h.record("site-1", "WASH", PriorityTier::High).await;
        h.record("site-2", "WASH", PriorityTier::Low).await;

        let network = h.network.clone();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let completed = Arc::new(AtomicUsize::new(0));
        let closed = Arc::clone(&completed);
        let _subscription = h.orchestrator().subscribe(SyncCallbacks {
            on_progress: Some(Box::new(move |_| network.set_online(false))),
            on_complete: Some(Box::new(move |_| {
                closed.fetch_add(1, Ordering::SeqCst);
            })),
            on_error: Some(Box::new(move |_, error| {
                sink.lock().unwrap().push(error.to_string());
            })),
        });

        let session = h.orchestrator().trigger_immediate_sync("manual").await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(
            errors.lock().unwrap().clone(),
            vec!["connectivity lost during sync".to_string()]
        );
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(h.queued().await.len(), 1);
        assert_eq!(h.queued().await[0].status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn independent_entities_are_exchanged_concurrently() {
        let mut config = CoreConfig::default();
        config.sync.max_parallel_exchanges = 2;
        let h = harness_with(config, ScriptedExchange::with_latency(Duration::from_millis(20)));
        for site in ["site-1", "site-2", "site-3", "site-4"] {
            h.record(site, "WASH", PriorityTier::Normal).await;
        }

        let session = h.orchestrator().trigger_immediate_sync("manual").await.unwrap();
        assert_eq!(session.items_succeeded, 4);
        assert_eq!(h.server.max_in_flight(), 2);
    }

    #[tokio::test]
    async fn one_entity_is_never_exchanged_twice_at_once() {
        let mut config = CoreConfig::default();
        config.sync.max_parallel_exchanges = 4;
        let h = harness_with(config, ScriptedExchange::with_latency(Duration::from_millis(10)));
        h.record("site-1", "WASH", PriorityTier::Normal).await;
        h.record("site-1", "WASH", PriorityTier::Normal).await;
        h.record("site-1", "WASH", PriorityTier::Normal).await;

        let session = h.orchestrator().trigger_immediate_sync("manual").await.unwrap();
        assert_eq!(session.items_succeeded, 3);
        assert_eq!(h.server.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn overlapping_triggers_are_refused() {
        let mut config = CoreConfig::default();
        config.sync.exchange_timeout_secs = 1;
        let h = harness_with(config, ScriptedExchange::new());
        h.record("site-1", "WASH", PriorityTier::Normal).await;
        h.server.hang("site-1");

        let background = h.orchestrator().spawn_sync("manual");
        while !h.orchestrator().is_running() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            h.orchestrator().trigger_immediate_sync("manual").await,
            Err(Error::State(_))
        ));
        let session = background.await.unwrap().unwrap();
        assert_eq!(session.items_failed, 1);
        assert!(!h.orchestrator().is_running());
    }

    #[tokio::test]
    async fn tick_runs_periodic_sync_and_automatic_retries() {
        let mut config = CoreConfig::default();
        config.sync.max_retries = 1;
        let h = harness_with(config, ScriptedExchange::new());
        let update = h.record("site-1", "WASH", PriorityTier::Normal).await;
        h.server
            .respond("site-1", Err(ExchangeError::Transport("bad gateway".into())));

        let interval = h.runtime.config().sync.interval();
        h.orchestrator().set_enabled(true);
        assert!(h.orchestrator().tick().await.unwrap().is_none());

        h.clock.advance(interval);
        let session = h.orchestrator().tick().await.unwrap().unwrap();
        assert_eq!(session.trigger, "scheduled");
        assert_eq!(
            h.runtime.tracker().get(&update).await.unwrap().status,
            UpdateStatus::Failed
        );
        let next = h.orchestrator().get_status().await.unwrap().next_scheduled_sync;
        assert_eq!(next, Some(h.clock.now_millis() + duration_millis(interval)));

        // Automatic retry after the first backoff step.
        h.clock.advance(Duration::from_secs(5));
        assert!(h.orchestrator().tick().await.unwrap().is_none());
        assert_eq!(
            h.runtime.tracker().get(&update).await.unwrap().status,
            UpdateStatus::Pending
        );
        assert_eq!(h.queued().await[0].status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn loop_syncs_when_connectivity_returns() {
        let h = harness();
        h.network.set_online(false);
        h.record("site-1", "WASH", PriorityTier::Normal).await;

        let sync_loop = h.orchestrator().start();
        h.network.set_online(true);

        let history = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let sessions = h.orchestrator().recent_sessions(1).await.unwrap();
                if !sessions.is_empty() {
                    return sessions;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(history[0].trigger, "connectivity_restored");
        assert_eq!(history[0].items_succeeded, 1);

        assert!(sync_loop.trigger("manual"));
        sync_loop.shutdown().await;
    }

    #[test]
    fn batches_are_contiguous_and_entity_unique() {
        let item = |entity: &str| {
            QueueItem::new_at(
                entity,
                QueueAction::Update,
                Payload::from_json(EntityType::Incident, json!({ "name": entity })).unwrap(),
                PriorityTier::Normal,
                START,
            )
        };
        let mut remaining = VecDeque::from(vec![item("a"), item("b"), item("a"), item("c")]);

        let first = next_batch(&mut remaining, 3);
        assert_eq!(
            first.iter().map(|item| item.entity_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        let second = next_batch(&mut remaining, 3);
        assert_eq!(
            second.iter().map(|item| item.entity_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
        assert!(remaining.is_empty());
    }

    #[test]
    fn estimate_uses_the_rolling_average() {
        let mut window = DurationWindow::new(2);
        assert_eq!(window.estimate(3), None);
        window.record(Duration::from_millis(100));
        window.record(Duration::from_millis(300));
        window.record(Duration::from_millis(500));
        assert_eq!(window.estimate(3), Some(Duration::from_millis(1200)));
        assert_eq!(window.estimate(0), Some(Duration::ZERO));
    }
}
