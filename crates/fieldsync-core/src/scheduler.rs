//! Clock abstraction and the single timer service used for periodic sync and
//! update retries.
//!
//! Jobs are plain data; the orchestrator drains due jobs with
//! [`Scheduler::take_due`] and dispatches them. Tests drive time with
//! [`ManualClock`] instead of sleeping.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::models::UpdateId;

/// Source of the current time in Unix milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        crate::util::unix_millis_now()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_millis)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Work the scheduler can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledJob {
    /// Periodic sync session
    SyncTick,
    /// Automatic retry of a failed optimistic update
    RetryUpdate(UpdateId),
}

/// Handle used to cancel a scheduled job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Default)]
struct Timers {
    next_id: u64,
    by_due: BTreeMap<(i64, u64), ScheduledJob>,
    due_of: HashMap<u64, i64>,
}

/// Timer service shared by the orchestrator and the update tracker
#[derive(Clone)]
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    timers: Arc<Mutex<Timers>>,
    changed: Arc<Notify>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            timers: Arc::new(Mutex::new(Timers::default())),
            changed: Arc::new(Notify::new()),
        }
    }

    /// The clock jobs are scheduled against
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Schedule `job` to run once `delay` has elapsed.
    pub fn schedule_after(&self, delay: Duration, job: ScheduledJob) -> TimerId {
        let delay = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        self.schedule_at(self.now_millis().saturating_add(delay), job)
    }

    /// Schedule `job` at an absolute time (Unix ms).
    pub fn schedule_at(&self, due_at: i64, job: ScheduledJob) -> TimerId {
        let id = {
            let mut timers = self.lock();
            let id = timers.next_id;
            timers.next_id += 1;
            timers.by_due.insert((due_at, id), job);
            timers.due_of.insert(id, due_at);
            id
        };
        self.changed.notify_one();
        TimerId(id)
    }

    /// Cancel a timer; returns whether it was still scheduled.
    pub fn cancel(&self, timer: TimerId) -> bool {
        let mut timers = self.lock();
        let Some(due_at) = timers.due_of.remove(&timer.0) else {
            return false;
        };
        timers.by_due.remove(&(due_at, timer.0)).is_some()
    }

    /// Cancel every scheduled occurrence of `job`; returns how many were removed.
    pub fn cancel_job(&self, job: ScheduledJob) -> usize {
        let mut timers = self.lock();
        let keys = timers
            .by_due
            .iter()
            .filter(|(_, scheduled)| **scheduled == job)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();
        for key in &keys {
            timers.by_due.remove(key);
            timers.due_of.remove(&key.1);
        }
        keys.len()
    }

    /// Earliest due time, if anything is scheduled
    pub fn next_due(&self) -> Option<i64> {
        self.lock().by_due.keys().next().map(|(due_at, _)| *due_at)
    }

    /// Due time of the next occurrence of `job`
    pub fn next_due_of(&self, job: ScheduledJob) -> Option<i64> {
        self.lock()
            .by_due
            .iter()
            .find(|(_, scheduled)| **scheduled == job)
            .map(|((due_at, _), _)| *due_at)
    }

    /// Remove and return every job due at the current clock reading, oldest first.
    pub fn take_due(&self) -> Vec<ScheduledJob> {
        let now = self.now_millis();
        let mut timers = self.lock();
        let pending = timers.by_due.split_off(&(now.saturating_add(1), 0));
        let due = std::mem::replace(&mut timers.by_due, pending);
        for (_, id) in due.keys() {
            timers.due_of.remove(id);
        }
        due.into_values().collect()
    }

    /// Time until the next job is due, zero when one is already due.
    pub fn time_until_next(&self) -> Option<Duration> {
        let due_at = self.next_due()?;
        let remaining = due_at.saturating_sub(self.now_millis()).max(0);
        Some(Duration::from_millis(u64::try_from(remaining).unwrap_or(0)))
    }

    /// Resolves after the next change to the schedule.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scheduler() -> (ManualClock, Scheduler) {
        let clock = ManualClock::new(1_000_000);
        let scheduler = Scheduler::new(Arc::new(clock.clone()));
        (clock, scheduler)
    }

    #[test]
    fn jobs_fire_only_once_due() {
        let (clock, scheduler) = scheduler();
        let update = UpdateId::new();
        scheduler.schedule_after(Duration::from_secs(10), ScheduledJob::SyncTick);
        scheduler.schedule_after(Duration::from_secs(5), ScheduledJob::RetryUpdate(update));

        assert!(scheduler.take_due().is_empty());

        clock.advance(Duration::from_secs(5));
        assert_eq!(scheduler.take_due(), vec![ScheduledJob::RetryUpdate(update)]);

        clock.advance(Duration::from_secs(5));
        assert_eq!(scheduler.take_due(), vec![ScheduledJob::SyncTick]);
        assert_eq!(scheduler.next_due(), None);
    }

    #[test]
    fn cancelled_jobs_never_fire() {
        let (clock, scheduler) = scheduler();
        let timer = scheduler.schedule_after(Duration::from_secs(1), ScheduledJob::SyncTick);
        assert!(scheduler.cancel(timer));
        assert!(!scheduler.cancel(timer));

        clock.advance(Duration::from_secs(2));
        assert!(scheduler.take_due().is_empty());
    }

    #[test]
    fn cancel_job_removes_every_occurrence() {
        let (_clock, scheduler) = scheduler();
        let update = UpdateId::new();
        scheduler.schedule_after(Duration::from_secs(1), ScheduledJob::RetryUpdate(update));
        scheduler.schedule_after(Duration::from_secs(2), ScheduledJob::RetryUpdate(update));
        scheduler.schedule_after(Duration::from_secs(3), ScheduledJob::SyncTick);

        assert_eq!(scheduler.cancel_job(ScheduledJob::RetryUpdate(update)), 2);
        assert_eq!(
            scheduler.next_due_of(ScheduledJob::SyncTick),
            Some(1_003_000)
        );
    }

    #[test]
    fn time_until_next_reports_remaining_delay() {
        let (clock, scheduler) = scheduler();
        assert_eq!(scheduler.time_until_next(), None);

        scheduler.schedule_after(Duration::from_secs(30), ScheduledJob::SyncTick);
        clock.advance(Duration::from_secs(10));
        assert_eq!(scheduler.time_until_next(), Some(Duration::from_secs(20)));

        clock.advance(Duration::from_secs(60));
        assert_eq!(scheduler.time_until_next(), Some(Duration::ZERO));
    }
}
