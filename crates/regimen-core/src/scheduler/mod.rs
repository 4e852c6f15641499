//! Per-subject reminder loops and the registry that owns them.
//!
//! One tokio task per subject with an active course. Every loop decision is
//! derived by re-reading course and record state from the stores, never from
//! cached cursors, so a freshly started loop for a resumed course reproduces
//! the decision a continuously-running loop would have made.
//!
//! All sleeps are bounded increments racing a shutdown signal; cancellation
//! is observed within one increment and no notification goes out after it
//! has been observed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration as StdDuration;

use chrono::{Duration, Local, NaiveDateTime, NaiveTime};
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::course::{CourseStatus, TreatmentCourse};
use crate::dose::DoseRecord;
use crate::error::{ActionError, StoreError};
use crate::reconcile::minute_key;
use crate::schedule::{DoseSlot, ScheduleCalculator};
use crate::store::{CourseStore, DoseNotice, DoseStore, NoticeKind, NotificationSink};

/// Wall-clock source for scheduling decisions. Tests substitute a manual
/// clock; tokio's paused time only covers sleeps, not calendar time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// The process-local wall clock, naive local time at minute-ish precision.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Tunable loop parameters. Defaults follow the regimen bot's behavior;
/// tests shrink them to keep runs fast.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound for any single sleep, and the idle pause between
    /// iterations.
    pub tick: StdDuration,
    /// Window within which a notification for the same slot is not re-sent.
    pub throttle_minutes: i64,
    /// Postponement deferral.
    pub postpone_minutes: i64,
    /// Fixed auto-miss delay overriding the half-interval default when set.
    /// Tests use this; production leaves it `None`.
    pub auto_miss_delay: Option<StdDuration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: StdDuration::from_secs(60),
            throttle_minutes: 15,
            postpone_minutes: 5,
            auto_miss_delay: None,
        }
    }
}

/// A pending deferred re-notification of one slot.
#[derive(Debug, Clone, Copy)]
struct Postponement {
    slot: DoseSlot,
    deadline: NaiveDateTime,
}

/// Per-subject state shared between the loop, its auto-miss timers, and
/// out-of-band action calls.
struct SubjectShared {
    subject_id: i64,
    first_dose_time: NaiveTime,
    postponed: Mutex<Option<Postponement>>,
    /// slot minute-key -> last notification time.
    throttle: Mutex<HashMap<NaiveDateTime, NaiveDateTime>>,
    /// Slots whose auto-miss timer has already been armed (armed on first
    /// notification only).
    armed: Mutex<HashSet<NaiveDateTime>>,
    /// The most recently notified slot; the target of a bare `postpone`.
    last_notified: Mutex<Option<DoseSlot>>,
}

struct SubjectEntry {
    shared: Arc<SubjectShared>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// The process-wide registry of reminder loops.
///
/// `start` inserts and spawns, `stop` cancels and removes; action intake
/// (`acknowledge`, `decline`, `postpone`) is safe to call concurrently with
/// the loops because records are resolved through the store's idempotent
/// transition path, not through the loop.
pub struct ReminderScheduler {
    calc: ScheduleCalculator,
    courses: Arc<dyn CourseStore>,
    doses: Arc<dyn DoseStore>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    subjects: Arc<Mutex<HashMap<i64, SubjectEntry>>>,
}

impl ReminderScheduler {
    pub fn new(
        calc: ScheduleCalculator,
        courses: Arc<dyn CourseStore>,
        doses: Arc<dyn DoseStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self::with_config(calc, courses, doses, sink, SchedulerConfig::default())
    }

    pub fn with_config(
        calc: ScheduleCalculator,
        courses: Arc<dyn CourseStore>,
        doses: Arc<dyn DoseStore>,
        sink: Arc<dyn NotificationSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            calc,
            courses,
            doses,
            sink,
            clock: Arc::new(SystemClock),
            config,
            subjects: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Substitute the wall-clock source (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Spawn the reminder loop for a subject's active course. Replaces any
    /// loop already running for the subject. Must be called on a tokio
    /// runtime.
    pub fn start(&self, subject_id: i64, first_dose_time: NaiveTime) {
        let shared = Arc::new(SubjectShared {
            subject_id,
            first_dose_time,
            postponed: Mutex::new(None),
            throttle: Mutex::new(HashMap::new()),
            armed: Mutex::new(HashSet::new()),
            last_notified: Mutex::new(None),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = SubjectLoop {
            calc: self.calc.clone(),
            courses: Arc::clone(&self.courses),
            doses: Arc::clone(&self.doses),
            sink: Arc::clone(&self.sink),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            shared: Arc::clone(&shared),
            shutdown: shutdown_rx,
            registry: Arc::downgrade(&self.subjects),
        };
        // Spawn and insert under one lock: a worker that exits instantly
        // blocks on this lock in its self-removal until the entry exists.
        let mut subjects = self.lock_subjects();
        let join = tokio::spawn(worker.run());
        let replaced = subjects.insert(
            subject_id,
            SubjectEntry {
                shared,
                shutdown: shutdown_tx,
                join,
            },
        );
        drop(subjects);
        if let Some(old) = replaced {
            let _ = old.shutdown.send(true);
            old.join.abort();
        }
        info!("reminder loop started for subject {subject_id} (first dose {first_dose_time})");
    }

    /// Cancel a subject's loop and any in-flight auto-miss timers, releasing
    /// all per-subject resources.
    pub fn stop(&self, subject_id: i64) {
        if let Some(entry) = self.lock_subjects().remove(&subject_id) {
            let _ = entry.shutdown.send(true);
            entry.shared.clear();
            info!("reminder loop stopped for subject {subject_id}");
        }
    }

    pub fn is_running(&self, subject_id: i64) -> bool {
        self.lock_subjects().contains_key(&subject_id)
    }

    pub fn running_count(&self) -> usize {
        self.lock_subjects().len()
    }

    /// Subject acknowledges the dose at `scheduled_at`. Applied immediately,
    /// out of band of the loop; a lost race against the auto-miss timer is a
    /// silent no-op.
    pub fn acknowledge(
        &self,
        subject_id: i64,
        scheduled_at: NaiveDateTime,
    ) -> Result<DoseRecord, ActionError> {
        self.resolve(subject_id, scheduled_at, |record, now| {
            record.mark_taken(now)
        })
    }

    /// Subject declines the dose at `scheduled_at`.
    pub fn decline(
        &self,
        subject_id: i64,
        scheduled_at: NaiveDateTime,
    ) -> Result<DoseRecord, ActionError> {
        self.resolve(subject_id, scheduled_at, |record, now| {
            record.mark_skipped(now)
        })
    }

    fn resolve(
        &self,
        subject_id: i64,
        scheduled_at: NaiveDateTime,
        transition: impl FnOnce(&mut DoseRecord, NaiveDateTime) -> bool,
    ) -> Result<DoseRecord, ActionError> {
        let course = self
            .courses
            .get_active(subject_id)?
            .ok_or(ActionError::SubjectNotRunning(subject_id))?;
        let mut record = self
            .doses
            .find_by_slot(course.id, scheduled_at)?
            .ok_or(ActionError::SlotNotFound {
                course: course.id,
                scheduled_at,
            })?;

        if transition(&mut record, self.clock.now()) {
            self.doses.update(&record)?;
            debug!(
                "subject {subject_id}: slot {} resolved to {:?}",
                record.scheduled_at, record.status
            );
        } else {
            debug!(
                "subject {subject_id}: slot {} already terminal ({:?}), no-op",
                record.scheduled_at, record.status
            );
        }

        // Resolving a slot also cancels its pending postponement and clears
        // its throttle entry, regardless of who won the race.
        if let Some(entry) = self.lock_subjects().get(&subject_id) {
            entry.shared.forget_slot(record.scheduled_at);
        }
        Ok(record)
    }

    /// Defer re-notification of the most recently notified slot by the
    /// configured postponement. No new slot is created.
    pub fn postpone(&self, subject_id: i64) -> Result<(), ActionError> {
        let subjects = self.lock_subjects();
        let entry = subjects
            .get(&subject_id)
            .ok_or(ActionError::SubjectNotRunning(subject_id))?;
        let slot = (*entry.shared.lock(&entry.shared.last_notified))
            .ok_or(ActionError::NothingToPostpone(subject_id))?;
        entry
            .shared
            .set_postponement(slot, self.clock.now() + Duration::minutes(self.config.postpone_minutes));
        info!(
            "subject {subject_id}: slot {} postponed {} min",
            slot.scheduled_at, self.config.postpone_minutes
        );
        Ok(())
    }

    /// Defer a specific slot (used when a catch-up session ends with its
    /// most recent slot postponed rather than resolved).
    pub fn postpone_slot(&self, subject_id: i64, slot: DoseSlot) -> Result<(), ActionError> {
        let subjects = self.lock_subjects();
        let entry = subjects
            .get(&subject_id)
            .ok_or(ActionError::SubjectNotRunning(subject_id))?;
        entry
            .shared
            .set_postponement(slot, self.clock.now() + Duration::minutes(self.config.postpone_minutes));
        Ok(())
    }

    /// Missed + skipped aggregate for the subject's active course.
    pub fn lapse_count(&self, subject_id: i64) -> Result<u64, ActionError> {
        let course = self
            .courses
            .get_active(subject_id)?
            .ok_or(ActionError::SubjectNotRunning(subject_id))?;
        Ok(self.doses.lapse_count(course.id)?)
    }

    fn lock_subjects(&self) -> std::sync::MutexGuard<'_, HashMap<i64, SubjectEntry>> {
        self.subjects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SubjectShared {
    fn set_postponement(&self, slot: DoseSlot, deadline: NaiveDateTime) {
        // Postponing clears the slot's throttle record so the deferred
        // re-notification is not swallowed by the 15-minute window.
        self.lock(&self.throttle).remove(&minute_key(slot.scheduled_at));
        *self.lock(&self.postponed) = Some(Postponement { slot, deadline });
    }

    fn forget_slot(&self, scheduled_at: NaiveDateTime) {
        let key = minute_key(scheduled_at);
        self.lock(&self.throttle).remove(&key);
        let mut postponed = self.lock(&self.postponed);
        if postponed
            .map(|p| minute_key(p.slot.scheduled_at) == key)
            .unwrap_or(false)
        {
            *postponed = None;
        }
    }

    fn clear(&self) {
        *self.lock(&self.postponed) = None;
        self.lock(&self.throttle).clear();
        self.lock(&self.armed).clear();
        *self.lock(&self.last_notified) = None;
    }

    fn lock<'a, T>(&self, m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        m.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// What one loop iteration decided.
enum Step {
    /// Nothing due right now; idle up to one tick.
    Idle,
    /// State changed; re-evaluate immediately.
    Again,
    /// Wait toward a known instant (bounded by one tick).
    WaitUntil(NaiveDateTime),
    /// Course left the active state, or the regimen is complete.
    Exit(&'static str),
}

struct SubjectLoop {
    calc: ScheduleCalculator,
    courses: Arc<dyn CourseStore>,
    doses: Arc<dyn DoseStore>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    shared: Arc<SubjectShared>,
    shutdown: watch::Receiver<bool>,
    registry: Weak<Mutex<HashMap<i64, SubjectEntry>>>,
}

impl SubjectLoop {
    async fn run(mut self) {
        let subject_id = self.shared.subject_id;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let step = match self.step().await {
                Ok(step) => step,
                Err(e) => {
                    // Transient store failures never kill the loop; the next
                    // iteration re-reads everything.
                    warn!("subject {subject_id}: iteration failed, retrying next tick: {e}");
                    Step::Idle
                }
            };
            match step {
                Step::Again => continue,
                Step::Idle => {
                    if !self.sleep_increment(self.config.tick).await {
                        break;
                    }
                }
                Step::WaitUntil(at) => {
                    let remaining = at - self.clock.now();
                    let bounded = remaining
                        .to_std()
                        .unwrap_or(StdDuration::ZERO)
                        .min(self.config.tick);
                    if !self.sleep_increment(bounded).await {
                        break;
                    }
                }
                Step::Exit(reason) => {
                    info!("subject {subject_id}: reminder loop exiting ({reason})");
                    break;
                }
            }
        }
        // A self-exiting loop removes its own registry entry so `is_running`
        // reflects liveness. The pointer check keeps a replaced loop from
        // evicting its successor.
        if let Some(registry) = self.registry.upgrade() {
            let mut subjects = registry.lock().unwrap_or_else(|e| e.into_inner());
            let own_entry = subjects
                .get(&subject_id)
                .map(|e| Arc::ptr_eq(&e.shared, &self.shared))
                .unwrap_or(false);
            if own_entry {
                subjects.remove(&subject_id);
            }
        }
        self.shared.clear();
        debug!("subject {subject_id}: loop resources released");
    }

    /// One pass of the per-iteration algorithm.
    async fn step(&mut self) -> Result<Step, StoreError> {
        let subject_id = self.shared.subject_id;
        let now = self.clock.now();

        // 1. Re-read course state; exit if no longer active.
        let Some(mut course) = self.courses.get_active(subject_id)? else {
            return Ok(Step::Exit("no active course"));
        };
        if course.status != CourseStatus::Active {
            return Ok(Step::Exit("course not active"));
        }
        self.reconcile_phase(&mut course, now)?;

        // 2-3. A pending postponement preempts the regular schedule.
        let pending = *self.shared.lock(&self.shared.postponed);
        if let Some(p) = pending {
            if now >= p.deadline {
                *self.shared.lock(&self.shared.postponed) = None;
                self.surface_slot(&course, p.slot, NoticeKind::Postponed, now)
                    .await?;
                return Ok(Step::Again);
            }
            return Ok(Step::WaitUntil(p.deadline));
        }

        // 4. Next due slot: earliest overdue, else today's next future slot,
        //    else tomorrow's first, else the course is complete.
        let records = self.doses.find_by_course(course.id)?;
        let Some(slot) =
            self.calc
                .next_dose_slot(&course, self.shared.first_dose_time, &records, now)
        else {
            course.set_status(CourseStatus::Completed);
            self.courses.update(&course)?;
            return Ok(Step::Exit("regimen complete"));
        };

        // 5. Not due yet: sleep toward it in bounded increments.
        if slot.scheduled_at > now {
            return Ok(Step::WaitUntil(slot.scheduled_at));
        }

        // 6-7. Due: notify unless throttled, arming auto-miss on the first
        //      notification for this slot.
        self.surface_slot(&course, slot, NoticeKind::Due, now).await?;

        // 8. Idle before the next pass.
        Ok(Step::Idle)
    }

    /// Explicit phase transition when the computed phase has drifted from
    /// the stored one (read and update are deliberately separate steps).
    fn reconcile_phase(
        &self,
        course: &mut TreatmentCourse,
        now: NaiveDateTime,
    ) -> Result<(), StoreError> {
        if let Some(expected) = course.expected_phase(self.calc.table(), now.date()) {
            if expected != course.current_phase {
                info!(
                    "subject {}: phase {} -> {} on day {}",
                    course.subject_id,
                    course.current_phase,
                    expected,
                    course.elapsed_days(now.date())
                );
                course.apply_phase(expected);
                self.courses.update(course)?;
            }
        }
        Ok(())
    }

    /// Ensure a `scheduled` record exists for the slot, emit a notification
    /// (throttled), and arm the auto-miss timer on first notification.
    async fn surface_slot(
        &mut self,
        course: &TreatmentCourse,
        slot: DoseSlot,
        kind: NoticeKind,
        now: NaiveDateTime,
    ) -> Result<(), StoreError> {
        let subject_id = self.shared.subject_id;
        let key = minute_key(slot.scheduled_at);

        // Throttle: an identical notification within the window is skipped;
        // the loop still re-evaluates so the auto-miss race keeps running.
        let recently_sent = self
            .shared
            .lock(&self.shared.throttle)
            .get(&key)
            .map(|sent| now - *sent < Duration::minutes(self.config.throttle_minutes))
            .unwrap_or(false);
        if recently_sent {
            return Ok(());
        }

        let record = match self.doses.find_by_slot(course.id, slot.scheduled_at)? {
            Some(record) => record,
            None => self
                .doses
                .create(&DoseRecord::scheduled(course.id, slot.scheduled_at, slot.phase))?,
        };
        if record.is_terminal() {
            // Resolved out of band between computing the slot and surfacing
            // it; nothing to notify.
            return Ok(());
        }

        // Cancellation check sits immediately before delivery: once shutdown
        // is observed, nothing more is sent.
        if *self.shutdown.borrow() {
            return Ok(());
        }

        let notice = DoseNotice {
            slot,
            kind,
            day: slot.day,
            special_event: self
                .calc
                .table()
                .special_event_for_day(slot.day)
                .map(str::to_string),
        };
        match self.sink.notify(subject_id, &notice).await {
            Ok(()) => {
                self.shared.lock(&self.shared.throttle).insert(key, now);
                *self.shared.lock(&self.shared.last_notified) = Some(slot);
                info!(
                    "subject {subject_id}: notified for slot {} ({:?})",
                    slot.scheduled_at, kind
                );
            }
            Err(e) => {
                // Delivery failures are invisible to the scheduling decision;
                // the next pass outside the throttle window retries.
                error!("subject {subject_id}: notification failed: {e}");
                return Ok(());
            }
        }

        let first_notification = self.shared.lock(&self.shared.armed).insert(key);
        if first_notification {
            self.arm_auto_miss(course.id, slot);
        }
        Ok(())
    }

    /// Auto-miss: half the phase interval after the first notification, the
    /// record is expired unless an action already resolved it. The re-read
    /// plus idempotent transition is the entire arbitration; a stale timer
    /// (after a start-date rewrite) is harmless for the same reason.
    fn arm_auto_miss(&self, course_id: i64, slot: DoseSlot) {
        let doses = Arc::clone(&self.doses);
        let subject_id = self.shared.subject_id;
        let mut shutdown = self.shutdown.clone();
        let delay = self.config.auto_miss_delay.unwrap_or_else(|| {
            let half_interval = self
                .calc
                .table()
                .phase_for_day(slot.day)
                .map(|p| p.interval_minutes() * 60 / 2)
                .unwrap_or(30 * 60);
            StdDuration::from_secs(half_interval.max(1) as u64)
        });

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if *shutdown.borrow() {
                return;
            }
            let result = doses.find_by_slot(course_id, slot.scheduled_at);
            match result {
                Ok(Some(mut record)) => {
                    if record.mark_missed() {
                        if let Err(e) = doses.update(&record) {
                            warn!("subject {subject_id}: auto-miss update failed: {e}");
                        } else {
                            info!(
                                "subject {subject_id}: slot {} auto-expired to missed",
                                slot.scheduled_at
                            );
                        }
                    }
                    // already terminal: the subject won the race
                }
                Ok(None) => {} // gone: the subject won the race
                Err(e) => warn!("subject {subject_id}: auto-miss re-read failed: {e}"),
            }
        });
    }

    /// Sleep up to `dur`, waking early on shutdown. Returns `false` when
    /// shutdown was observed.
    async fn sleep_increment(&mut self, dur: StdDuration) -> bool {
        if dur.is_zero() {
            return !*self.shutdown.borrow();
        }
        tokio::select! {
            _ = self.shutdown.changed() => false,
            _ = tokio::time::sleep(dur.min(self.config.tick)) => true,
        }
    }
}
