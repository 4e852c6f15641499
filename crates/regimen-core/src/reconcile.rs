//! Catch-up reconciliation: finding slots with no terminal record.
//!
//! Reconciliation re-derives the whole backlog from the phase table and the
//! persisted record set every time it runs. There is no cursor and no
//! last-checked position, so it stays correct across process downtime, clock
//! changes, and retroactive start-date edits, at the price of recomputing a
//! few hundred slots at most.

use std::collections::HashSet;

use chrono::{NaiveDateTime, NaiveTime};
use log::{debug, info};
use uuid::Uuid;

use crate::course::TreatmentCourse;
use crate::dose::DoseRecord;
use crate::error::ActionError;
use crate::schedule::{DoseSlot, ScheduleCalculator};

/// Diffs computed slots since course start against persisted dose records.
#[derive(Debug, Clone)]
pub struct CatchUpReconciler {
    calc: ScheduleCalculator,
}

impl CatchUpReconciler {
    pub fn new(calc: ScheduleCalculator) -> Self {
        Self { calc }
    }

    /// All slots at or before `as_of` with no matching terminal record,
    /// strictly ascending by time.
    ///
    /// A record matches a slot on (date, time-of-day) at minute precision;
    /// a still-`scheduled` record does not shield its slot, so a crashed
    /// loop's half-surfaced dose is rediscovered here.
    pub fn overdue_slots(
        &self,
        course: &TreatmentCourse,
        first_dose_time: NaiveTime,
        records: &[DoseRecord],
        as_of: NaiveDateTime,
    ) -> Vec<DoseSlot> {
        let elapsed = course.elapsed_days(as_of.date());
        if elapsed < 1 {
            return Vec::new();
        }

        let resolved: HashSet<NaiveDateTime> = records
            .iter()
            .filter(|r| r.status.is_terminal())
            .map(|r| minute_key(r.scheduled_at))
            .collect();

        let mut overdue = Vec::new();
        for day in 1..=elapsed as u32 {
            for slot in self.calc.day_schedule(course, first_dose_time, day) {
                if slot.scheduled_at > as_of {
                    continue;
                }
                if !resolved.contains(&minute_key(slot.scheduled_at)) {
                    overdue.push(slot);
                }
            }
        }
        overdue.sort_by_key(|s| s.scheduled_at);

        info!(
            "course {}: {} overdue slot(s) as of {}",
            course.id,
            overdue.len(),
            as_of
        );
        overdue
    }
}

/// Truncate to minute precision for slot/record matching.
pub(crate) fn minute_key(t: NaiveDateTime) -> NaiveDateTime {
    use chrono::Timelike;
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// The answer a subject gives for one backlog slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpAnswer {
    Taken,
    Missed,
}

/// Interactive backlog resolution, oldest slot first.
///
/// The surrounding layer shows `current()` to the subject, persists the
/// record returned by `resolve()`, and repeats until `is_finished()`. The
/// single admitted exception to "oldest-first, must-resolve": the most
/// recent slot only may be postponed instead, because it represents the dose
/// nearest to now. Postponing ends the session with that slot still pending.
#[derive(Debug, Clone)]
pub struct CatchUpSession {
    /// Correlation id for logs; a session spans multiple subject replies.
    pub id: Uuid,
    slots: Vec<DoseSlot>,
    course_id: i64,
    cursor: usize,
    postponed: bool,
}

impl CatchUpSession {
    /// Build a session from reconciler output (already ascending).
    pub fn new(course_id: i64, slots: Vec<DoseSlot>) -> Self {
        let id = Uuid::new_v4();
        debug!(
            "catch-up session {id} opened for course {course_id} ({} slot(s))",
            slots.len()
        );
        Self {
            id,
            slots,
            course_id,
            cursor: 0,
            postponed: false,
        }
    }

    /// The slot awaiting an answer, oldest unresolved first.
    pub fn current(&self) -> Option<&DoseSlot> {
        if self.postponed {
            return None;
        }
        self.slots.get(self.cursor)
    }

    /// Whether `current()` is the most recent overdue slot (the only one
    /// eligible for postponement).
    pub fn current_is_last(&self) -> bool {
        !self.slots.is_empty() && self.cursor == self.slots.len() - 1
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }

    pub fn answered(&self) -> usize {
        self.cursor
    }

    pub fn is_finished(&self) -> bool {
        self.postponed || self.cursor >= self.slots.len()
    }

    /// Whether the session ended by postponing the final slot.
    pub fn ended_postponed(&self) -> bool {
        self.postponed
    }

    /// Apply the subject's answer to the current slot and advance.
    ///
    /// Returns the backfilled record for the caller to persist. A backfilled
    /// "taken" defaults the action time to the original scheduled time.
    pub fn resolve(&mut self, answer: CatchUpAnswer) -> Option<DoseRecord> {
        let slot = *self.current()?;
        let mut record = DoseRecord::scheduled(self.course_id, slot.scheduled_at, slot.phase);
        match answer {
            CatchUpAnswer::Taken => {
                record.mark_taken(slot.scheduled_at);
            }
            CatchUpAnswer::Missed => {
                record.mark_missed();
            }
        }
        self.cursor += 1;
        Some(record)
    }

    /// Postpone the current slot instead of resolving it. Admitted only for
    /// the most recent slot; everything older must be answered first.
    pub fn postpone_last(&mut self) -> Result<DoseSlot, ActionError> {
        if !self.current_is_last() || self.postponed {
            return Err(ActionError::PostponeNotLast);
        }
        let slot = self.slots[self.cursor];
        self.postponed = true;
        Ok(slot)
    }
}
