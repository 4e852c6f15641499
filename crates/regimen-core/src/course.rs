//! Treatment course model.
//!
//! One course per regimen attempt. The phase the course *should* be in is a
//! pure function of the start date and the phase table; mutating
//! `current_phase` is a separate, explicit step invoked by the reminder loop,
//! so reads never change state.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::{PhaseTable, CESSATION_DAY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CourseStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl CourseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CourseStatus::Active => "active",
            CourseStatus::Paused => "paused",
            CourseStatus::Completed => "completed",
            CourseStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(CourseStatus::Active),
            "paused" => Some(CourseStatus::Paused),
            "completed" => Some(CourseStatus::Completed),
            "failed" => Some(CourseStatus::Failed),
            _ => None,
        }
    }
}

/// One regimen attempt for one subject.
///
/// At most one course per subject may be `Active` at a time; the course
/// store enforces this on insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreatmentCourse {
    pub id: i64,
    pub subject_id: i64,
    pub start_date: NaiveDate,
    /// Phase number as last reconciled. May lag `expected_phase` transiently
    /// between a date change and the next loop pass.
    pub current_phase: u8,
    pub status: CourseStatus,
    /// Full cessation milestone, fixed at regimen day 5 when the course begins.
    pub cessation_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TreatmentCourse {
    /// A fresh active course starting on `start_date`, phase 1, with the
    /// cessation milestone pre-computed.
    pub fn begin(subject_id: i64, start_date: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            subject_id,
            start_date,
            current_phase: 1,
            status: CourseStatus::Active,
            cessation_date: start_date.checked_add_days(chrono::Days::new(
                u64::from(CESSATION_DAY) - 1,
            )),
            created_at: now,
            updated_at: now,
        }
    }

    /// 1-based regimen day for `today`. The start date itself is day 1.
    /// Zero or negative if `today` precedes the start date.
    pub fn elapsed_days(&self, today: NaiveDate) -> i64 {
        (today - self.start_date).num_days() + 1
    }

    /// The phase number `today` maps to via the table, or `None` once the
    /// regimen period has ended. Pure query; never mutates the course.
    pub fn expected_phase(&self, table: &PhaseTable, today: NaiveDate) -> Option<u8> {
        let day = self.elapsed_days(today);
        if day < 1 {
            return None;
        }
        table.phase_for_day(day as u32).map(|p| p.number)
    }

    /// Explicit phase transition, invoked by the scheduler when
    /// `expected_phase` drifts from `current_phase`.
    pub fn apply_phase(&mut self, phase: u8) {
        if self.current_phase != phase {
            self.current_phase = phase;
            self.updated_at = Utc::now();
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == CourseStatus::Active
    }

    pub fn set_status(&mut self, status: CourseStatus) {
        if self.status != status {
            self.status = status;
            self.updated_at = Utc::now();
        }
    }

    pub fn is_cessation_day(&self, today: NaiveDate) -> bool {
        self.elapsed_days(today) == i64::from(CESSATION_DAY)
    }

    /// Administrative start-date correction. Phase and schedule are
    /// re-derived from the new date on the next scheduler pass; dose records
    /// keep their original timestamps, and any timer armed under the old
    /// date stays harmless because dose transitions are idempotent.
    pub fn rewrite_start_date(&mut self, start: NaiveDate) {
        if self.start_date != start {
            self.start_date = start;
            self.cessation_date =
                start.checked_add_days(chrono::Days::new(u64::from(CESSATION_DAY) - 1));
            self.updated_at = Utc::now();
        }
    }
}
