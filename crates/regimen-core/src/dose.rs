//! Dose record lifecycle.
//!
//! `scheduled -> { taken | missed | skipped }`, all terminal. Two independent
//! actors race on the same record (the auto-miss timer and an asynchronous
//! subject reply), so every transition is an idempotent no-op once the record
//! is terminal: first transition wins, the loser observes `false` and moves
//! on. That check is the sole arbitration mechanism in the engine.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoseStatus {
    Scheduled,
    Taken,
    Missed,
    Skipped,
}

impl DoseStatus {
    /// Every status except `Scheduled` is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DoseStatus::Scheduled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DoseStatus::Scheduled => "scheduled",
            DoseStatus::Taken => "taken",
            DoseStatus::Missed => "missed",
            DoseStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(DoseStatus::Scheduled),
            "taken" => Some(DoseStatus::Taken),
            "missed" => Some(DoseStatus::Missed),
            "skipped" => Some(DoseStatus::Skipped),
            _ => None,
        }
    }
}

/// The persisted outcome (or pending state) for one slot once surfaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoseRecord {
    pub id: i64,
    pub course_id: i64,
    /// Must correspond exactly to a slot the calculator produces for this
    /// course and phase. Minute precision.
    pub scheduled_at: NaiveDateTime,
    /// When the subject actually acted, if they did.
    pub actual_at: Option<NaiveDateTime>,
    pub status: DoseStatus,
    /// Phase number at creation.
    pub phase: u8,
    pub created_at: DateTime<Utc>,
}

impl DoseRecord {
    /// A fresh `scheduled` record for a slot.
    pub fn scheduled(course_id: i64, scheduled_at: NaiveDateTime, phase: u8) -> Self {
        Self {
            id: 0,
            course_id,
            scheduled_at,
            actual_at: None,
            status: DoseStatus::Scheduled,
            phase,
            created_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Acknowledge the dose. `actual_at` is the subject-declared action time;
    /// backfilled confirmations pass the original scheduled time.
    ///
    /// Returns `false` (and changes nothing) if the record is already terminal.
    pub fn mark_taken(&mut self, actual_at: NaiveDateTime) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = DoseStatus::Taken;
        self.actual_at = Some(actual_at);
        true
    }

    /// Expire the dose, from the auto-miss timer or a catch-up confirmation.
    /// Idempotent no-op once terminal.
    pub fn mark_missed(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = DoseStatus::Missed;
        true
    }

    /// Explicit decline by the subject. Idempotent no-op once terminal.
    pub fn mark_skipped(&mut self, actual_at: NaiveDateTime) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = DoseStatus::Skipped;
        self.actual_at = Some(actual_at);
        true
    }

    /// Minutes between schedule and action, when an action time exists.
    pub fn delay_minutes(&self) -> Option<i64> {
        self.actual_at
            .map(|at| (at - self.scheduled_at).num_minutes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DoseRecord {
        DoseRecord::scheduled(1, "2025-03-01T08:00:00".parse().unwrap(), 1)
    }

    #[test]
    fn initial_status_is_scheduled() {
        let r = record();
        assert_eq!(r.status, DoseStatus::Scheduled);
        assert!(!r.is_terminal());
        assert!(r.actual_at.is_none());
    }

    #[test]
    fn taken_records_action_time() {
        let mut r = record();
        let at = "2025-03-01T08:03:00".parse().unwrap();
        assert!(r.mark_taken(at));
        assert_eq!(r.status, DoseStatus::Taken);
        assert_eq!(r.actual_at, Some(at));
        assert_eq!(r.delay_minutes(), Some(3));
    }

    #[test]
    fn second_transition_is_a_noop() {
        let mut r = record();
        assert!(r.mark_taken("2025-03-01T08:03:00".parse().unwrap()));
        // Auto-miss fires late: silent no-op, never `missed` after `taken`.
        assert!(!r.mark_missed());
        assert_eq!(r.status, DoseStatus::Taken);
        assert!(!r.mark_skipped("2025-03-01T08:10:00".parse().unwrap()));
        assert_eq!(r.status, DoseStatus::Taken);
    }

    #[test]
    fn miss_then_take_is_a_noop() {
        let mut r = record();
        assert!(r.mark_missed());
        assert!(!r.mark_taken("2025-03-01T09:00:00".parse().unwrap()));
        assert_eq!(r.status, DoseStatus::Missed);
        assert!(r.actual_at.is_none());
    }

    #[test]
    fn no_transition_back_to_scheduled() {
        // The type admits no such operation; parsing is the only other way
        // to produce a status, and terminal stays terminal thereafter.
        let mut r = record();
        r.mark_skipped("2025-03-01T08:00:00".parse().unwrap());
        assert!(r.is_terminal());
        assert!(!r.mark_taken("2025-03-01T08:01:00".parse().unwrap()));
        assert!(!r.mark_missed());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            DoseStatus::Scheduled,
            DoseStatus::Taken,
            DoseStatus::Missed,
            DoseStatus::Skipped,
        ] {
            assert_eq!(DoseStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(DoseStatus::parse("unknown"), None);
    }
}
