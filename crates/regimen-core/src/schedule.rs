//! Schedule calculator: expands one phase-day into concrete dose slots.
//!
//! The calculator is pure. Recomputing for the same `(course, first dose
//! time, day)` always yields identical slots, which is what lets
//! reconciliation compare computed slots against persisted records without
//! ever storing the schedule itself.

use chrono::{Days, Duration, NaiveDateTime, NaiveTime};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::course::TreatmentCourse;
use crate::dose::DoseRecord;
use crate::error::ConfigError;
use crate::phase::PhaseTable;

/// One computed point in time at which a dose is due, before any record
/// exists for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoseSlot {
    /// 1-based slot index within the day.
    pub index: u32,
    /// Minute precision. Unbounded by calendar day: a late first dose plus a
    /// long interval may push slots past midnight.
    pub scheduled_at: NaiveDateTime,
    /// Phase number the slot belongs to.
    pub phase: u8,
    /// Regimen day the slot belongs to (which may differ from the calendar
    /// day of `scheduled_at` for slots pushed past midnight).
    pub day: u32,
}

/// Expands phase-days into ordered dose slots and picks the next due time.
#[derive(Debug, Clone)]
pub struct ScheduleCalculator {
    table: PhaseTable,
}

impl ScheduleCalculator {
    pub fn new(table: PhaseTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &PhaseTable {
        &self.table
    }

    /// All slots for regimen day `day`, ordered by time.
    ///
    /// Empty when `day` falls outside the table (regimen period ended) or
    /// precedes day 1. A data-integrity problem there degrades to an empty
    /// day, never a panic.
    pub fn day_schedule(
        &self,
        course: &TreatmentCourse,
        first_dose_time: NaiveTime,
        day: u32,
    ) -> Vec<DoseSlot> {
        let Some(phase) = self.table.phase_for_day(day) else {
            return Vec::new();
        };
        let Some(date) = course.start_date.checked_add_days(Days::new(u64::from(day) - 1))
        else {
            warn!("day {day} of course {} overflows the calendar", course.id);
            return Vec::new();
        };

        let step = Duration::minutes(phase.interval_minutes());
        let mut at = date.and_time(first_dose_time);
        let mut slots = Vec::with_capacity(phase.doses_per_day as usize);
        for i in 1..=phase.doses_per_day {
            slots.push(DoseSlot {
                index: i,
                scheduled_at: at,
                phase: phase.number,
                day,
            });
            // No interval after the last slot.
            if i < phase.doses_per_day {
                at += step;
            }
        }
        slots
    }

    /// The next dose time: the earliest overdue slot if any exist, else the
    /// earliest future slot today, else tomorrow's first slot while the
    /// course has remaining days, else `None` (course finished).
    pub fn next_dose_slot(
        &self,
        course: &TreatmentCourse,
        first_dose_time: NaiveTime,
        records: &[DoseRecord],
        as_of: NaiveDateTime,
    ) -> Option<DoseSlot> {
        let reconciler = crate::reconcile::CatchUpReconciler::new(self.clone());
        if let Some(slot) = reconciler
            .overdue_slots(course, first_dose_time, records, as_of)
            .into_iter()
            .next()
        {
            return Some(slot);
        }

        let day = course.elapsed_days(as_of.date());
        if day < 1 {
            // Course starts in the future; its first slot is the next dose.
            return self.day_schedule(course, first_dose_time, 1).into_iter().next();
        }
        let day = day as u32;

        if let Some(slot) = self
            .day_schedule(course, first_dose_time, day)
            .into_iter()
            .find(|s| s.scheduled_at > as_of)
        {
            return Some(slot);
        }

        if day < self.table.total_days() {
            return self
                .day_schedule(course, first_dose_time, day + 1)
                .into_iter()
                .next();
        }
        None
    }
}

/// Parse a subject-supplied `HH:MM` first-dose time.
pub fn parse_first_dose_time(s: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| ConfigError::InvalidFirstDoseTime(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course::TreatmentCourse;
    use chrono::Timelike;

    fn calc() -> ScheduleCalculator {
        ScheduleCalculator::new(PhaseTable::standard())
    }

    fn course() -> TreatmentCourse {
        TreatmentCourse::begin(1, "2025-03-01".parse().unwrap())
    }

    fn eight() -> NaiveTime {
        "08:00:00".parse().unwrap()
    }

    #[test]
    fn day_one_phase_one_slots() {
        let slots = calc().day_schedule(&course(), eight(), 1);
        let times: Vec<String> = slots
            .iter()
            .map(|s| s.scheduled_at.format("%H:%M").to_string())
            .collect();
        assert_eq!(times, ["08:00", "10:00", "12:00", "14:00", "16:00", "18:00"]);
        assert!(slots.iter().all(|s| s.phase == 1));
        assert_eq!(
            slots.iter().map(|s| s.index).collect::<Vec<_>>(),
            [1, 2, 3, 4, 5, 6]
        );
    }

    #[test]
    fn slot_count_matches_phase_for_every_day() {
        let calc = calc();
        let course = course();
        for day in 1..=25 {
            let expected = calc.table().phase_for_day(day).unwrap().doses_per_day;
            let slots = calc.day_schedule(&course, eight(), day);
            assert_eq!(slots.len() as u32, expected, "day {day}");
        }
    }

    #[test]
    fn consecutive_gap_equals_truncated_interval() {
        let calc = calc();
        let course = course();
        for day in [1, 4, 13, 17, 21] {
            let interval = calc.table().phase_for_day(day).unwrap().interval_minutes();
            let slots = calc.day_schedule(&course, eight(), day);
            for pair in slots.windows(2) {
                let gap = (pair[1].scheduled_at - pair[0].scheduled_at).num_minutes();
                assert_eq!(gap, interval, "day {day}");
            }
        }
    }

    #[test]
    fn fractional_interval_lands_on_whole_minutes() {
        // Phase 2: 2.5h -> 150 min.
        let slots = calc().day_schedule(&course(), "09:15:00".parse().unwrap(), 4);
        assert_eq!(
            slots[1].scheduled_at,
            "2025-03-04T11:45:00".parse().unwrap()
        );
        assert_eq!(slots[1].scheduled_at.second(), 0);
    }

    #[test]
    fn slots_may_cross_midnight() {
        // Day 1 starting at 20:00: 6 doses every 2h runs past midnight.
        let slots = calc().day_schedule(&course(), "20:00:00".parse().unwrap(), 1);
        assert_eq!(
            slots[5].scheduled_at,
            "2025-03-02T06:00:00".parse().unwrap()
        );
    }

    #[test]
    fn day_schedule_is_deterministic() {
        let calc = calc();
        let course = course();
        let a = calc.day_schedule(&course, eight(), 4);
        let b = calc.day_schedule(&course, eight(), 4);
        assert_eq!(a, b);
    }

    #[test]
    fn out_of_range_day_is_empty() {
        assert!(calc().day_schedule(&course(), eight(), 26).is_empty());
        assert!(calc().day_schedule(&course(), eight(), 0).is_empty());
    }

    #[test]
    fn next_slot_prefers_future_slot_today() {
        let calc = calc();
        let course = course();
        // Day 1, 09:30, slots up to 09:00-ish resolved: with no records the
        // 08:00 slot is overdue and wins.
        let next = calc
            .next_dose_slot(&course, eight(), &[], "2025-03-01T09:30:00".parse().unwrap())
            .unwrap();
        assert_eq!(next.scheduled_at, "2025-03-01T08:00:00".parse().unwrap());
    }

    #[test]
    fn next_slot_rolls_to_tomorrow_after_last_dose() {
        let calc = calc();
        let course = course();
        // All of day 1 resolved; 19:00 is past the 18:00 slot.
        let mut records = Vec::new();
        for slot in calc.day_schedule(&course, eight(), 1) {
            let mut r = DoseRecord::scheduled(course.id, slot.scheduled_at, slot.phase);
            r.mark_taken(slot.scheduled_at);
            records.push(r);
        }
        let next = calc
            .next_dose_slot(&course, eight(), &records, "2025-03-01T19:00:00".parse().unwrap())
            .unwrap();
        assert_eq!(next.scheduled_at, "2025-03-02T08:00:00".parse().unwrap());
        assert_eq!(next.index, 1);
    }

    #[test]
    fn next_slot_none_after_final_day() {
        let calc = calc();
        let course = course();
        // Day 26, everything before resolved.
        let mut records = Vec::new();
        for day in 1..=25 {
            for slot in calc.day_schedule(&course, eight(), day) {
                let mut r = DoseRecord::scheduled(course.id, slot.scheduled_at, slot.phase);
                r.mark_taken(slot.scheduled_at);
                records.push(r);
            }
        }
        assert!(calc
            .next_dose_slot(&course, eight(), &records, "2025-03-26T12:00:00".parse().unwrap())
            .is_none());
    }

    #[test]
    fn first_dose_time_parsing() {
        assert!(parse_first_dose_time("08:30").is_ok());
        assert!(parse_first_dose_time("23:59").is_ok());
        assert!(parse_first_dose_time("8am").is_err());
        assert!(parse_first_dose_time("25:00").is_err());
    }

    proptest::proptest! {
        /// Every regimen day expands to exactly its phase's dose count, with
        /// consecutive slots separated by the phase interval.
        #[test]
        fn day_expansion_matches_phase(day in 1u32..=25, hour in 0u32..24, minute in 0u32..60) {
            let calc = calc();
            let course = course();
            let first = chrono::NaiveTime::from_hms_opt(hour, minute, 0).unwrap();
            let phase = calc.table().phase_for_day(day).unwrap();
            let slots = calc.day_schedule(&course, first, day);
            proptest::prop_assert_eq!(slots.len() as u32, phase.doses_per_day);
            for pair in slots.windows(2) {
                let gap = pair[1].scheduled_at - pair[0].scheduled_at;
                proptest::prop_assert_eq!(gap.num_minutes(), phase.interval_minutes());
            }
        }
    }
}
