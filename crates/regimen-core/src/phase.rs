//! Phase table: the static day-range to dosing-parameter mapping.
//!
//! A regimen is divided into five ordered phases. Each phase fixes the dose
//! interval and the per-day dose count for a contiguous, inclusive range of
//! regimen days. The default table is the standard 25-day course.
//!
//! The table is validated once at startup; a malformed table (gap, overlap,
//! inverted range) is a fatal configuration error, never silently repaired.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The regimen day on which full cessation is expected.
pub const CESSATION_DAY: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Initial,
    Intensive,
    Reduction,
    Minimal,
    Completion,
}

/// One phase of the regimen. Immutable once the table is validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDefinition {
    /// Phase number, 1-based and unique within the table.
    pub number: u8,
    /// First regimen day of the phase, inclusive.
    pub start_day: u32,
    /// Last regimen day of the phase, inclusive.
    pub end_day: u32,
    /// Interval between doses in hours. Fractional values are allowed;
    /// they are truncated to whole minutes when slots are computed.
    pub interval_hours: f64,
    /// Doses per day.
    pub doses_per_day: u32,
    pub kind: PhaseKind,
    /// Day-keyed annotations (milestones, handovers).
    #[serde(default)]
    pub special_events: BTreeMap<u32, String>,
    #[serde(default)]
    pub description: String,
}

impl PhaseDefinition {
    pub fn covers_day(&self, day: u32) -> bool {
        self.start_day <= day && day <= self.end_day
    }

    /// Dose interval converted to whole minutes, truncated. Truncation (not
    /// rounding) keeps repeated additions free of sub-minute drift.
    pub fn interval_minutes(&self) -> i64 {
        (self.interval_hours * 60.0) as i64
    }

    pub fn special_event_for_day(&self, day: u32) -> Option<&str> {
        self.special_events.get(&day).map(String::as_str)
    }
}

/// Ordered, non-overlapping day-range to phase mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTable {
    pub phases: Vec<PhaseDefinition>,
}

impl PhaseTable {
    /// Build a table from phase definitions, validating contiguity.
    pub fn new(phases: Vec<PhaseDefinition>) -> Result<Self, ConfigError> {
        let table = Self { phases };
        table.validate()?;
        Ok(table)
    }

    /// The standard five-phase, 25-day course.
    pub fn standard() -> Self {
        Self {
            phases: vec![
                PhaseDefinition {
                    number: 1,
                    start_day: 1,
                    end_day: 3,
                    interval_hours: 2.0,
                    doses_per_day: 6,
                    kind: PhaseKind::Initial,
                    special_events: BTreeMap::from([
                        (1, "Course start".to_string()),
                        (3, "Handover to intensive supervision".to_string()),
                    ]),
                    description: "Initial phase: 6 doses per day, every 2 hours.".to_string(),
                },
                PhaseDefinition {
                    number: 2,
                    start_day: 4,
                    end_day: 12,
                    interval_hours: 2.5,
                    doses_per_day: 5,
                    kind: PhaseKind::Intensive,
                    special_events: BTreeMap::from([
                        (5, "Full cessation day".to_string()),
                        (12, "End of intensive supervision".to_string()),
                    ]),
                    description: "Intensive phase: 5 doses per day, every 2.5 hours. \
                                  Day 5 is the mandatory full cessation day."
                        .to_string(),
                },
                PhaseDefinition {
                    number: 3,
                    start_day: 13,
                    end_day: 16,
                    interval_hours: 3.0,
                    doses_per_day: 4,
                    kind: PhaseKind::Reduction,
                    special_events: BTreeMap::new(),
                    description: "Reduction phase: 4 doses per day, every 3 hours.".to_string(),
                },
                PhaseDefinition {
                    number: 4,
                    start_day: 17,
                    end_day: 20,
                    interval_hours: 5.0,
                    doses_per_day: 3,
                    kind: PhaseKind::Minimal,
                    special_events: BTreeMap::new(),
                    description: "Minimal phase: 3 doses per day, every 5 hours.".to_string(),
                },
                PhaseDefinition {
                    number: 5,
                    start_day: 21,
                    end_day: 25,
                    interval_hours: 8.0,
                    doses_per_day: 2,
                    kind: PhaseKind::Completion,
                    special_events: BTreeMap::from([(25, "Course complete".to_string())]),
                    description: "Completion phase: 1-2 doses per day as needed.".to_string(),
                },
            ],
        }
    }

    /// Check that the day ranges partition `1..=total_days()` with no gaps
    /// or overlaps and every phase carries sane dosing parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let first = self.phases.first().ok_or(ConfigError::MissingDayOne)?;
        if first.start_day != 1 {
            return Err(ConfigError::MissingDayOne);
        }

        let mut prev: Option<&PhaseDefinition> = None;
        for phase in &self.phases {
            if phase.end_day < phase.start_day {
                return Err(ConfigError::InvertedRange {
                    phase: phase.number,
                    start: phase.start_day,
                    end: phase.end_day,
                });
            }
            if phase.interval_minutes() <= 0 {
                return Err(ConfigError::InvalidPhase {
                    phase: phase.number,
                    message: format!("interval {}h is below one minute", phase.interval_hours),
                });
            }
            if phase.doses_per_day == 0 {
                return Err(ConfigError::InvalidPhase {
                    phase: phase.number,
                    message: "doses_per_day must be positive".to_string(),
                });
            }
            if let Some(prev) = prev {
                if phase.start_day <= prev.end_day {
                    return Err(ConfigError::PhaseOverlap {
                        day: phase.start_day,
                        first: prev.number,
                        second: phase.number,
                    });
                }
                if phase.start_day != prev.end_day + 1 {
                    return Err(ConfigError::PhaseGap {
                        day: prev.end_day + 1,
                    });
                }
            }
            prev = Some(phase);
        }
        Ok(())
    }

    /// The phase covering `day`, or `None` once the regimen period has ended
    /// (callers treat `None` as "course finished"). Pure and total.
    pub fn phase_for_day(&self, day: u32) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.covers_day(day))
    }

    /// Total number of regimen days covered by the table.
    pub fn total_days(&self) -> u32 {
        self.phases.last().map(|p| p.end_day).unwrap_or(0)
    }

    pub fn special_event_for_day(&self, day: u32) -> Option<&str> {
        self.phase_for_day(day)?.special_event_for_day(day)
    }

    /// Day 5 is the fixed full cessation milestone.
    pub fn is_cessation_day(&self, day: u32) -> bool {
        day == CESSATION_DAY
    }

    /// Load a custom table from a TOML definition, validating it.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let table: Self = toml::from_str(s).map_err(|e| ConfigError::LoadFailed {
            path: "<inline>".into(),
            message: e.to_string(),
        })?;
        table.validate()?;
        Ok(table)
    }
}

impl Default for PhaseTable {
    fn default() -> Self {
        Self::standard()
    }
}
