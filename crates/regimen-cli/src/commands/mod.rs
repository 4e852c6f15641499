pub mod course;
pub mod dose;
pub mod overdue;
pub mod phases;
pub mod run;
pub mod schedule;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// Parse "YYYY-MM-DD".
pub fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("invalid date '{s}': {e}"))
}

/// Parse "YYYY-MM-DD HH:MM".
pub fn parse_datetime(s: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
        .map_err(|e| format!("invalid datetime '{s}': {e}"))
}

/// Parse "HH:MM" via the engine's own parser.
pub fn parse_time(s: &str) -> Result<NaiveTime, String> {
    regimen_core::schedule::parse_first_dose_time(s).map_err(|e| e.to_string())
}
