//! Core error types for regimen-core.
//!
//! The hierarchy separates the three failure classes the engine cares about:
//! fatal configuration errors (malformed phase table), recoverable store or
//! delivery errors (absorbed by the reminder loop), and invalid-input errors
//! reported back to the caller.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for regimen-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration errors. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Persistence errors.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Notification delivery errors.
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Invalid subject action.
    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors with context
    #[error("{0}")]
    Custom(String),
}

/// Configuration-specific errors. All of these are fatal at startup; they
/// must never be swallowed into a default table.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Phase day ranges do not form a contiguous partition.
    #[error("Phase table gap: day {day} is not covered by any phase")]
    PhaseGap { day: u32 },

    /// Two phases claim the same day.
    #[error("Phase table overlap: day {day} is covered by phases {first} and {second}")]
    PhaseOverlap { day: u32, first: u8, second: u8 },

    /// A phase's day range is inverted.
    #[error("Phase {phase}: day range {start}..={end} is inverted")]
    InvertedRange { phase: u8, start: u32, end: u32 },

    /// A phase has a non-positive interval or dose count.
    #[error("Phase {phase}: {message}")]
    InvalidPhase { phase: u8, message: String },

    /// The table is empty or does not start at day 1.
    #[error("Phase table must cover days starting at day 1")]
    MissingDayOne,

    /// Failed to load a table definition from disk.
    #[error("Failed to load phase table from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// A first-dose time string is not `HH:MM`.
    #[error("Invalid first-dose time '{0}': expected HH:MM")]
    InvalidFirstDoseTime(String),
}

/// Persistence errors. The reminder loop treats these as "try again next
/// iteration"; callers outside the loop propagate them.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Database is locked
    #[error("Database is locked")]
    Locked,

    /// A subject already has an active course.
    #[error("Subject {0} already has an active course")]
    CourseConflict(i64),
}

/// Notification delivery errors, produced by `NotificationSink`
/// implementations. The loop logs and absorbs them.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Delivery to subject {subject} failed: {message}")]
    Failed { subject: i64, message: String },
}

/// Errors for subject-driven actions arriving out of band.
#[derive(Error, Debug)]
pub enum ActionError {
    /// The named slot has no record for this course. No state change.
    #[error("No dose record for course {course} at {scheduled_at}")]
    SlotNotFound {
        course: i64,
        scheduled_at: chrono::NaiveDateTime,
    },

    /// The subject has no running reminder loop.
    #[error("No active reminder loop for subject {0}")]
    SubjectNotRunning(i64),

    /// Postponement is only admitted for the most recent overdue slot.
    #[error("Only the most recent overdue slot may be postponed")]
    PostponeNotLast,

    /// Postpone with no dose notified yet.
    #[error("No notified dose pending for subject {0}")]
    NothingToPostpone(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(err, _msg) => {
                if err.code == rusqlite::ErrorCode::DatabaseLocked {
                    StoreError::Locked
                } else {
                    StoreError::QueryFailed(err.to_string())
                }
            }
            _ => StoreError::QueryFailed(err.to_string()),
        }
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
