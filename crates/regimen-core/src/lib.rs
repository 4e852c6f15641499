//! # Regimen Core Library
//!
//! This library provides the core engine for a phased medication regimen:
//! computing daily dose schedules from a phase table, reconciling overdue
//! doses after downtime, tracking per-dose outcomes through an idempotent
//! state machine, and running per-subject reminder loops. All decisions are
//! derived from persisted state so a restarted process picks up exactly
//! where the previous one left off, with delivery frontends (bots, CLIs)
//! as thin layers over the same library.
//!
//! ## Architecture
//!
//! - **Phase table**: The validated day-partition of the regimen, with
//!   per-phase dose counts and intervals
//! - **Schedule calculator**: Pure expansion of phase-days into ordered
//!   dose slots, and selection of the next due slot
//! - **Catch-up reconciler**: Re-derives the overdue backlog from records
//!   alone and drives the one-at-a-time interrogation session
//! - **Reminder scheduler**: Per-subject tokio loops with throttled
//!   notification, postponement, and auto-miss timers
//! - **Storage**: SQLite-backed course and dose record stores behind
//!   swappable traits, plus an in-memory store for tests
//!
//! ## Key Components
//!
//! - [`PhaseTable`]: Regimen structure and day-to-phase lookup
//! - [`ScheduleCalculator`]: Slot expansion and next-dose selection
//! - [`ReminderScheduler`]: The per-subject loop registry
//! - [`SqliteStore`]: Course and dose persistence

pub mod course;
pub mod dose;
pub mod error;
pub mod phase;
pub mod reconcile;
pub mod schedule;
pub mod scheduler;
pub mod storage;
pub mod store;

pub use course::{CourseStatus, TreatmentCourse};
pub use dose::{DoseRecord, DoseStatus};
pub use error::{ActionError, ConfigError, CoreError, DeliveryError, StoreError};
pub use phase::{PhaseDefinition, PhaseKind, PhaseTable, CESSATION_DAY};
pub use reconcile::{CatchUpAnswer, CatchUpReconciler, CatchUpSession};
pub use schedule::{DoseSlot, ScheduleCalculator};
pub use scheduler::{Clock, ReminderScheduler, SchedulerConfig, SystemClock};
pub use storage::{data_dir, MemoryStore, SqliteStore};
pub use store::{CourseStore, DoseNotice, DoseStore, NoticeKind, NotificationSink, SubjectAction};
