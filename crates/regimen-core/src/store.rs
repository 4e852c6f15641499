//! Collaborator interfaces consumed by the engine.
//!
//! The persistence layer is the sole source of truth: the scheduler re-reads
//! the relevant course/record set for every decision and never caches dose
//! records across iterations, so concurrent external mutation (an admin
//! moving a start date, a reply arriving out of band) is picked up on the
//! next pass.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::course::TreatmentCourse;
use crate::dose::DoseRecord;
use crate::error::{DeliveryError, StoreError};
use crate::schedule::DoseSlot;

/// Course persistence. At most one `Active` course per subject; `create`
/// fails with `CourseConflict` while a prior course is still active.
pub trait CourseStore: Send + Sync {
    fn get_active(&self, subject_id: i64) -> Result<Option<TreatmentCourse>, StoreError>;
    /// Most recently created course for the subject, in any status.
    fn find_latest(&self, subject_id: i64) -> Result<Option<TreatmentCourse>, StoreError>;
    /// Insert and return the stored course with its assigned id.
    fn create(&self, course: &TreatmentCourse) -> Result<TreatmentCourse, StoreError>;
    fn update(&self, course: &TreatmentCourse) -> Result<(), StoreError>;
}

/// Dose record persistence. Slot matching is on `(course, date,
/// time-of-day)` at minute precision.
pub trait DoseStore: Send + Sync {
    /// Insert and return the stored record with its assigned id.
    fn create(&self, record: &DoseRecord) -> Result<DoseRecord, StoreError>;
    fn find_by_course(&self, course_id: i64) -> Result<Vec<DoseRecord>, StoreError>;
    fn find_by_slot(
        &self,
        course_id: i64,
        scheduled_at: NaiveDateTime,
    ) -> Result<Option<DoseRecord>, StoreError>;
    fn update(&self, record: &DoseRecord) -> Result<(), StoreError>;
    /// Read-only escalation aggregate: missed + skipped records for a
    /// course. The surrounding layer may use it to adjust messaging tone;
    /// the engine itself imposes no cap.
    fn lapse_count(&self, course_id: i64) -> Result<u64, StoreError>;
}

/// The subject-facing actions offered with every dose notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectAction {
    Acknowledge,
    Postpone,
    Decline,
}

/// Delivery style for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    /// A slot has come due on schedule.
    Due,
    /// A deferred re-notification of the same slot after a postponement.
    Postponed,
}

/// What the engine hands to the notification sink. Persona copy and payload
/// shape are the caller's concern; the engine only supplies the facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoseNotice {
    pub slot: DoseSlot,
    pub kind: NoticeKind,
    /// Regimen day the slot belongs to.
    pub day: u32,
    /// Day-keyed annotation from the phase table, when one exists.
    pub special_event: Option<String>,
}

impl DoseNotice {
    pub fn actions(&self) -> [SubjectAction; 3] {
        [
            SubjectAction::Acknowledge,
            SubjectAction::Postpone,
            SubjectAction::Decline,
        ]
    }
}

/// Outbound notification delivery. The engine logs and absorbs failures; a
/// failed delivery is retried only by virtue of the next loop iteration
/// falling outside the throttle window.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, subject_id: i64, notice: &DoseNotice) -> Result<(), DeliveryError>;
}
