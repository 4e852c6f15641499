//! In-memory store used by tests and examples.
//!
//! Same contract as the SQLite store, including one-active-course-per-subject
//! enforcement and minute-precision slot matching.

use std::sync::Mutex;

use chrono::NaiveDateTime;

use crate::course::{CourseStatus, TreatmentCourse};
use crate::dose::{DoseRecord, DoseStatus};
use crate::error::StoreError;
use crate::reconcile::minute_key;
use crate::store::{CourseStore, DoseStore};

#[derive(Default)]
struct Inner {
    courses: Vec<TreatmentCourse>,
    doses: Vec<DoseRecord>,
    next_course_id: i64,
    next_dose_id: i64,
}

/// Mutex-guarded vectors standing in for the database.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CourseStore for MemoryStore {
    fn get_active(&self, subject_id: i64) -> Result<Option<TreatmentCourse>, StoreError> {
        Ok(self
            .lock()
            .courses
            .iter()
            .rev()
            .find(|c| c.subject_id == subject_id && c.status == CourseStatus::Active)
            .cloned())
    }

    fn find_latest(&self, subject_id: i64) -> Result<Option<TreatmentCourse>, StoreError> {
        Ok(self
            .lock()
            .courses
            .iter()
            .rev()
            .find(|c| c.subject_id == subject_id)
            .cloned())
    }

    fn create(&self, course: &TreatmentCourse) -> Result<TreatmentCourse, StoreError> {
        let mut inner = self.lock();
        if inner
            .courses
            .iter()
            .any(|c| c.subject_id == course.subject_id && c.status == CourseStatus::Active)
        {
            return Err(StoreError::CourseConflict(course.subject_id));
        }
        inner.next_course_id += 1;
        let mut stored = course.clone();
        stored.id = inner.next_course_id;
        inner.courses.push(stored.clone());
        Ok(stored)
    }

    fn update(&self, course: &TreatmentCourse) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner.courses.iter_mut().find(|c| c.id == course.id) {
            Some(slot) => {
                *slot = course.clone();
                Ok(())
            }
            None => Err(StoreError::QueryFailed(format!(
                "course {} not found",
                course.id
            ))),
        }
    }
}

impl DoseStore for MemoryStore {
    fn create(&self, record: &DoseRecord) -> Result<DoseRecord, StoreError> {
        let mut inner = self.lock();
        let key = minute_key(record.scheduled_at);
        if inner
            .doses
            .iter()
            .any(|d| d.course_id == record.course_id && minute_key(d.scheduled_at) == key)
        {
            return Err(StoreError::QueryFailed(format!(
                "duplicate slot {} for course {}",
                record.scheduled_at, record.course_id
            )));
        }
        inner.next_dose_id += 1;
        let mut stored = record.clone();
        stored.id = inner.next_dose_id;
        stored.scheduled_at = key;
        inner.doses.push(stored.clone());
        Ok(stored)
    }

    fn find_by_course(&self, course_id: i64) -> Result<Vec<DoseRecord>, StoreError> {
        let mut records: Vec<DoseRecord> = self
            .lock()
            .doses
            .iter()
            .filter(|d| d.course_id == course_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.scheduled_at);
        Ok(records)
    }

    fn find_by_slot(
        &self,
        course_id: i64,
        scheduled_at: NaiveDateTime,
    ) -> Result<Option<DoseRecord>, StoreError> {
        let key = minute_key(scheduled_at);
        Ok(self
            .lock()
            .doses
            .iter()
            .find(|d| d.course_id == course_id && minute_key(d.scheduled_at) == key)
            .cloned())
    }

    fn update(&self, record: &DoseRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner.doses.iter_mut().find(|d| d.id == record.id) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(StoreError::QueryFailed(format!(
                "dose record {} not found",
                record.id
            ))),
        }
    }

    fn lapse_count(&self, course_id: i64) -> Result<u64, StoreError> {
        Ok(self
            .lock()
            .doses
            .iter()
            .filter(|d| {
                d.course_id == course_id
                    && matches!(d.status, DoseStatus::Missed | DoseStatus::Skipped)
            })
            .count() as u64)
    }
}
