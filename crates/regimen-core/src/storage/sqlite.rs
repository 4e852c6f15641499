//! SQLite-backed course and dose record storage.
//!
//! Scheduled times are stored as `YYYY-MM-DD HH:MM` text, which gives the
//! minute-precision slot matching reconciliation depends on for free: the
//! stored key IS the minute key.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::course::{CourseStatus, TreatmentCourse};
use crate::dose::{DoseRecord, DoseStatus};
use crate::error::StoreError;
use crate::store::{CourseStore, DoseStore};

const MINUTE_FMT: &str = "%Y-%m-%d %H:%M";
const DATE_FMT: &str = "%Y-%m-%d";

/// SQLite store implementing both `CourseStore` and `DoseStore`.
///
/// The connection is behind a mutex so one store can be shared across the
/// per-subject scheduler tasks.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open the store at `~/.config/regimen/regimen.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    pub fn open() -> Result<Self, StoreError> {
        let path = super::data_dir()
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?
            .join("regimen.db");
        Self::open_at(&path)
    }

    /// Open the store at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.lock()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS treatment_courses (
                    id             INTEGER PRIMARY KEY AUTOINCREMENT,
                    subject_id     INTEGER NOT NULL,
                    start_date     TEXT NOT NULL,
                    current_phase  INTEGER NOT NULL DEFAULT 1,
                    status         TEXT NOT NULL DEFAULT 'active',
                    cessation_date TEXT,
                    created_at     TEXT NOT NULL,
                    updated_at     TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS dose_records (
                    id           INTEGER PRIMARY KEY AUTOINCREMENT,
                    course_id    INTEGER NOT NULL REFERENCES treatment_courses(id),
                    scheduled_at TEXT NOT NULL,
                    actual_at    TEXT,
                    status       TEXT NOT NULL DEFAULT 'scheduled',
                    phase        INTEGER NOT NULL,
                    created_at   TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_courses_subject_status
                    ON treatment_courses(subject_id, status);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_doses_course_slot
                    ON dose_records(course_id, scheduled_at);
                CREATE INDEX IF NOT EXISTS idx_doses_course_status
                    ON dose_records(course_id, status);",
            )
            .map_err(|e| StoreError::MigrationFailed(e.to_string()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-query; propagating the panic is
        // the only sound option left.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn row_to_course(row: &Row) -> rusqlite::Result<TreatmentCourse> {
    let start_date: String = row.get("start_date")?;
    let status: String = row.get("status")?;
    let cessation: Option<String> = row.get("cessation_date")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(TreatmentCourse {
        id: row.get("id")?,
        subject_id: row.get("subject_id")?,
        start_date: NaiveDate::parse_from_str(&start_date, DATE_FMT).unwrap_or_default(),
        current_phase: row.get("current_phase")?,
        status: CourseStatus::parse(&status).unwrap_or(CourseStatus::Failed),
        cessation_date: cessation.and_then(|s| NaiveDate::parse_from_str(&s, DATE_FMT).ok()),
        created_at: parse_utc(&created_at),
        updated_at: parse_utc(&updated_at),
    })
}

fn row_to_dose(row: &Row) -> rusqlite::Result<DoseRecord> {
    let scheduled_at: String = row.get("scheduled_at")?;
    let actual_at: Option<String> = row.get("actual_at")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    Ok(DoseRecord {
        id: row.get("id")?,
        course_id: row.get("course_id")?,
        scheduled_at: NaiveDateTime::parse_from_str(&scheduled_at, MINUTE_FMT)
            .unwrap_or_default(),
        actual_at: actual_at.and_then(|s| NaiveDateTime::parse_from_str(&s, MINUTE_FMT).ok()),
        status: DoseStatus::parse(&status).unwrap_or(DoseStatus::Missed),
        phase: row.get("phase")?,
        created_at: parse_utc(&created_at),
    })
}

fn parse_utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn minute_text(t: NaiveDateTime) -> String {
    t.format(MINUTE_FMT).to_string()
}

impl CourseStore for SqliteStore {
    fn get_active(&self, subject_id: i64) -> Result<Option<TreatmentCourse>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM treatment_courses WHERE subject_id = ?1 AND status = 'active'
             ORDER BY id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![subject_id], row_to_course)?;
        rows.next().transpose().map_err(StoreError::from)
    }

    fn find_latest(&self, subject_id: i64) -> Result<Option<TreatmentCourse>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM treatment_courses WHERE subject_id = ?1
             ORDER BY id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![subject_id], row_to_course)?;
        rows.next().transpose().map_err(StoreError::from)
    }

    fn create(&self, course: &TreatmentCourse) -> Result<TreatmentCourse, StoreError> {
        let conn = self.lock();
        let active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM treatment_courses WHERE subject_id = ?1 AND status = 'active'",
            params![course.subject_id],
            |row| row.get(0),
        )?;
        if active > 0 {
            return Err(StoreError::CourseConflict(course.subject_id));
        }
        conn.execute(
            "INSERT INTO treatment_courses
                 (subject_id, start_date, current_phase, status, cessation_date,
                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                course.subject_id,
                course.start_date.format(DATE_FMT).to_string(),
                course.current_phase,
                course.status.as_str(),
                course
                    .cessation_date
                    .map(|d| d.format(DATE_FMT).to_string()),
                course.created_at.to_rfc3339(),
                course.updated_at.to_rfc3339(),
            ],
        )?;
        let mut stored = course.clone();
        stored.id = conn.last_insert_rowid();
        Ok(stored)
    }

    fn update(&self, course: &TreatmentCourse) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE treatment_courses
             SET start_date = ?2, current_phase = ?3, status = ?4,
                 cessation_date = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                course.id,
                course.start_date.format(DATE_FMT).to_string(),
                course.current_phase,
                course.status.as_str(),
                course
                    .cessation_date
                    .map(|d| d.format(DATE_FMT).to_string()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

impl DoseStore for SqliteStore {
    fn create(&self, record: &DoseRecord) -> Result<DoseRecord, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO dose_records
                 (course_id, scheduled_at, actual_at, status, phase, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.course_id,
                minute_text(record.scheduled_at),
                record.actual_at.map(minute_text),
                record.status.as_str(),
                record.phase,
                record.created_at.to_rfc3339(),
            ],
        )?;
        let mut stored = record.clone();
        stored.id = conn.last_insert_rowid();
        Ok(stored)
    }

    fn find_by_course(&self, course_id: i64) -> Result<Vec<DoseRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM dose_records WHERE course_id = ?1 ORDER BY scheduled_at",
        )?;
        let rows = stmt.query_map(params![course_id], row_to_dose)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    fn find_by_slot(
        &self,
        course_id: i64,
        scheduled_at: NaiveDateTime,
    ) -> Result<Option<DoseRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM dose_records WHERE course_id = ?1 AND scheduled_at = ?2",
        )?;
        let mut rows = stmt.query_map(params![course_id, minute_text(scheduled_at)], row_to_dose)?;
        rows.next().transpose().map_err(StoreError::from)
    }

    fn update(&self, record: &DoseRecord) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE dose_records SET actual_at = ?2, status = ?3 WHERE id = ?1",
            params![
                record.id,
                record.actual_at.map(minute_text),
                record.status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn lapse_count(&self, course_id: i64) -> Result<u64, StoreError> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM dose_records
             WHERE course_id = ?1 AND status IN ('missed', 'skipped')",
            params![course_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course::CourseStatus;

    fn store() -> SqliteStore {
        SqliteStore::open_memory().unwrap()
    }

    fn course() -> TreatmentCourse {
        TreatmentCourse::begin(42, "2025-03-01".parse().unwrap())
    }

    #[test]
    fn create_and_get_active_course() {
        let store = store();
        let stored = CourseStore::create(&store, &course()).unwrap();
        assert!(stored.id > 0);

        let found = store.get_active(42).unwrap().unwrap();
        assert_eq!(found.id, stored.id);
        assert_eq!(found.start_date, stored.start_date);
        assert_eq!(found.current_phase, 1);
        assert_eq!(found.cessation_date, Some("2025-03-05".parse().unwrap()));
    }

    #[test]
    fn second_active_course_is_rejected() {
        let store = store();
        CourseStore::create(&store, &course()).unwrap();
        assert!(matches!(
            CourseStore::create(&store, &course()),
            Err(StoreError::CourseConflict(42))
        ));
    }

    #[test]
    fn new_course_allowed_once_prior_is_terminal() {
        let store = store();
        let mut first = CourseStore::create(&store, &course()).unwrap();
        first.set_status(CourseStatus::Failed);
        CourseStore::update(&store, &first).unwrap();
        assert!(store.get_active(42).unwrap().is_none());
        assert!(CourseStore::create(&store, &course()).is_ok());
    }

    #[test]
    fn dose_round_trip_and_slot_lookup() {
        let store = store();
        let course = CourseStore::create(&store, &course()).unwrap();
        let slot_time: NaiveDateTime = "2025-03-01T08:00:00".parse().unwrap();

        let record = DoseRecord::scheduled(course.id, slot_time, 1);
        let stored = DoseStore::create(&store, &record).unwrap();
        assert!(stored.id > 0);

        let found = store.find_by_slot(course.id, slot_time).unwrap().unwrap();
        assert_eq!(found.status, DoseStatus::Scheduled);

        // Sub-minute noise in the query key still matches the stored slot.
        let noisy: NaiveDateTime = "2025-03-01T08:00:42".parse().unwrap();
        assert!(store.find_by_slot(course.id, noisy).unwrap().is_some());

        assert!(store
            .find_by_slot(course.id, "2025-03-01T08:01:00".parse().unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn update_persists_transition() {
        let store = store();
        let course = CourseStore::create(&store, &course()).unwrap();
        let slot_time: NaiveDateTime = "2025-03-01T08:00:00".parse().unwrap();
        let mut record =
            DoseStore::create(&store, &DoseRecord::scheduled(course.id, slot_time, 1)).unwrap();

        record.mark_taken("2025-03-01T08:04:00".parse().unwrap());
        DoseStore::update(&store, &record).unwrap();

        let found = store.find_by_slot(course.id, slot_time).unwrap().unwrap();
        assert_eq!(found.status, DoseStatus::Taken);
        assert_eq!(found.actual_at, Some("2025-03-01T08:04:00".parse().unwrap()));
    }

    #[test]
    fn lapse_count_counts_missed_and_skipped() {
        let store = store();
        let course = CourseStore::create(&store, &course()).unwrap();
        let mut times = ["08:00", "10:00", "12:00", "14:00"].iter();

        let mut make = |status: DoseStatus| {
            let t: NaiveDateTime = format!("2025-03-01T{}:00", times.next().unwrap())
                .parse()
                .unwrap();
            let mut r = DoseRecord::scheduled(course.id, t, 1);
            match status {
                DoseStatus::Taken => {
                    r.mark_taken(t);
                }
                DoseStatus::Missed => {
                    r.mark_missed();
                }
                DoseStatus::Skipped => {
                    r.mark_skipped(t);
                }
                DoseStatus::Scheduled => {}
            }
            DoseStore::create(&store, &r).unwrap();
        };
        make(DoseStatus::Taken);
        make(DoseStatus::Missed);
        make(DoseStatus::Skipped);
        make(DoseStatus::Scheduled);

        assert_eq!(store.lapse_count(course.id).unwrap(), 2);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regimen.db");
        {
            let store = SqliteStore::open_at(&path).unwrap();
            let course = CourseStore::create(&store, &course()).unwrap();
            let mut record = DoseStore::create(
                &store,
                &DoseRecord::scheduled(course.id, "2025-03-01T08:00:00".parse().unwrap(), 1),
            )
            .unwrap();
            record.mark_taken("2025-03-01T08:02:00".parse().unwrap());
            DoseStore::update(&store, &record).unwrap();
        }

        let reopened = SqliteStore::open_at(&path).unwrap();
        let course = reopened.get_active(42).unwrap().unwrap();
        let records = reopened.find_by_course(course.id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DoseStatus::Taken);
    }

    #[test]
    fn find_by_course_is_time_ordered() {
        let store = store();
        let course = CourseStore::create(&store, &course()).unwrap();
        for t in ["2025-03-01T12:00:00", "2025-03-01T08:00:00", "2025-03-01T10:00:00"] {
            DoseStore::create(
                &store,
                &DoseRecord::scheduled(course.id, t.parse().unwrap(), 1),
            )
            .unwrap();
        }
        let records = store.find_by_course(course.id).unwrap();
        let times: Vec<_> = records.iter().map(|r| r.scheduled_at).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
    }
}
