use clap::Subcommand;
use regimen_core::{CourseStore, DoseStore, SqliteStore};

use super::parse_datetime;

#[derive(Subcommand)]
pub enum DoseAction {
    /// Acknowledge a dose as taken
    Take {
        /// Subject id
        subject: i64,
        /// Slot time (YYYY-MM-DD HH:MM)
        at: String,
    },
    /// Decline a dose
    Skip {
        /// Subject id
        subject: i64,
        /// Slot time (YYYY-MM-DD HH:MM)
        at: String,
    },
    /// List dose records for the active course
    List {
        /// Subject id
        subject: i64,
    },
    /// Missed plus skipped dose count for the active course
    Lapses {
        /// Subject id
        subject: i64,
    },
}

pub fn run(action: DoseAction) -> Result<(), Box<dyn std::error::Error>> {
    let store = SqliteStore::open()?;
    match action {
        DoseAction::Take { subject, at } => {
            let record = transition(&store, subject, &at, |r, now| r.mark_taken(now))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        DoseAction::Skip { subject, at } => {
            let record = transition(&store, subject, &at, |r, now| r.mark_skipped(now))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        DoseAction::List { subject } => {
            let course = active(&store, subject)?;
            let records = store.find_by_course(course.id)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        DoseAction::Lapses { subject } => {
            let course = active(&store, subject)?;
            println!("{{\"lapses\": {}}}", store.lapse_count(course.id)?);
        }
    }
    Ok(())
}

fn active(
    store: &SqliteStore,
    subject: i64,
) -> Result<regimen_core::TreatmentCourse, Box<dyn std::error::Error>> {
    Ok(store
        .get_active(subject)?
        .ok_or_else(|| format!("no active course for subject {subject}"))?)
}

fn transition(
    store: &SqliteStore,
    subject: i64,
    at: &str,
    apply: impl FnOnce(&mut regimen_core::DoseRecord, chrono::NaiveDateTime) -> bool,
) -> Result<regimen_core::DoseRecord, Box<dyn std::error::Error>> {
    let course = active(store, subject)?;
    let slot = parse_datetime(at)?;
    let mut record = store
        .find_by_slot(course.id, slot)?
        .ok_or_else(|| format!("no dose record at {at} for subject {subject}"))?;
    if apply(&mut record, chrono::Local::now().naive_local()) {
        DoseStore::update(store, &record)?;
    }
    Ok(record)
}
