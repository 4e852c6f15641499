use clap::Subcommand;
use regimen_core::{CourseStatus, CourseStore, SqliteStore, TreatmentCourse};

use super::parse_date;

#[derive(Subcommand)]
pub enum CourseAction {
    /// Begin a new treatment course for a subject
    Begin {
        /// Subject id
        subject: i64,
        /// Start date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        start: Option<String>,
    },
    /// Show the subject's active course
    Status {
        /// Subject id
        subject: i64,
    },
    /// Rewrite the start date of the active course (admin correction)
    SetStart {
        /// Subject id
        subject: i64,
        /// New start date (YYYY-MM-DD)
        start: String,
    },
    /// Pause the active course
    Pause {
        /// Subject id
        subject: i64,
    },
    /// Resume a paused course
    Resume {
        /// Subject id
        subject: i64,
    },
    /// Mark the active course failed (dropout)
    Fail {
        /// Subject id
        subject: i64,
    },
}

fn active(store: &SqliteStore, subject: i64) -> Result<TreatmentCourse, Box<dyn std::error::Error>> {
    Ok(store
        .get_active(subject)?
        .ok_or_else(|| format!("no active course for subject {subject}"))?)
}

pub fn run(action: CourseAction) -> Result<(), Box<dyn std::error::Error>> {
    let store = SqliteStore::open()?;
    match action {
        CourseAction::Begin { subject, start } => {
            let start = match start {
                Some(s) => parse_date(&s)?,
                None => chrono::Local::now().date_naive(),
            };
            let course = store.create(&TreatmentCourse::begin(subject, start))?;
            println!("{}", serde_json::to_string_pretty(&course)?);
        }
        CourseAction::Status { subject } => {
            let course = active(&store, subject)?;
            println!("{}", serde_json::to_string_pretty(&course)?);
        }
        CourseAction::SetStart { subject, start } => {
            let mut course = active(&store, subject)?;
            // Phase and schedule are re-derived from the new date on the
            // next scheduler pass; no record surgery happens here.
            course.rewrite_start_date(parse_date(&start)?);
            store.update(&course)?;
            println!("{}", serde_json::to_string_pretty(&course)?);
        }
        CourseAction::Pause { subject } => {
            let mut course = active(&store, subject)?;
            course.set_status(CourseStatus::Paused);
            store.update(&course)?;
            println!("{}", serde_json::to_string_pretty(&course)?);
        }
        CourseAction::Resume { subject } => {
            let mut course = store
                .find_latest(subject)?
                .filter(|c| c.status == CourseStatus::Paused)
                .ok_or_else(|| format!("no paused course for subject {subject}"))?;
            course.set_status(CourseStatus::Active);
            store.update(&course)?;
            println!("{}", serde_json::to_string_pretty(&course)?);
        }
        CourseAction::Fail { subject } => {
            let mut course = active(&store, subject)?;
            course.set_status(CourseStatus::Failed);
            store.update(&course)?;
            println!("{}", serde_json::to_string_pretty(&course)?);
        }
    }
    Ok(())
}
