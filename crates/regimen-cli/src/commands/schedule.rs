use clap::Subcommand;
use regimen_core::{
    CourseStore, DoseStore, PhaseTable, ScheduleCalculator, SqliteStore, TreatmentCourse,
};

use super::{parse_date, parse_datetime, parse_time};

#[derive(Subcommand)]
pub enum ScheduleAction {
    /// Expand one regimen day into dose slots
    Day {
        /// Regimen day (1-based)
        day: u32,
        /// Course start date (YYYY-MM-DD)
        #[arg(long)]
        start: String,
        /// First dose time of day (HH:MM)
        #[arg(long, default_value = "08:00")]
        first_dose: String,
    },
    /// Next due dose for a subject's active course
    Next {
        /// Subject id
        subject: i64,
        /// First dose time of day (HH:MM)
        #[arg(long, default_value = "08:00")]
        first_dose: String,
        /// Evaluate as of this instant (YYYY-MM-DD HH:MM); defaults to now
        #[arg(long)]
        as_of: Option<String>,
    },
}

pub fn run(action: ScheduleAction) -> Result<(), Box<dyn std::error::Error>> {
    let calc = ScheduleCalculator::new(PhaseTable::standard());
    match action {
        ScheduleAction::Day {
            day,
            start,
            first_dose,
        } => {
            let course = TreatmentCourse::begin(0, parse_date(&start)?);
            let slots = calc.day_schedule(&course, parse_time(&first_dose)?, day);
            println!("{}", serde_json::to_string_pretty(&slots)?);
        }
        ScheduleAction::Next {
            subject,
            first_dose,
            as_of,
        } => {
            let store = SqliteStore::open()?;
            let course = store
                .get_active(subject)?
                .ok_or_else(|| format!("no active course for subject {subject}"))?;
            let records = store.find_by_course(course.id)?;
            let as_of = match as_of {
                Some(s) => parse_datetime(&s)?,
                None => chrono::Local::now().naive_local(),
            };
            let next = calc.next_dose_slot(&course, parse_time(&first_dose)?, &records, as_of);
            println!("{}", serde_json::to_string_pretty(&next)?);
        }
    }
    Ok(())
}
