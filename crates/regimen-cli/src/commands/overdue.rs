use clap::Subcommand;
use regimen_core::{
    CatchUpAnswer, CatchUpReconciler, CatchUpSession, CourseStore, DoseStore, PhaseTable,
    ScheduleCalculator, SqliteStore,
};

use super::{parse_datetime, parse_time};

#[derive(Subcommand)]
pub enum OverdueAction {
    /// List unresolved slots for a subject's active course
    List {
        /// Subject id
        subject: i64,
        /// First dose time of day (HH:MM)
        #[arg(long, default_value = "08:00")]
        first_dose: String,
        /// Evaluate as of this instant (YYYY-MM-DD HH:MM); defaults to now
        #[arg(long)]
        as_of: Option<String>,
    },
    /// Resolve the whole backlog in one pass, oldest first
    Resolve {
        /// Subject id
        subject: i64,
        /// Answer applied to every slot: taken or missed
        #[arg(long)]
        all: String,
        /// First dose time of day (HH:MM)
        #[arg(long, default_value = "08:00")]
        first_dose: String,
    },
}

pub fn run(action: OverdueAction) -> Result<(), Box<dyn std::error::Error>> {
    let calc = ScheduleCalculator::new(PhaseTable::standard());
    let store = SqliteStore::open()?;
    match action {
        OverdueAction::List {
            subject,
            first_dose,
            as_of,
        } => {
            let course = store
                .get_active(subject)?
                .ok_or_else(|| format!("no active course for subject {subject}"))?;
            let records = store.find_by_course(course.id)?;
            let as_of = match as_of {
                Some(s) => parse_datetime(&s)?,
                None => chrono::Local::now().naive_local(),
            };
            let slots = CatchUpReconciler::new(calc).overdue_slots(
                &course,
                parse_time(&first_dose)?,
                &records,
                as_of,
            );
            println!("{}", serde_json::to_string_pretty(&slots)?);
        }
        OverdueAction::Resolve {
            subject,
            all,
            first_dose,
        } => {
            let answer = match all.as_str() {
                "taken" => CatchUpAnswer::Taken,
                "missed" => CatchUpAnswer::Missed,
                other => return Err(format!("invalid answer '{other}'").into()),
            };
            let course = store
                .get_active(subject)?
                .ok_or_else(|| format!("no active course for subject {subject}"))?;
            let records = store.find_by_course(course.id)?;
            let now = chrono::Local::now().naive_local();
            let slots = CatchUpReconciler::new(calc).overdue_slots(
                &course,
                parse_time(&first_dose)?,
                &records,
                now,
            );
            let mut session = CatchUpSession::new(course.id, slots);
            let mut resolved = 0usize;
            while let Some(record) = session.resolve(answer) {
                match store.find_by_slot(course.id, record.scheduled_at)? {
                    Some(mut existing) => {
                        let changed = match answer {
                            CatchUpAnswer::Taken => existing.mark_taken(record.scheduled_at),
                            CatchUpAnswer::Missed => existing.mark_missed(),
                        };
                        if changed {
                            DoseStore::update(&store, &existing)?;
                        }
                    }
                    None => {
                        DoseStore::create(&store, &record)?;
                    }
                }
                resolved += 1;
            }
            println!("{{\"resolved\": {resolved}}}");
        }
    }
    Ok(())
}
