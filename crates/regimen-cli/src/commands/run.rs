use std::sync::Arc;

use clap::Args;
use log::info;
use regimen_core::{
    CourseStore, DeliveryError, DoseNotice, DoseStore, NotificationSink, PhaseTable,
    ReminderScheduler, ScheduleCalculator, SqliteStore,
};

use super::parse_time;

#[derive(Args)]
pub struct RunArgs {
    /// Subject id to run the reminder loop for
    pub subject: i64,
    /// First dose time of day (HH:MM)
    #[arg(long, default_value = "08:00")]
    pub first_dose: String,
}

/// Console sink: one JSON line per notification.
struct StdoutSink;

#[async_trait::async_trait]
impl NotificationSink for StdoutSink {
    async fn notify(&self, subject_id: i64, notice: &DoseNotice) -> Result<(), DeliveryError> {
        let json = serde_json::to_string(notice).map_err(|e| DeliveryError::Failed {
            subject: subject_id,
            message: e.to_string(),
        })?;
        println!("{json}");
        Ok(())
    }
}

pub fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let first_dose = parse_time(&args.first_dose)?;
    let store = Arc::new(SqliteStore::open()?);
    store
        .get_active(args.subject)?
        .ok_or_else(|| format!("no active course for subject {}", args.subject))?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let scheduler = ReminderScheduler::new(
            ScheduleCalculator::new(PhaseTable::standard()),
            Arc::clone(&store) as Arc<dyn CourseStore>,
            Arc::clone(&store) as Arc<dyn DoseStore>,
            Arc::new(StdoutSink) as Arc<dyn NotificationSink>,
        );
        scheduler.start(args.subject, first_dose);
        info!("reminder loop running for subject {}; Ctrl-C to stop", args.subject);

        tokio::signal::ctrl_c().await?;
        scheduler.stop(args.subject);
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;
    Ok(())
}
