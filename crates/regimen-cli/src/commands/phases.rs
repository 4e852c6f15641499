use clap::Subcommand;
use regimen_core::PhaseTable;

#[derive(Subcommand)]
pub enum PhasesAction {
    /// Print the standard phase table as JSON
    List,
    /// Show the phase covering a regimen day
    For {
        /// Regimen day (1-based)
        day: u32,
    },
    /// Validate a TOML phase table file
    Validate {
        /// Path to the TOML file
        path: String,
    },
}

pub fn run(action: PhasesAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        PhasesAction::List => {
            let table = PhaseTable::standard();
            println!("{}", serde_json::to_string_pretty(&table)?);
        }
        PhasesAction::For { day } => {
            let table = PhaseTable::standard();
            match table.phase_for_day(day) {
                Some(phase) => println!("{}", serde_json::to_string_pretty(phase)?),
                None => println!("{{\"day\": {day}, \"phase\": null}}"),
            }
        }
        PhasesAction::Validate { path } => {
            let raw = std::fs::read_to_string(&path)?;
            let table = PhaseTable::from_toml_str(&raw)?;
            println!(
                "{{\"valid\": true, \"phases\": {}, \"total_days\": {}}}",
                table.phases.len(),
                table.total_days()
            );
        }
    }
    Ok(())
}
