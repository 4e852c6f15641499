use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "regimen-cli", version, about = "Regimen dosing engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Phase table inspection and validation
    Phases {
        #[command(subcommand)]
        action: commands::phases::PhasesAction,
    },
    /// Dose schedule queries
    Schedule {
        #[command(subcommand)]
        action: commands::schedule::ScheduleAction,
    },
    /// Overdue backlog reconciliation
    Overdue {
        #[command(subcommand)]
        action: commands::overdue::OverdueAction,
    },
    /// Treatment course lifecycle
    Course {
        #[command(subcommand)]
        action: commands::course::CourseAction,
    },
    /// Dose record actions
    Dose {
        #[command(subcommand)]
        action: commands::dose::DoseAction,
    },
    /// Run the reminder loop in the foreground
    Run(commands::run::RunArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Phases { action } => commands::phases::run(action),
        Commands::Schedule { action } => commands::schedule::run(action),
        Commands::Overdue { action } => commands::overdue::run(action),
        Commands::Course { action } => commands::course::run(action),
        Commands::Dose { action } => commands::dose::run(action),
        Commands::Run(args) => commands::run::run(args),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
