pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "routewise",
    about = "Routewise operator CLI",
    long_about = "Operate approval routing: migrations, readiness checks, config inspection, org hierarchy sync and escalation sweeps.",
    after_help = "Examples:\n  routewise doctor --json\n  routewise org-sync --dry-run\n  routewise escalate\n  routewise picker --mode approvals"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution"
    )]
    Config,
    #[command(about = "Validate config, escalation settings, DB connectivity and schema version")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Project legacy org units and assignments onto the org node hierarchy")]
    OrgSync {
        #[arg(long, help = "Report what would change without writing")]
        dry_run: bool,
    },
    #[command(about = "Run one escalation sweep, honouring the persisted throttle window")]
    Escalate,
    #[command(about = "Print the org node picker tree for one consuming mode")]
    Picker {
        #[arg(long, default_value = "all", help = "approvals, routing, chart or all")]
        mode: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::OrgSync { dry_run } => commands::org_sync::run(dry_run),
        Command::Escalate => commands::escalate::run(),
        Command::Picker { mode } => commands::picker::run(&mode),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
