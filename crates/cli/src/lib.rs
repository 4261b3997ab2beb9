pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "loadout",
    about = "Loadout operator CLI",
    long_about = "Inspect presets, run readiness checks, apply migrations and seed demo data.",
    after_help = "Examples:\n  loadout doctor --json\n  loadout presets --industry saas"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Run startup preflight checks and return structured status output")]
    Start,
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the demo tenant with its loadouts and contacts")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, provider readiness and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "List or search industry presets")]
    Presets {
        #[arg(long, help = "Free-text match on id, name, description or tags")]
        query: Option<String>,
        #[arg(long, help = "Restrict results to one industry")]
        industry: Option<String>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Start => commands::start::run(),
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Presets { query, industry } => {
            commands::presets::run(query.as_deref().unwrap_or(""), industry.as_deref())
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
