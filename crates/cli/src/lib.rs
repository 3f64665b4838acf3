pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "expensa",
    about = "Expensa operator CLI",
    long_about = "Operate the Expensa approval engine: migrations, demo data, config inspection, offline evaluation, and ledger verification.",
    after_help = "Examples:\n  expensa doctor --json\n  expensa evaluate plan.json\n  expensa verify 3f0c2a9e-5d1b-4c47-9a7e-0b6f2f8e1d2c"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the deterministic demo company, users, rules and flows")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, signing key readiness, and DB connectivity checks")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Evaluate a plan and its decisions from a JSON file without touching the database")]
    Evaluate {
        #[arg(help = "Path to a JSON document with `plan` and `decisions`")]
        file: PathBuf,
    },
    #[command(about = "Verify the signed ledger chain of one expense")]
    Verify {
        #[arg(help = "Expense identifier")]
        expense_id: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => commands::config::run(),
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Evaluate { file } => commands::evaluate::run(&file),
        Command::Verify { expense_id } => commands::verify::run(&expense_id),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
