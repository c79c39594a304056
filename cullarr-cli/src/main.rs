//! Cullarr CLI - Command-line interface
//!
//! Unmonitors or deletes Sonarr series that are fully available on the
//! user's streaming subscriptions.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use cullarr_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "cullarr")]
#[command(about = "Trim Sonarr series that your streaming subscriptions already cover")]
#[command(version)]
struct Cli {
    /// Console log verbosity
    #[arg(long, global = true, default_value_t = CliLogLevel::Warn)]
    log_level: CliLogLevel,

    /// Directory for the full debug log
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref()) {
        eprintln!("Warning: could not initialize logging: {err}");
    }

    match commands::handle_command(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
