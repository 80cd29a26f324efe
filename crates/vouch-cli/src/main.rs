//! vouch - audit ledger command line tool.
//!
//! Reads the ledger to verify integrity, inspect runs and events, resolve
//! stalled actions through the proxy's control API, and export forensic
//! bundles.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// vouch - audit ledger tool
#[derive(Parser, Debug)]
#[command(name = "vouch")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the ledger database
    #[arg(long, default_value = "vouch.db")]
    db: PathBuf,

    /// Base URL of the proxy control API
    #[arg(long, default_value = "http://127.0.0.1:9998")]
    control: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the entire hash chain
    Verify,

    /// Show current run information
    Status,

    /// List recent events
    Events {
        /// Number of events to show
        #[arg(short = 'n', long, default_value = "10")]
        limit: u64,
    },

    /// Approve a stalled action
    Approve {
        /// Event id of the stalled action
        event_id: String,
    },

    /// Reject a stalled action
    Reject {
        /// Event id of the stalled action
        event_id: String,
    },

    /// Rotate the signing key
    Rekey,

    /// Export a forensic bundle (events, run metadata, verification report)
    Export {
        /// Directory the bundle is written to
        out_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let result = match &cli.command {
        Commands::Verify => commands::verify::run(&cli.db),
        Commands::Status => commands::status::run(&cli.db).map(|()| ExitCode::SUCCESS),
        Commands::Events { limit } => {
            commands::events::run(&cli.db, *limit).map(|()| ExitCode::SUCCESS)
        },
        Commands::Approve { event_id } => commands::signal::run(&cli.control, event_id, true)
            .await
            .map(|()| ExitCode::SUCCESS),
        Commands::Reject { event_id } => commands::signal::run(&cli.control, event_id, false)
            .await
            .map(|()| ExitCode::SUCCESS),
        Commands::Rekey => commands::rekey::run(&cli.control)
            .await
            .map(|()| ExitCode::SUCCESS),
        Commands::Export { out_dir } => {
            commands::export::run(&cli.db, out_dir).map(|()| ExitCode::SUCCESS)
        },
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        },
    }
}
