//! CLI argument parsing and command dispatch

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands;

/// In-repo config - Load and verify CI jobs stored inside repositories
#[derive(Parser, Debug)]
#[command(name = "inrepo-config")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL", default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse and optionally validate the in-repo config of a checked out tree
    Check(commands::check::CheckArgs),

    /// Fetch in-repo config for repositories at a base and head commits
    Fetch(commands::fetch::FetchArgs),

    /// Report whether changed files could touch in-repo config
    Touches(commands::touches::TouchesArgs),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> Result<()> {
        // A logger may already be installed when running under a test harness.
        let _ = env_logger::Builder::new()
            .parse_filters(&self.log_level)
            .format_timestamp(None)
            .try_init();

        match self.command {
            Commands::Check(args) => commands::check::execute(args),
            Commands::Fetch(args) => commands::fetch::execute(args),
            Commands::Touches(args) => commands::touches::execute(args),
        }
    }
}
