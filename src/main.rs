//! # In-Repo Config CLI
//!
//! This is the binary entry point for the `inrepo-config` command-line tool.
//!
//! Its primary responsibilities are:
//! - Parsing command-line arguments using `clap`.
//! - Setting up logging from the global `--log-level` flag.
//! - Executing the selected command and reporting top-level errors.
//!
//! All loading, merging and validation logic lives in the library crate.

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    cli.execute()
}
