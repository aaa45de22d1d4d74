//! # Touches Command Implementation
//!
//! Prints whether any of the given repository-relative paths could be in-repo
//! config. Callers use it to skip loading config for changes that cannot
//! affect jobs. The answer may be a false positive, never a false negative.

use anyhow::Result;
use clap::Args;

use inrepo_config::loader;

/// Report whether changed files could touch in-repo config
#[derive(Args, Debug)]
pub struct TouchesArgs {
    /// Changed files, relative to the repository root.
    #[arg(value_name = "FILE")]
    pub files: Vec<String>,
}

/// Execute the `touches` command.
pub fn execute(args: TouchesArgs) -> Result<()> {
    println!("{}", loader::contains_config_path(&args.files));
    Ok(())
}
