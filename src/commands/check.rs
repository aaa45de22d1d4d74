//! # Check Command Implementation
//!
//! This module implements the `check` subcommand, which parses the in-repo
//! config of an already checked out tree. It is what repository owners run
//! before pushing a change to their jobs.
//!
//! ## Functionality
//!
//! - **Parsing**: Reads `.prow/` or `.prow.yaml` exactly as the fetch pipeline
//!   does, honoring `.prowignore`. `--strict` also rejects unknown fields.
//! - **Validation**: With `--repo` and `--config`, the jobs are defaulted and
//!   validated against the central configuration, including the cluster
//!   allow-list and duplicates with the repository's static jobs.
//!
//! This command is read-only.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use inrepo_config::loader;
use inrepo_config::policy::CentralConfig;
use inrepo_config::validate;
use inrepo_config::RepoId;

/// Parse and optionally validate the in-repo config of a checked out tree
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Root of the checked out repository.
    #[arg(value_name = "DIR", default_value = ".")]
    pub dir: PathBuf,

    /// Reject fields that are not part of the config schema.
    #[arg(long)]
    pub strict: bool,

    /// Repository identifier (`org/repo`) to validate the jobs for.
    #[arg(long, value_name = "ORG/REPO", requires = "config")]
    pub repo: Option<String>,

    /// Central configuration file with defaults, static jobs and allowed
    /// clusters.
    #[arg(long, value_name = "FILE", requires = "repo")]
    pub config: Option<PathBuf>,
}

/// Execute the `check` command.
pub fn execute(args: CheckArgs) -> Result<()> {
    println!("Loading in-repo config from: {}", args.dir.display());
    let mut config = loader::read_config(&args.dir, args.strict)
        .with_context(|| format!("failed to load in-repo config from {}", args.dir.display()))?;

    println!("Configuration parsed successfully");
    println!("   Presets: {}", config.presets.len());
    println!("   Presubmits: {}", config.presubmits.len());
    println!("   Postsubmits: {}", config.postsubmits.len());

    if let (Some(repo), Some(central_path)) = (&args.repo, &args.config) {
        let repo = RepoId::parse(repo)?;
        let central = CentralConfig::from_file(central_path)?;
        validate::default_and_validate(&mut config, &central, &central, &repo)
            .with_context(|| format!("in-repo config is not valid for {repo}"))?;
        println!("Jobs are valid for {}", repo);
    }

    Ok(())
}
