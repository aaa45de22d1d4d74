//! # Fetch Command Implementation
//!
//! This module implements the `fetch` subcommand, which runs the full fetch
//! pipeline for one or more repositories: acquire a cached working tree, fetch
//! the base and head commits, merge, and parse.
//!
//! Several identifiers are fetched in parallel with `rayon` through one shared
//! `GitClientCache`, so repeated runs against the same cache directory reuse
//! mirrors and clones.

use anyhow::{anyhow, Context, Result};
use clap::{Args, ValueEnum};
use log::{debug, error, info};
use rayon::prelude::*;
use prometheus::Registry;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use inrepo_config::cache::GitClientCache;
use inrepo_config::config::InRepoConfig;
use inrepo_config::git::CliClientFactory;
use inrepo_config::metrics::{self, HistogramRecorder};
use inrepo_config::policy::CentralConfig;
use inrepo_config::{ConfigFetcher, RepoId};

/// Output encoding for fetched configs
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Yaml,
    Json,
}

/// Fetch in-repo config for repositories at a base and head commits
#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Repository identifiers (`org/repo`, or `https://host/repo` for Gerrit).
    #[arg(value_name = "IDENTIFIER", required = true)]
    pub identifiers: Vec<String>,

    /// Base commit SHA the heads are merged onto.
    #[arg(long, value_name = "SHA")]
    pub base: String,

    /// Head commit SHA to merge; may be given several times.
    #[arg(long = "head", value_name = "SHA")]
    pub heads: Vec<String>,

    /// Print the config as found, without defaulting or validation.
    #[arg(long)]
    pub raw: bool,

    /// Central configuration file. Built-in defaults are used without it.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// The root directory for mirrors and working trees.
    ///
    /// Defaults to the system cache directory (`~/.cache/inrepo-config` on
    /// Linux).
    #[arg(long, value_name = "DIR", env = "INREPO_CONFIG_CACHE")]
    pub cache_dir: Option<PathBuf>,

    /// Base URL that `org/repo` identifiers are resolved against.
    #[arg(
        long,
        value_name = "URL",
        env = "INREPO_CONFIG_REMOTE",
        default_value = "https://github.com"
    )]
    pub remote_base: String,

    /// Output format.
    #[arg(long, value_enum, default_value = "yaml")]
    pub output: OutputFormat,

    /// Write fetch timings in the Prometheus text format to this file.
    #[arg(long, value_name = "FILE")]
    pub metrics_file: Option<PathBuf>,
}

fn default_cache_dir() -> Result<PathBuf> {
    dirs::cache_dir()
        .map(|dir| dir.join("inrepo-config"))
        .ok_or_else(|| anyhow!("no cache directory on this platform; pass --cache-dir"))
}

/// Execute the `fetch` command.
pub fn execute(args: FetchArgs) -> Result<()> {
    let cache_dir = match args.cache_dir {
        Some(dir) => dir,
        None => default_cache_dir()?,
    };
    let central = match &args.config {
        Some(path) => CentralConfig::from_file(path)?,
        None => CentralConfig::default(),
    };
    info!("Using cache directory {}", cache_dir.display());

    let factory = Arc::new(CliClientFactory::new(args.remote_base.as_str(), cache_dir));
    let cache = Arc::new(GitClientCache::new(factory));
    let registry = Registry::new();
    let recorder = Arc::new(HistogramRecorder::new(&registry)?);
    let fetcher = ConfigFetcher::new(Arc::new(central))
        .with_factory(cache)
        .with_recorder(recorder.clone());

    let heads: Vec<&str> = args.heads.iter().map(String::as_str).collect();
    let results: Vec<(String, inrepo_config::Result<InRepoConfig>)> = args
        .identifiers
        .par_iter()
        .map(|identifier| {
            let result = if args.raw {
                fetcher.get_raw(identifier, &args.base, &heads)
            } else {
                fetcher.get_with_defaults(identifier, &args.base, &heads)
            };
            (identifier.clone(), result)
        })
        .collect();

    let mut configs = BTreeMap::new();
    let mut failures = 0;
    for (identifier, result) in results {
        match result {
            Ok(config) => {
                if let Ok(id) = RepoId::parse(&identifier) {
                    let hist = recorder.acquisition(&id);
                    info!(
                        "{}: acquired working tree in {:.3}s",
                        id,
                        hist.get_sample_sum()
                    );
                }
                configs.insert(identifier, config);
            }
            Err(e) => {
                error!("{}: {}", identifier, e);
                eprintln!("Failed to fetch config for {}: {}", identifier, e);
                failures += 1;
            }
        }
    }

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&configs)?);
        }
        OutputFormat::Yaml => {
            for (identifier, config) in &configs {
                println!("# {}", identifier);
                print!(
                    "{}",
                    config
                        .to_yaml()
                        .with_context(|| format!("failed to render config for {identifier}"))?
                );
            }
        }
    }

    let exposition = metrics::encode_text(&registry)?;
    match &args.metrics_file {
        Some(path) => fs::write(path, exposition)
            .with_context(|| format!("failed to write metrics to {}", path.display()))?,
        None => debug!("Fetch metrics:\n{}", exposition),
    }

    if failures > 0 {
        return Err(anyhow!(
            "failed to fetch config for {} of {} repositories",
            failures,
            args.identifiers.len()
        ));
    }
    Ok(())
}
