//! Integration tests against real git repositories.
//!
//! A local directory stands in for the remote host: `CliClientFactory` is
//! pointed at it with `remote_base`, so no network access is needed. The
//! tests still require a `git` binary and are gated behind the
//! `integration-tests` feature.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::setup_remote;

use inrepo_config::cache::GitClientCache;
use inrepo_config::git::{CliClientFactory, MergeStrategy};
use inrepo_config::policy::{CentralConfig, MergePolicy};
use inrepo_config::{ConfigFetcher, RepoId};
use tempfile::TempDir;

fn fetcher(remotes: &Path, cache_dir: &Path) -> (ConfigFetcher, Arc<GitClientCache>) {
    let factory = Arc::new(CliClientFactory::new(
        remotes.to_string_lossy().to_string(),
        cache_dir,
    ));
    let cache = Arc::new(GitClientCache::new(factory));
    let fetcher = ConfigFetcher::new(Arc::new(CentralConfig::default()))
        .with_factory(cache.clone());
    (fetcher, cache)
}

fn presubmit_names(config: &inrepo_config::config::InRepoConfig) -> Vec<&str> {
    config.presubmits.iter().map(|p| p.name.as_str()).collect()
}

#[test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
fn test_fetch_base_only() {
    let remotes = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let (base, _) = setup_remote(remotes.path());
    let (fetcher, _) = fetcher(remotes.path(), cache_dir.path());

    let config = fetcher.get_raw("org/repo", &base, &[]).unwrap();
    assert_eq!(presubmit_names(&config), vec!["pull-unit"]);
}

#[test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
fn test_fetch_merges_head() {
    let remotes = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let (base, head) = setup_remote(remotes.path());
    let (fetcher, cache) = fetcher(remotes.path(), cache_dir.path());

    let config = fetcher.get_with_defaults("org/repo", &base, &[head.as_str()]).unwrap();
    assert_eq!(presubmit_names(&config), vec!["pull-unit", "pull-e2e"]);
    assert_eq!(config.presubmits[1].cluster, "default");

    // The cached tree is reused and reset for the next request.
    let config = fetcher.get_raw("org/repo", &base, &[]).unwrap();
    assert_eq!(presubmit_names(&config), vec!["pull-unit"]);
    assert_eq!(cache.len().unwrap(), 1);
}

#[test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
fn test_unknown_head_is_dropped() {
    let remotes = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let (base, _) = setup_remote(remotes.path());
    let (fetcher, _) = fetcher(remotes.path(), cache_dir.path());

    let missing = "0123456789abcdef0123456789abcdef01234567";
    let config = fetcher.get_raw("org/repo", &base, &[missing]).unwrap();
    assert_eq!(presubmit_names(&config), vec!["pull-unit"]);
}

#[test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
fn test_unknown_base_fails() {
    let remotes = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    setup_remote(remotes.path());
    let (fetcher, cache) = fetcher(remotes.path(), cache_dir.path());

    let missing = "0123456789abcdef0123456789abcdef01234567";
    let err = fetcher.get_raw("org/repo", missing, &[]).unwrap_err();
    assert!(err.to_string().contains("failed to fetch base commit"));

    // The failure released the tree.
    assert!(cache.acquire(&RepoId::new("org", "repo")).is_ok());
}

#[test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
fn test_squash_strategy_from_policy() {
    let remotes = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let (base, head) = setup_remote(remotes.path());
    let central = CentralConfig::parse("merge_method:\n  org/repo: squash\n").unwrap();
    assert_eq!(
        central.merge_strategy(&RepoId::new("org", "repo")),
        MergeStrategy::Squash
    );
    let (fetcher, _) = fetcher(remotes.path(), cache_dir.path());
    let fetcher = fetcher.with_merge_policy(Arc::new(central));

    let config = fetcher.get_raw("org/repo", &base, &[head.as_str()]).unwrap();
    assert_eq!(presubmit_names(&config), vec!["pull-unit", "pull-e2e"]);
}

#[test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
fn test_missing_remote_fails_to_clone() {
    let remotes = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let (fetcher, cache) = fetcher(remotes.path(), cache_dir.path());

    let err = fetcher.get_raw("org/missing", "HEAD", &[]).unwrap_err();
    assert!(err
        .to_string()
        .starts_with("failed to clone repo for \"org/missing\""));
    assert!(cache.is_empty().unwrap());
}
