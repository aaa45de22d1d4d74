//! Defaulting and validation of a fetched in-repo config.

use log::debug;

use crate::config::InRepoConfig;
use crate::error::{Error, ErrorCollector, Result};
use crate::policy::{ClusterPolicy, JobPolicy};
use crate::repo_id::RepoId;

/// Applies defaults to every job in `config`, validates the jobs together
/// with the repository's static jobs, and checks each job's cluster against
/// the in-repo allow-list.
///
/// Defaulting and validation stop at the first failing step. Cluster
/// violations are all collected and returned as one `Error::Aggregate`.
/// Defaults stay applied to `config` even when an error is returned.
pub fn default_and_validate(
    config: &mut InRepoConfig,
    jobs: &dyn JobPolicy,
    clusters: &dyn ClusterPolicy,
    repo: &RepoId,
) -> Result<()> {
    jobs.default_presubmits(&mut config.presubmits, &config.presets, repo)?;
    jobs.default_postsubmits(&mut config.postsubmits, &config.presets, repo)?;

    let mut presubmits = config.presubmits.clone();
    presubmits.extend(jobs.static_presubmits(repo));
    jobs.validate_presubmits(&presubmits)?;

    let mut postsubmits = config.postsubmits.clone();
    postsubmits.extend(jobs.static_postsubmits(repo));
    jobs.validate_postsubmits(&postsubmits)?;

    let mut errors = ErrorCollector::new();
    let cluster_checks = config
        .presubmits
        .iter()
        .map(|job| &job.cluster)
        .chain(config.postsubmits.iter().map(|job| &job.cluster));
    for cluster in cluster_checks {
        if !clusters.allows_cluster(cluster, repo) {
            errors.push(Error::ClusterNotAllowed {
                cluster: cluster.clone(),
                repo: repo.to_string(),
            });
        }
    }

    if errors.is_empty() {
        debug!(
            "Successfully got {} presubmits and {} postsubmits for {}",
            config.presubmits.len(),
            config.postsubmits.len(),
            repo
        );
    }
    errors.into_result()
}
