//! # Fetch Pipeline
//!
//! `ConfigFetcher` turns a repository identifier, a base SHA and a list of
//! head SHAs into a parsed in-repo config:
//!
//! 1. Acquire a working tree from the client factory (usually a
//!    `GitClientCache`).
//! 2. Configure a committer identity so merges never prompt.
//! 3. Make sure the base and head commits exist locally, fetching as needed.
//!    A head that cannot be fetched is dropped with a warning.
//! 4. Check out the base and merge the heads with the repository's merge
//!    strategy (Gerrit repositories always use `ifNecessary`).
//! 5. Read the config from the working tree.
//!
//! The working tree is released on every path, and both the acquisition and
//! the processing time are reported to the configured `Recorder`.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, warn};

use crate::config::InRepoConfig;
use crate::error::{Error, Result, ResultExt};
use crate::git::{ClientFactory, MergeStrategy, RepoClient};
use crate::loader;
use crate::metrics::{NoopRecorder, Recorder};
use crate::policy::{ClusterPolicy, JobPolicy, MergePolicy};
use crate::repo_id::RepoId;
use crate::validate;

/// Makes `base` and every entry of `heads` available in the working tree.
///
/// Commits already present are not fetched again; `commit_exists` failures
/// count as absent. A base that cannot be fetched is an error. A head that
/// cannot be fetched is logged and left out of the returned list, which
/// keeps the order of `heads` otherwise.
pub fn ensure_commits<'a>(
    client: &dyn RepoClient,
    base: &str,
    heads: &[&'a str],
) -> Result<Vec<&'a str>> {
    if !client.commit_exists(base).unwrap_or(false) {
        debug!("Fetching base commit {}", base);
        client
            .fetch(&[base])
            .context("failed to fetch base commit")?;
    }

    let mut available = Vec::with_capacity(heads.len());
    for &head in heads {
        if client.commit_exists(head).unwrap_or(false) {
            available.push(head);
            continue;
        }
        match client.fetch(&[head]) {
            Ok(()) => available.push(head),
            Err(e) => warn!("Dropping head {} that could not be fetched: {}", head, e),
        }
    }
    Ok(available)
}

/// Fetches in-repo config for a repository at a base plus head commits.
#[derive(Clone)]
pub struct ConfigFetcher {
    factory: Option<Arc<dyn ClientFactory>>,
    merge_policy: Arc<dyn MergePolicy>,
    job_policy: Arc<dyn JobPolicy>,
    cluster_policy: Arc<dyn ClusterPolicy>,
    recorder: Arc<dyn Recorder>,
}

impl ConfigFetcher {
    /// Creates a fetcher whose policies all come from the same source, which
    /// is how a `CentralConfig` is normally used.
    pub fn new<P>(policy: Arc<P>) -> Self
    where
        P: MergePolicy + JobPolicy + ClusterPolicy + 'static,
    {
        Self {
            factory: None,
            merge_policy: policy.clone(),
            job_policy: policy.clone(),
            cluster_policy: policy,
            recorder: Arc::new(NoopRecorder),
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_merge_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_job_policy(mut self, policy: Arc<dyn JobPolicy>) -> Self {
        self.job_policy = policy;
        self
    }

    pub fn with_cluster_policy(mut self, policy: Arc<dyn ClusterPolicy>) -> Self {
        self.cluster_policy = policy;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Returns the config as found in the repository, without defaults or
    /// validation.
    pub fn get_raw(&self, identifier: &str, base: &str, heads: &[&str]) -> Result<InRepoConfig> {
        let factory = self.factory.as_ref().ok_or(Error::MissingClientFactory)?;
        let id = RepoId::parse(identifier)?;

        let started = Instant::now();
        let client = factory
            .client_for(&id, &loader::repo_opts())
            .with_context(|| format!("failed to clone repo for {:?}", id.to_string()));
        self.recorder.observe_acquisition(&id, started.elapsed());
        let client = client?;

        let started = Instant::now();
        let result = self.process(&id, client.as_ref(), base, heads);
        if let Err(e) = client.clean() {
            error!("Failed to release working tree for {}: {}", id, e);
        }
        self.recorder.observe_processing(&id, started.elapsed());
        result
    }

    /// Returns the config with defaults applied, after validating it against
    /// the job and cluster policies.
    pub fn get_with_defaults(
        &self,
        identifier: &str,
        base: &str,
        heads: &[&str],
    ) -> Result<InRepoConfig> {
        let mut config = self.get_raw(identifier, base, heads)?;
        let id = RepoId::parse(identifier)?;
        validate::default_and_validate(
            &mut config,
            self.job_policy.as_ref(),
            self.cluster_policy.as_ref(),
            &id,
        )?;
        Ok(config)
    }

    fn process(
        &self,
        id: &RepoId,
        client: &dyn RepoClient,
        base: &str,
        heads: &[&str],
    ) -> Result<InRepoConfig> {
        client.config(&["user.name", "prow"])?;
        client.config(&["user.email", "prow@localhost"])?;
        client.config(&["commit.gpgsign", "false"])?;

        let strategy = if id.is_gerrit() {
            MergeStrategy::MergeIfNecessary
        } else {
            self.merge_policy.merge_strategy(id)
        };
        debug!(
            "Merging {} head(s) onto {} for {} with strategy {}",
            heads.len(),
            base,
            id,
            strategy
        );

        let heads = ensure_commits(client, base, heads)?;
        client
            .merge_and_checkout(base, strategy, &heads)
            .context("failed to merge")?;

        loader::read_config(client.directory(), false)
    }
}
