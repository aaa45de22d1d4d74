//! # Policy
//!
//! The collaborators the pipeline consults but does not own:
//!
//! - **`MergePolicy`**: which merge strategy a repository uses.
//! - **`JobPolicy`**: job defaulting, validation, and the statically
//!   configured jobs that in-repo jobs are validated together with.
//! - **`ClusterPolicy`**: the per-repository allow-list of execution clusters
//!   for jobs that come from in-repo config.
//!
//! `CentralConfig` is a YAML-loadable implementation of all three, used by
//! the command-line tool and by tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::config::{Postsubmit, Preset, Presubmit};
use crate::error::{Error, ErrorCollector, Result, ResultExt};
use crate::git::MergeStrategy;
use crate::repo_id::RepoId;

/// Cluster used for jobs that do not name one
pub const DEFAULT_CLUSTER: &str = "default";

pub trait MergePolicy: Send + Sync {
    fn merge_strategy(&self, repo: &RepoId) -> MergeStrategy;
}

pub trait JobPolicy: Send + Sync {
    /// Fills in unset fields, applying matching presets.
    fn default_presubmits(
        &self,
        jobs: &mut [Presubmit],
        presets: &[Preset],
        repo: &RepoId,
    ) -> Result<()>;

    fn default_postsubmits(
        &self,
        jobs: &mut [Postsubmit],
        presets: &[Preset],
        repo: &RepoId,
    ) -> Result<()>;

    fn validate_presubmits(&self, jobs: &[Presubmit]) -> Result<()>;

    fn validate_postsubmits(&self, jobs: &[Postsubmit]) -> Result<()>;

    /// Centrally configured presubmits for `repo`.
    fn static_presubmits(&self, repo: &RepoId) -> Vec<Presubmit>;

    fn static_postsubmits(&self, repo: &RepoId) -> Vec<Postsubmit>;
}

pub trait ClusterPolicy: Send + Sync {
    /// Whether an in-repo job for `repo` may run on `cluster`.
    fn allows_cluster(&self, cluster: &str, repo: &RepoId) -> bool;
}

/// In-repo config settings of the central configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InRepoSettings {
    /// Allowed clusters keyed by `*`, `org` or `org/repo`. Every matching key
    /// contributes.
    #[serde(default)]
    pub allowed_clusters: HashMap<String, Vec<String>>,
}

/// The centrally stored configuration that in-repo config is checked against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CentralConfig {
    #[serde(default = "default_cluster")]
    pub default_cluster: String,
    #[serde(default)]
    pub in_repo_config: InRepoSettings,
    /// Merge strategy keyed by `org` or `org/repo`; the most specific wins.
    #[serde(default)]
    pub merge_method: HashMap<String, MergeStrategy>,
    /// Static presubmits keyed by `org/repo`.
    #[serde(default)]
    pub presubmits: HashMap<String, Vec<Presubmit>>,
    #[serde(default)]
    pub postsubmits: HashMap<String, Vec<Postsubmit>>,
}

fn default_cluster() -> String {
    DEFAULT_CLUSTER.to_string()
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            default_cluster: default_cluster(),
            in_repo_config: InRepoSettings::default(),
            merge_method: HashMap::new(),
            presubmits: HashMap::new(),
            postsubmits: HashMap::new(),
        }
    }
}

impl CentralConfig {
    pub fn parse(content: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(content)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_value(value)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(Error::Io)?;
        Self::parse(&content).with_context(|| format!("loading {}", path.display()))
    }

    /// Clusters in-repo jobs of `repo` may use.
    pub fn allowed_clusters(&self, repo: &RepoId) -> HashSet<&str> {
        let allowed = &self.in_repo_config.allowed_clusters;
        let mut clusters: HashSet<&str> = HashSet::new();
        match allowed.get("*") {
            Some(global) => clusters.extend(global.iter().map(String::as_str)),
            None => {
                clusters.insert(self.default_cluster.as_str());
            }
        }
        for key in [repo.org.clone(), repo.to_string()] {
            if let Some(list) = allowed.get(&key) {
                clusters.extend(list.iter().map(String::as_str));
            }
        }
        clusters
    }
}

impl MergePolicy for CentralConfig {
    fn merge_strategy(&self, repo: &RepoId) -> MergeStrategy {
        self.merge_method
            .get(&repo.to_string())
            .or_else(|| self.merge_method.get(&repo.org))
            .copied()
            .unwrap_or_default()
    }
}

impl ClusterPolicy for CentralConfig {
    fn allows_cluster(&self, cluster: &str, repo: &RepoId) -> bool {
        self.allowed_clusters(repo).contains(cluster)
    }
}

impl JobPolicy for CentralConfig {
    fn default_presubmits(
        &self,
        jobs: &mut [Presubmit],
        presets: &[Preset],
        _repo: &RepoId,
    ) -> Result<()> {
        let mut errors = ErrorCollector::new();
        for job in jobs.iter_mut() {
            if job.cluster.is_empty() {
                job.cluster = self.default_cluster.clone();
            }
            if job.context.is_empty() {
                job.context = job.name.clone();
            }
            errors.collect(apply_presets(&job.name, &job.labels, &mut job.spec, presets));
        }
        errors.into_result()
    }

    fn default_postsubmits(
        &self,
        jobs: &mut [Postsubmit],
        presets: &[Preset],
        _repo: &RepoId,
    ) -> Result<()> {
        let mut errors = ErrorCollector::new();
        for job in jobs.iter_mut() {
            if job.cluster.is_empty() {
                job.cluster = self.default_cluster.clone();
            }
            errors.collect(apply_presets(&job.name, &job.labels, &mut job.spec, presets));
        }
        errors.into_result()
    }

    fn validate_presubmits(&self, jobs: &[Presubmit]) -> Result<()> {
        let mut errors = ErrorCollector::new();
        let mut seen: HashMap<&str, Vec<&Presubmit>> = HashMap::new();
        for job in jobs {
            errors.collect(validate_common(&job.name, job.max_concurrency));
            let same_name = seen.entry(job.name.as_str()).or_default();
            if same_name
                .iter()
                .any(|other| branches_overlap(&job.branches, &other.branches))
            {
                errors.push(Error::Validation {
                    message: format!("duplicated presubmit job: {}", job.name),
                });
            }
            same_name.push(job);
        }
        errors.into_result()
    }

    fn validate_postsubmits(&self, jobs: &[Postsubmit]) -> Result<()> {
        let mut errors = ErrorCollector::new();
        let mut seen: HashMap<&str, Vec<&Postsubmit>> = HashMap::new();
        for job in jobs {
            errors.collect(validate_common(&job.name, job.max_concurrency));
            let same_name = seen.entry(job.name.as_str()).or_default();
            if same_name
                .iter()
                .any(|other| branches_overlap(&job.branches, &other.branches))
            {
                errors.push(Error::Validation {
                    message: format!("duplicated postsubmit job: {}", job.name),
                });
            }
            same_name.push(job);
        }
        errors.into_result()
    }

    fn static_presubmits(&self, repo: &RepoId) -> Vec<Presubmit> {
        self.presubmits
            .get(&repo.to_string())
            .cloned()
            .unwrap_or_default()
    }

    fn static_postsubmits(&self, repo: &RepoId) -> Vec<Postsubmit> {
        self.postsubmits
            .get(&repo.to_string())
            .cloned()
            .unwrap_or_default()
    }
}

/// The compiled job name pattern, built on first use.
fn job_name_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$"))
        .as_ref()
        .map_err(|e| Error::Regex(e.clone()))
}

fn validate_common(name: &str, max_concurrency: i32) -> Result<()> {
    let name_pattern = job_name_pattern()?;
    if name.is_empty() {
        return Err(Error::Validation {
            message: "job has no name".to_string(),
        });
    }
    if !name_pattern.is_match(name) {
        return Err(Error::Validation {
            message: format!("job name {name:?} must match {}", name_pattern.as_str()),
        });
    }
    if max_concurrency < 0 {
        return Err(Error::Validation {
            message: format!(
                "job {name}: max_concurrency is {max_concurrency}, it cannot be negative"
            ),
        });
    }
    Ok(())
}

/// Two jobs with the same name collide unless they target disjoint branches.
/// An empty list means every branch.
fn branches_overlap(a: &[String], b: &[String]) -> bool {
    a.is_empty() || b.is_empty() || a.iter().any(|branch| b.contains(branch))
}

/// Merges every preset whose labels are all present on the job into its spec:
/// env and volume mounts into each container, volumes into the pod.
fn apply_presets(
    job: &str,
    labels: &BTreeMap<String, String>,
    spec: &mut Option<Value>,
    presets: &[Preset],
) -> Result<()> {
    let matching = presets.iter().filter(|preset| {
        !preset.labels.is_empty()
            && preset
                .labels
                .iter()
                .all(|(k, v)| labels.get(k) == Some(v))
    });

    for preset in matching {
        let Some(Value::Mapping(pod)) = spec.as_mut() else {
            continue;
        };

        if !preset.volumes.is_empty() {
            append_list(pod, "volumes", &preset.volumes, job)?;
        }
        if let Some(Value::Sequence(containers)) = pod.get_mut("containers") {
            for container in containers.iter_mut() {
                let Value::Mapping(container) = container else {
                    continue;
                };
                if !preset.env.is_empty() {
                    append_list(container, "env", &preset.env, job)?;
                }
                if !preset.volume_mounts.is_empty() {
                    append_list(container, "volumeMounts", &preset.volume_mounts, job)?;
                }
            }
        }
    }
    Ok(())
}

/// Appends `items` to the list at `key`, rejecting entries whose `name`
/// already exists there.
fn append_list(map: &mut Mapping, key: &str, items: &[Value], job: &str) -> Result<()> {
    let list = map
        .entry(Value::String(key.to_string()))
        .or_insert_with(|| Value::Sequence(Vec::new()));
    let Value::Sequence(list) = list else {
        return Err(Error::Validation {
            message: format!("job {job}: {key} is not a list"),
        });
    };
    for item in items {
        let name = item.get("name");
        if name.is_some() && list.iter().any(|existing| existing.get("name") == name) {
            return Err(Error::Validation {
                message: format!(
                    "job {job}: preset {key} entry {} duplicates an existing one",
                    name.and_then(Value::as_str).unwrap_or_default()
                ),
            });
        }
        list.push(item.clone());
    }
    Ok(())
}
