//! # Git Client Layer
//!
//! This module defines the git capability the rest of the crate is written
//! against, and a concrete implementation that shells out to the system `git`
//! binary.
//!
//! - **`RepoClient`**: operations on one on-disk working tree (config, dirty
//!   check, hard reset, fetch, merge-and-checkout, commit lookup, cleanup).
//! - **`ClientFactory`**: creates a `RepoClient` for a repository, honoring
//!   `RepoOpts` (sparse checkout paths, object sharing with a mirror).
//! - **`CliClientFactory`** / **`CliRepoClient`**: the `git` command backed
//!   implementation. Using the system `git` picks up SSH keys, credential
//!   helpers and anything else configured in `~/.gitconfig`.
//!
//! The traits are the seam used by tests to substitute in-memory fakes.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::repo_id::RepoId;

/// How head commits are combined with the base commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// Always create a merge commit (`git merge --no-ff`).
    #[default]
    #[serde(rename = "merge")]
    Merge,
    /// Squash each head into a single commit on top of the base.
    #[serde(rename = "squash")]
    Squash,
    /// Replay each head onto the current state.
    #[serde(rename = "rebase")]
    Rebase,
    /// Fast-forward when possible, otherwise merge.
    #[serde(rename = "ifNecessary")]
    MergeIfNecessary,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::Merge => "merge",
            MergeStrategy::Squash => "squash",
            MergeStrategy::Rebase => "rebase",
            MergeStrategy::MergeIfNecessary => "ifNecessary",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "merge" => Ok(MergeStrategy::Merge),
            "squash" => Ok(MergeStrategy::Squash),
            "rebase" => Ok(MergeStrategy::Rebase),
            "ifNecessary" => Ok(MergeStrategy::MergeIfNecessary),
            other => Err(format!("unknown merge strategy {other:?}")),
        }
    }
}

/// Options applied when a working tree is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoOpts {
    /// Paths materialized by a sparse checkout. Empty means a full checkout.
    pub sparse_checkout_dirs: Vec<String>,
    /// Borrow objects from a local mirror instead of copying them.
    pub share_objects_with_source_repo: bool,
}

/// Operations on a single checked-out working tree.
pub trait RepoClient: Send + Sync {
    /// The on-disk location of the working tree.
    fn directory(&self) -> &Path;

    /// Runs `git config` with the given arguments.
    fn config(&self, args: &[&str]) -> Result<()>;

    /// Whether the tree has uncommitted or unexpected modifications.
    fn is_dirty(&self) -> Result<bool>;

    fn reset_hard(&self, rev: &str) -> Result<()>;

    /// Fetches from origin; `args` are refs or flags such as `--prune`.
    fn fetch(&self, args: &[&str]) -> Result<()>;

    fn commit_exists(&self, sha: &str) -> Result<bool>;

    /// Checks out `base` and merges every head onto it with `strategy`.
    fn merge_and_checkout(&self, base: &str, strategy: MergeStrategy, heads: &[&str])
        -> Result<()>;

    /// Gives the working tree up. The plain client deletes it from disk.
    fn clean(&self) -> Result<()>;
}

/// Creates working trees for repositories.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, id: &RepoId, opts: &RepoOpts) -> Result<Box<dyn RepoClient>>;
}

/// Runs `git` in `dir` and returns its stdout.
fn run_git(dir: Option<&Path>, repo: &RepoId, args: &[&str]) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    debug!("Running git {} for {}", args.join(" "), repo);

    let output = cmd.output().map_err(|e| Error::GitCommand {
        command: args.join(" "),
        repo: repo.to_string(),
        stderr: e.to_string(),
    })?;

    if !output.status.success() {
        return Err(Error::GitCommand {
            command: args.join(" "),
            repo: repo.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Makes an org or repo name safe to use as a single path component.
fn path_component(name: &str) -> String {
    name.replace("://", "_").replace(['/', ':', '\\'], "_")
}

/// A `ClientFactory` backed by the system `git` binary.
///
/// Every repository gets a bare mirror under `<cache_dir>/mirrors`, refreshed
/// on each request. Working trees are created under `<cache_dir>/clones`.
pub struct CliClientFactory {
    remote_base: String,
    cache_dir: PathBuf,
    mirror_locks: Mutex<HashMap<RepoId, Arc<Mutex<()>>>>,
    next_clone: AtomicU64,
}

impl CliClientFactory {
    /// `remote_base` is the URL (or local directory) that `org/repo` paths
    /// are resolved against, e.g. `https://github.com`.
    pub fn new(remote_base: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            remote_base: remote_base.into(),
            cache_dir: cache_dir.into(),
            mirror_locks: Mutex::new(HashMap::new()),
            next_clone: AtomicU64::new(0),
        }
    }

    pub fn remote_url(&self, id: &RepoId) -> String {
        if id.is_gerrit() {
            format!("{}/{}", id.org, id.repo)
        } else {
            format!(
                "{}/{}/{}",
                self.remote_base.trim_end_matches('/'),
                id.org,
                id.repo
            )
        }
    }

    fn mirror_path(&self, id: &RepoId) -> PathBuf {
        self.cache_dir
            .join("mirrors")
            .join(path_component(&id.org))
            .join(format!("{}.git", path_component(&id.repo)))
    }

    fn mirror_lock(&self, id: &RepoId) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.mirror_locks.lock().map_err(|_| Error::LockPoisoned {
            context: "mirror lock table".to_string(),
        })?;
        Ok(Arc::clone(locks.entry(id.clone()).or_default()))
    }

    /// Creates or refreshes the bare mirror of `id` and returns its path.
    fn ensure_mirror(&self, id: &RepoId) -> Result<PathBuf> {
        let lock = self.mirror_lock(id)?;
        let _guard = lock.lock().map_err(|_| Error::LockPoisoned {
            context: format!("mirror of {id}"),
        })?;

        let mirror = self.mirror_path(id);
        if mirror.is_dir() {
            run_git(Some(&mirror), id, &["remote", "update", "--prune"])?;
            return Ok(mirror);
        }

        if let Some(parent) = mirror.parent() {
            fs::create_dir_all(parent)?;
        }
        let url = self.remote_url(id);
        let mirror_arg = mirror.to_string_lossy();
        run_git(None, id, &["clone", "--mirror", &url, &mirror_arg]).map_err(|e| {
            Error::GitClone {
                repo: id.to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(mirror)
    }

    fn clone_dir(&self, id: &RepoId) -> PathBuf {
        let n = self.next_clone.fetch_add(1, Ordering::Relaxed);
        self.cache_dir.join("clones").join(format!(
            "{}_{}-{}-{}",
            path_component(&id.org),
            path_component(&id.repo),
            std::process::id(),
            n
        ))
    }
}

impl ClientFactory for CliClientFactory {
    fn client_for(&self, id: &RepoId, opts: &RepoOpts) -> Result<Box<dyn RepoClient>> {
        let url = self.remote_url(id);
        let dir = self.clone_dir(id);

        // git won't clone into an existing non-empty directory
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent)?;
        }
        let dir_arg = dir.to_string_lossy().to_string();

        let cloned = if opts.share_objects_with_source_repo {
            let mirror = self.ensure_mirror(id)?;
            let mirror_arg = mirror.to_string_lossy().to_string();
            run_git(
                None,
                id,
                &["clone", "--shared", "--no-checkout", &mirror_arg, &dir_arg],
            )
            .and_then(|_| run_git(Some(&dir), id, &["remote", "set-url", "origin", &url]))
        } else {
            run_git(None, id, &["clone", "--no-checkout", &url, &dir_arg])
        };
        cloned.map_err(|e| Error::GitClone {
            repo: id.to_string(),
            message: e.to_string(),
        })?;

        let client = CliRepoClient {
            id: id.clone(),
            dir,
        };

        let populate = || -> Result<()> {
            if !opts.sparse_checkout_dirs.is_empty() {
                let patterns: Vec<String> = opts
                    .sparse_checkout_dirs
                    .iter()
                    .map(|d| format!("/{}", d.trim_start_matches('/')))
                    .collect();
                let mut args = vec!["sparse-checkout", "set", "--no-cone"];
                args.extend(patterns.iter().map(String::as_str));
                client.git(&args)?;
            }
            client.git(&["reset", "--hard", "HEAD"])?;
            Ok(())
        };
        if let Err(e) = populate() {
            if let Err(clean_err) = client.clean() {
                error!(
                    "Failed to remove {} after setup failure: {}",
                    client.dir.display(),
                    clean_err
                );
            }
            return Err(e);
        }

        Ok(Box::new(client))
    }
}

/// A working tree operated on through the `git` command.
#[derive(Debug)]
pub struct CliRepoClient {
    id: RepoId,
    dir: PathBuf,
}

impl CliRepoClient {
    fn git(&self, args: &[&str]) -> Result<String> {
        run_git(Some(&self.dir), &self.id, args)
    }

    /// Runs a command that undoes a failed operation. Its own failure is logged.
    fn recover(&self, args: &[&str]) {
        if let Err(e) = self.git(args) {
            error!("Failed to run git {} for {}: {}", args.join(" "), self.id, e);
        }
    }

    fn merge_error(&self, base: &str, head: &str, strategy: MergeStrategy, err: Error) -> Error {
        Error::Merge {
            base: base.to_string(),
            head: head.to_string(),
            strategy: strategy.to_string(),
            message: err.to_string(),
        }
    }
}

impl RepoClient for CliRepoClient {
    fn directory(&self) -> &Path {
        &self.dir
    }

    fn config(&self, args: &[&str]) -> Result<()> {
        let mut full = vec!["config"];
        full.extend_from_slice(args);
        self.git(&full).map(|_| ())
    }

    fn is_dirty(&self) -> Result<bool> {
        let status = self.git(&["status", "--porcelain"])?;
        Ok(!status.trim().is_empty())
    }

    fn reset_hard(&self, rev: &str) -> Result<()> {
        self.git(&["reset", "--hard", rev]).map(|_| ())
    }

    fn fetch(&self, args: &[&str]) -> Result<()> {
        let mut full = vec!["fetch", "origin"];
        full.extend_from_slice(args);
        self.git(&full).map(|_| ())
    }

    fn commit_exists(&self, sha: &str) -> Result<bool> {
        let object = format!("{sha}^{{commit}}");
        let status = Command::new("git")
            .args(["cat-file", "-e", &object])
            .current_dir(&self.dir)
            .output()
            .map_err(|e| Error::GitCommand {
                command: format!("cat-file -e {object}"),
                repo: self.id.to_string(),
                stderr: e.to_string(),
            })?
            .status;
        Ok(status.success())
    }

    fn merge_and_checkout(
        &self,
        base: &str,
        strategy: MergeStrategy,
        heads: &[&str],
    ) -> Result<()> {
        self.git(&["checkout", "--detach", base])?;

        for head in heads {
            match strategy {
                MergeStrategy::Merge | MergeStrategy::MergeIfNecessary => {
                    let ff = if strategy == MergeStrategy::Merge {
                        "--no-ff"
                    } else {
                        "--ff"
                    };
                    if let Err(e) = self.git(&["merge", ff, "--no-stat", "-m", "merge", head]) {
                        self.recover(&["merge", "--abort"]);
                        return Err(self.merge_error(base, head, strategy, e));
                    }
                }
                MergeStrategy::Squash => {
                    let squashed = self
                        .git(&["merge", "--squash", "--no-stat", head])
                        .and_then(|_| self.git(&["commit", "--allow-empty", "-m", "merge"]));
                    if let Err(e) = squashed {
                        self.recover(&["reset", "--hard", "HEAD"]);
                        return Err(self.merge_error(base, head, strategy, e));
                    }
                }
                MergeStrategy::Rebase => {
                    let onto = self.git(&["rev-parse", "HEAD"])?.trim().to_string();
                    let rebased = self
                        .git(&["checkout", "--detach", head])
                        .and_then(|_| self.git(&["rebase", &onto]));
                    if let Err(e) = rebased {
                        self.recover(&["rebase", "--abort"]);
                        return Err(self.merge_error(base, head, strategy, e));
                    }
                }
            }
        }
        Ok(())
    }

    fn clean(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}
