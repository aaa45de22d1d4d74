//! Shared test utilities for integration and E2E tests.
//!
//! Add `mod common;` to a test file, then use the helpers:
//!
//! ```rust,ignore
//! mod common;
//! use common::prelude::*;
//! ```

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use inrepo_config::error::{Error, Result};
use inrepo_config::git::{ClientFactory, MergeStrategy, RepoClient, RepoOpts};
use inrepo_config::RepoId;

/// Re-export commonly used test dependencies for convenience.
#[allow(unused_imports)]
pub mod prelude {
    pub use assert_cmd::cargo::cargo_bin_cmd;
    pub use assert_fs::prelude::*;
    pub use assert_fs::TempDir;
    pub use predicates::prelude::*;

    pub use super::configs;
    pub use super::{MockFactory, MockState};
}

/// Common in-repo config snippets for testing.
#[allow(dead_code)]
pub mod configs {
    pub const SINGLE_PRESUBMIT: &str = "presubmits:\n  - name: pull-unit\n";

    pub const WITH_POSTSUBMIT: &str = r#"
presubmits:
  - name: pull-unit
postsubmits:
  - name: post-deploy
    branches: [main]
"#;

    pub const DISALLOWED_CLUSTER: &str = r#"
presubmits:
  - name: pull-gpu
    cluster: gpu
"#;

    pub const CENTRAL_WITH_GPU: &str = r#"
in_repo_config:
  allowed_clusters:
    "*": [default]
    org/repo: [gpu]
"#;
}

/// Counters shared by a `MockFactory` and every client it hands out.
#[derive(Default)]
#[allow(dead_code)]
pub struct MockState {
    pub clones: AtomicUsize,
    pub cleans: AtomicUsize,
    pub fetches: Mutex<Vec<String>>,
    pub dirty: AtomicBool,
    /// Clones currently inside `client_for`
    active_clones: Mutex<usize>,
    peak_clones: AtomicUsize,
    clone_started: Condvar,
}

#[allow(dead_code)]
impl MockState {
    pub fn clones(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }

    pub fn peak_concurrent_clones(&self) -> usize {
        self.peak_clones.load(Ordering::SeqCst)
    }
}

pub struct MockClient {
    dir: PathBuf,
    state: Arc<MockState>,
}

impl RepoClient for MockClient {
    fn directory(&self) -> &Path {
        &self.dir
    }

    fn config(&self, _args: &[&str]) -> Result<()> {
        Ok(())
    }

    fn is_dirty(&self) -> Result<bool> {
        Ok(self.state.dirty.load(Ordering::SeqCst))
    }

    fn reset_hard(&self, _rev: &str) -> Result<()> {
        self.state.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn fetch(&self, args: &[&str]) -> Result<()> {
        self.state.fetches.lock().unwrap().push(args.join(" "));
        Ok(())
    }

    fn commit_exists(&self, _sha: &str) -> Result<bool> {
        Ok(true)
    }

    fn merge_and_checkout(
        &self,
        _base: &str,
        _strategy: MergeStrategy,
        _heads: &[&str],
    ) -> Result<()> {
        Ok(())
    }

    fn clean(&self) -> Result<()> {
        self.state.cleans.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out clients rooted at `root/<org>/<repo>`.
///
/// With `wait_for_peers` set, each clone waits (up to a timeout) until that
/// many clones are in flight at once, which makes overlap observable.
pub struct MockFactory {
    pub state: Arc<MockState>,
    root: PathBuf,
    wait_for_peers: usize,
    fail_for: Option<RepoId>,
}

#[allow(dead_code)]
impl MockFactory {
    pub fn new(root: &Path) -> Self {
        Self {
            state: Arc::new(MockState::default()),
            root: root.to_path_buf(),
            wait_for_peers: 0,
            fail_for: None,
        }
    }

    pub fn wait_for_peers(mut self, peers: usize) -> Self {
        self.wait_for_peers = peers;
        self
    }

    pub fn failing_for(mut self, id: RepoId) -> Self {
        self.fail_for = Some(id);
        self
    }

    fn rendezvous(&self) {
        let mut active = self.state.active_clones.lock().unwrap();
        *active += 1;
        self.state.peak_clones.fetch_max(*active, Ordering::SeqCst);
        self.state.clone_started.notify_all();
        while *active < self.wait_for_peers {
            let (guard, timeout) = self
                .state
                .clone_started
                .wait_timeout(active, Duration::from_secs(5))
                .unwrap();
            active = guard;
            if timeout.timed_out() {
                break;
            }
        }
        drop(active);
        // Keep the slot long enough for peers to observe it.
        std::thread::sleep(Duration::from_millis(20));
        *self.state.active_clones.lock().unwrap() -= 1;
    }
}

impl ClientFactory for MockFactory {
    fn client_for(&self, id: &RepoId, _opts: &RepoOpts) -> Result<Box<dyn RepoClient>> {
        if self.fail_for.as_ref() == Some(id) {
            return Err(Error::GitClone {
                repo: id.to_string(),
                message: "repository not found".to_string(),
            });
        }
        if self.wait_for_peers > 0 {
            self.rendezvous();
        }
        self.state.clones.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockClient {
            dir: self.root.join(&id.org).join(&id.repo),
            state: Arc::clone(&self.state),
        }))
    }
}

/// Runs `git` in `dir`, panicking on failure, and returns trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

pub fn commit_file(dir: &Path, rel: &str, content: &str) -> String {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", rel]);
    git(dir, &["rev-parse", "HEAD"])
}

/// Remote repository at `<remotes>/org/repo` with a base commit on the
/// default branch and a head commit on a side branch. Returns (base, head).
pub fn setup_remote(remotes: &Path) -> (String, String) {
    let repo = remotes.join("org").join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    git(&repo, &["init", "-q"]);
    git(&repo, &["config", "user.name", "test"]);
    git(&repo, &["config", "user.email", "test@example.com"]);
    git(&repo, &["config", "commit.gpgsign", "false"]);

    commit_file(&repo, "README.md", "# repo\n");
    let base = commit_file(
        &repo,
        ".prow.yaml",
        "presubmits:\n  - name: pull-unit\n",
    );
    git(&repo, &["checkout", "-q", "-b", "feature"]);
    let head = commit_file(
        &repo,
        ".prow.yaml",
        "presubmits:\n  - name: pull-unit\n  - name: pull-e2e\n",
    );
    git(&repo, &["checkout", "-q", "-"]);
    (base, head)
}

