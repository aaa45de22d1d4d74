//! # In-Repo Config Library
//!
//! This library loads CI job configuration that lives inside the repository
//! it applies to. Given a repository, a base commit and the head commits of
//! a change, it produces the jobs the change should run, as if the heads had
//! already been merged.
//!
//! ## Quick Example
//!
//! ```
//! use inrepo_config::{config, loader};
//!
//! let cfg = config::parse("presubmits:\n  - name: pull-unit\n", true).unwrap();
//! assert_eq!(cfg.presubmits[0].name, "pull-unit");
//!
//! assert!(loader::contains_config_path(&[".prow/jobs.yaml"]));
//! assert!(!loader::contains_config_path(&["README.md"]));
//! ```
//!
//! ## Core Concepts
//!
//! - **Configuration (`config`)**: The in-repo document: presets, presubmits
//!   and postsubmits. Fragments merge by concatenation.
//! - **Loader (`loader`)**: Reads `.prow/` or `.prow.yaml` from a working tree,
//!   honoring `.prowignore`.
//! - **Git (`git`, `cache`)**: Working tree clients, a CLI backed factory, and
//!   a cache that keeps one reusable working tree per repository with
//!   exclusive access.
//! - **Policies (`policy`, `validate`)**: The centrally owned rules for
//!   merging, job defaulting, validation and allowed clusters.
//! - **Pipeline (`pipeline`)**: `ConfigFetcher`, which ties the pieces together
//!   and reports timings through `metrics`.
//!
//! ## Execution Flow
//!
//! 1.  **Acquire**: Take exclusive use of a working tree for the repository.
//! 2.  **Fetch**: Make the base and head commits available.
//! 3.  **Merge**: Check out the base and merge the heads.
//! 4.  **Parse**: Read and merge the config fragments.
//! 5.  **Default and validate** (optional): Apply central defaults, validate the
//!     jobs together with the static ones, and check cluster permissions.

pub mod cache;
pub mod config;
pub mod error;
pub mod git;
pub mod loader;
pub mod metrics;
pub mod pipeline;
pub mod policy;
pub mod repo_id;
pub mod validate;

pub use error::{Error, Result};
pub use pipeline::ConfigFetcher;
pub use repo_id::RepoId;
