//! # Error Handling
//!
//! This module defines the centralized error type for `inrepo-config`. It uses
//! `thiserror` to derive an `Error` enum covering every failure mode of the
//! fetch, merge, parse and validate pipeline.
//!
//! ## Key Components
//!
//! - **`Error`**: The main enum. Variants fall into five groups:
//!   - input errors (malformed identifier, missing git client factory),
//!   - git operation errors (clone, command, merge),
//!   - parse errors (a fragment failed to unmarshal, unknown fields in strict
//!     mode), always carrying the offending path,
//!   - policy and validation errors, which may be aggregated,
//!   - wrapped foreign errors (I/O, YAML, ignore-file, regex, metrics).
//!
//! - **`AggregateError`** and **`ErrorCollector`**: a composite error holding
//!   every collected failure. Cluster allow-list violations always use this so
//!   that the caller sees the complete set instead of the first one.
//!
//! - **`Result<T>`**: A type alias for `std::result::Result<T, Error>`.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Main error type for in-repo config operations
#[derive(Error, Debug)]
pub enum Error {
    /// A repository identifier could not be split into org and repo.
    #[error("didn't get two results when splitting repo identifier {identifier:?}")]
    InvalidIdentifier { identifier: String },

    /// The pipeline was invoked without a git client factory.
    #[error("git client factory is not configured")]
    MissingClientFactory,

    /// An error occurred while creating a working tree for a repository.
    #[error("Git clone error for {repo}: {message}")]
    GitClone { repo: String, message: String },

    /// A git command exited unsuccessfully or could not be spawned.
    #[error("Git command failed for {repo}: {command} - {stderr}")]
    GitCommand {
        command: String,
        repo: String,
        stderr: String,
    },

    /// Merging the head commits onto the base failed.
    #[error("failed to merge {head} onto {base} with strategy {strategy}: {message}")]
    Merge {
        base: String,
        head: String,
        strategy: String,
        message: String,
    },

    /// A configuration fragment failed to unmarshal.
    #[error("failed to unmarshal {}: {message}", path.display())]
    ConfigParse { path: PathBuf, message: String },

    /// Strict parsing found fields that are not part of the schema.
    #[error("unknown fields in {}: {}", path.display(), fields.join(", "))]
    UnknownFields { path: PathBuf, fields: Vec<String> },

    /// A job targets a cluster its repository may not use.
    #[error("cluster {cluster:?} is not allowed for repository {repo:?}")]
    ClusterNotAllowed { cluster: String, repo: String },

    /// Job defaulting or validation rejected the job set.
    #[error("invalid job configuration: {message}")]
    Validation { message: String },

    /// One or more independent failures collected into a single report.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// Another error annotated with the operation that produced it.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// An error indicating that a mutex or other lock has been poisoned.
    #[error("Lock poisoned: {context}")]
    LockPoisoned { context: String },

    /// An I/O error, wrapped from `std::io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A YAML parsing error, wrapped from `serde_yaml::Error`.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The `.prowignore` file could not be turned into a matcher.
    #[error("failed to create `.prowignore` parser: {0}")]
    Ignore(#[from] ignore::Error),

    /// A regular expression error, wrapped from `regex::Error`.
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// A metric could not be created, registered or encoded.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Wraps this error with a description of the operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// A convenient type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension for attaching context to a `Result` in one call.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}

/// Several errors reported together.
///
/// The display form lists every message. A single error is shown as-is,
/// several are bracketed and comma separated.
#[derive(Debug)]
pub struct AggregateError {
    errors: Vec<Error>,
}

impl AggregateError {
    /// The individual errors, in the order they were collected.
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [only] => write!(f, "{only}"),
            errors => {
                write!(f, "[")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{err}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl std::error::Error for AggregateError {}

/// Accumulates zero or more failures and turns them into one result.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    errors: Vec<Error>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: Error) {
        self.errors.push(error);
    }

    /// Records the error of `result`, if any.
    pub fn collect<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.push(err);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `Ok(())` when nothing was collected, otherwise one `Error::Aggregate`.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(AggregateError {
                errors: self.errors,
            }))
        }
    }
}
