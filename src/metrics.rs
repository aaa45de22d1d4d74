//! Timing observations for config fetches.
//!
//! The pipeline reports two durations per fetch, labeled by `org` and `repo`:
//! how long it took to acquire a working tree (which may include a clone),
//! and how long everything after that took. Where the observations go is up
//! to the `Recorder` the caller passes in. The binary owns a
//! `prometheus::Registry` and registers one `HistogramRecorder` in it at
//! startup.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `inrepoconfig_git_client_acquisition_duration` | Histogram | `org`, `repo` |
//! | `inrepoconfig_git_other_duration` | Histogram | `org`, `repo` |

use std::time::Duration;

use log::debug;
use prometheus::{Encoder, Histogram, HistogramOpts, HistogramVec, Registry, TextEncoder};

use crate::error::{Error, Result};
use crate::repo_id::RepoId;

/// Upper bounds in seconds for working tree acquisition.
pub const ACQUISITION_BUCKETS: &[f64] = &[
    0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 180.0, 300.0, 600.0, 1200.0, 1800.0,
    3600.0,
];

/// Upper bounds in seconds for the git work after acquisition.
pub const PROCESSING_BUCKETS: &[f64] = &[
    0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 180.0, 300.0, 600.0,
];

const LABELS: &[&str] = &["org", "repo"];

pub trait Recorder: Send + Sync {
    /// Time taken to acquire a working tree, clone included.
    fn observe_acquisition(&self, repo: &RepoId, elapsed: Duration);

    /// Time taken by all git work and parsing after acquisition.
    fn observe_processing(&self, repo: &RepoId, elapsed: Duration);
}

/// Discards every observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl Recorder for NoopRecorder {
    fn observe_acquisition(&self, _repo: &RepoId, _elapsed: Duration) {}

    fn observe_processing(&self, _repo: &RepoId, _elapsed: Duration) {}
}

/// Prometheus histograms of both durations.
#[derive(Clone)]
pub struct HistogramRecorder {
    acquisition: HistogramVec,
    processing: HistogramVec,
}

impl HistogramRecorder {
    /// Creates both histograms and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Fails if either metric is already registered.
    pub fn new(registry: &Registry) -> Result<Self> {
        let acquisition = HistogramVec::new(
            HistogramOpts::new(
                "inrepoconfig_git_client_acquisition_duration",
                "Seconds taken to acquire a git working tree, including any clone",
            )
            .buckets(ACQUISITION_BUCKETS.to_vec()),
            LABELS,
        )?;
        registry.register(Box::new(acquisition.clone()))?;

        let processing = HistogramVec::new(
            HistogramOpts::new(
                "inrepoconfig_git_other_duration",
                "Seconds taken by fetching, merging and parsing after acquisition",
            )
            .buckets(PROCESSING_BUCKETS.to_vec()),
            LABELS,
        )?;
        registry.register(Box::new(processing.clone()))?;

        Ok(Self {
            acquisition,
            processing,
        })
    }

    /// The acquisition histogram for `repo`.
    pub fn acquisition(&self, repo: &RepoId) -> Histogram {
        self.acquisition
            .with_label_values(&[repo.org.as_str(), repo.repo.as_str()])
    }

    /// The processing histogram for `repo`.
    pub fn processing(&self, repo: &RepoId) -> Histogram {
        self.processing
            .with_label_values(&[repo.org.as_str(), repo.repo.as_str()])
    }
}

impl Recorder for HistogramRecorder {
    fn observe_acquisition(&self, repo: &RepoId, elapsed: Duration) {
        debug!("Acquired working tree for {} in {:?}", repo, elapsed);
        self.acquisition(repo).observe(elapsed.as_secs_f64());
    }

    fn observe_processing(&self, repo: &RepoId, elapsed: Duration) {
        debug!("Processed {} in {:?}", repo, elapsed);
        self.processing(repo).observe(elapsed.as_secs_f64());
    }
}

/// Renders every metric in `registry` in the Prometheus text format.
pub fn encode_text(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| Error::Metrics(prometheus::Error::Msg(e.to_string())))
}
