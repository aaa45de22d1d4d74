//! Repository identity parsing.
//!
//! Identifiers are plain `org/repo` strings for GitHub-style hosts. Gerrit-style
//! hosts use the clone URL instead, e.g. `https://host.example.com/team/project`,
//! where the org is `https://host.example.com` and the repo is `team/project`.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// An org/repo pair used as the cache key and the unit of locking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoId {
    pub org: String,
    pub repo: String,
}

impl RepoId {
    pub fn new(org: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            repo: repo.into(),
        }
    }

    /// Splits an identifier into its two components.
    pub fn parse(identifier: &str) -> Result<Self> {
        let invalid = || Error::InvalidIdentifier {
            identifier: identifier.to_string(),
        };

        if let Some(scheme_len) = url_scheme_len(identifier) {
            let (host, repo) = identifier[scheme_len..]
                .split_once('/')
                .ok_or_else(invalid)?;
            let repo = repo.trim_end_matches('/');
            if host.is_empty() || repo.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::new(&identifier[..scheme_len + host.len()], repo));
        }

        match identifier.split('/').collect::<Vec<_>>().as_slice() {
            [org, repo] if !org.is_empty() && !repo.is_empty() => Ok(Self::new(*org, *repo)),
            _ => Err(invalid()),
        }
    }

    /// Whether this repository lives on a Gerrit-style host, where the merge
    /// strategy of a change cannot be determined up front.
    pub fn is_gerrit(&self) -> bool {
        url_scheme_len(&self.org).is_some()
    }
}

fn url_scheme_len(s: &str) -> Option<usize> {
    ["https://", "http://"]
        .iter()
        .find(|scheme| s.starts_with(*scheme))
        .map(|scheme| scheme.len())
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.org, self.repo)
    }
}

impl FromStr for RepoId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
