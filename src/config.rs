//! # In-Repo Configuration Schema
//!
//! This module defines `InRepoConfig`, the document read from `.prow.yaml` or
//! from the fragments under `.prow/`, along with the job shapes it carries.
//!
//! ## Key Components
//!
//! - **`InRepoConfig`**: three ordered sequences (`presets`, `presubmits`,
//!   `postsubmits`) plus `prow_ignored`, a passthrough field for data that is
//!   not CI configuration. It is never interpreted and round-trips unchanged.
//!
//! - **`Preset`**, **`Presubmit`**, **`Postsubmit`**: the job fields this crate
//!   reads. The full job schema belongs to the scheduler; everything else is
//!   kept opaque (`spec`) or captured in `unknown`.
//!
//! ## Unknown Fields
//!
//! Every struct captures fields it does not know in a flattened `unknown`
//! map. Lenient parsing keeps them so that they survive re-serialization.
//! Strict parsing (`parse(.., true)`) rejects the document and names each
//! unknown field by its path, e.g. `presubmits[0].nmae`.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;

use crate::error::{Error, Result};

/// Treats an explicit `null` the same as a missing field.
fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

/// Configuration values shared by every job whose labels match `labels`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub labels: BTreeMap<String, String>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub env: Vec<Value>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub volumes: Vec<Value>,
    #[serde(
        default,
        rename = "volumeMounts",
        deserialize_with = "nullable",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub volume_mounts: Vec<Value>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

/// A job run against proposed changes before they merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Presubmit {
    #[serde(default)]
    pub name: String,
    /// Execution cluster. Empty until defaulted.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster: String,
    /// Status context reported for the job. Defaults to the job name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub always_run: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_if_changed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if_only_changed: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip_report: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerun_command: Option<String>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub branches: Vec<String>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub skip_branches: Vec<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_concurrency: i32,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub labels: BTreeMap<String, String>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decorate: Option<bool>,
    /// Pod spec, passed through untouched apart from preset merging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

/// A job run after changes merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Postsubmit {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub always_run: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_if_changed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if_only_changed: Option<String>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub branches: Vec<String>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub skip_branches: Vec<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_concurrency: i32,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub labels: BTreeMap<String, String>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decorate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

/// The content of `.prow.yaml`, or of all fragments under `.prow/` merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InRepoConfig {
    #[serde(default, deserialize_with = "nullable")]
    pub presets: Vec<Preset>,
    #[serde(default, deserialize_with = "nullable")]
    pub presubmits: Vec<Presubmit>,
    #[serde(default, deserialize_with = "nullable")]
    pub postsubmits: Vec<Postsubmit>,
    /// Well known, never parsed field for non-CI data. Lets repositories put
    /// their own metadata next to job definitions without tripping strict
    /// parsing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prow_ignored: Option<Value>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

impl InRepoConfig {
    /// Appends another fragment's presets, presubmits and postsubmits, in
    /// that order. `prow_ignored` and unknown fields of `other` are dropped.
    pub fn merge(&mut self, other: InRepoConfig) {
        self.presets.extend(other.presets);
        self.presubmits.extend(other.presubmits);
        self.postsubmits.extend(other.postsubmits);
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty() && self.presubmits.is_empty() && self.postsubmits.is_empty()
    }

    /// Paths of every field that is not part of the schema.
    pub fn unknown_fields(&self) -> Vec<String> {
        fn keys<'a>(
            prefix: &'a str,
            map: &'a BTreeMap<String, Value>,
        ) -> impl Iterator<Item = String> + 'a {
            map.keys().map(move |k| format!("{prefix}{k}"))
        }

        let mut fields: Vec<String> = keys("", &self.unknown).collect();
        for (i, preset) in self.presets.iter().enumerate() {
            fields.extend(keys(&format!("presets[{i}]."), &preset.unknown));
        }
        for (i, job) in self.presubmits.iter().enumerate() {
            fields.extend(keys(&format!("presubmits[{i}]."), &job.unknown));
        }
        for (i, job) in self.postsubmits.iter().enumerate() {
            fields.extend(keys(&format!("postsubmits[{i}]."), &job.unknown));
        }
        fields
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Parses one document. An empty document (or one holding only comments)
/// yields an empty config.
///
/// With `strict`, fields outside the schema are rejected with
/// `Error::UnknownFields`; the path in that error is left empty for the
/// caller to fill in.
pub fn parse(content: &str, strict: bool) -> Result<InRepoConfig> {
    let value: Value = serde_yaml::from_str(content)?;
    if value.is_null() {
        return Ok(InRepoConfig::default());
    }
    let config: InRepoConfig = serde_yaml::from_value(value)?;
    if strict {
        let fields = config.unknown_fields();
        if !fields.is_empty() {
            return Err(Error::UnknownFields {
                path: Default::default(),
                fields,
            });
        }
    }
    Ok(config)
}
