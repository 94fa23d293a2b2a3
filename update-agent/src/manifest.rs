//! Update manifest documents.
//!
//! These are the YAML documents published by the update source: the
//! current-version record, the release index, and one manifest per
//! release. Steps stay in document form here; promotion to a typed plan
//! happens during pre-validation so an unknown step kind surfaces as a
//! validation error with the kind name, not a deserialization failure.

use chrono::NaiveDate;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::utils::errors::{Result, UpdateError};

/// Single-field version document (`version.yml`), shared by the remote
/// source and the local store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionDoc {
    pub version: String,
}

/// Release index (`updates/index.yml`): every published version, in no
/// particular order. The repository sorts and slices it to build chains.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseIndex {
    #[serde(default)]
    pub versions: Vec<Version>,
}

/// One versioned update (`updates/<version>/manifest.yml`): an ordered
/// list of steps plus rollback and validation metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: Version,

    /// Minimum version that must already be installed. Applying fails
    /// closed if the installed version is lower.
    pub requires: Version,

    #[serde(default)]
    pub release_date: Option<NaiveDate>,

    #[serde(default)]
    pub description: String,

    /// Applied in order; order is significant.
    pub steps: Vec<Step>,

    #[serde(default)]
    pub rollback: RollbackSpec,

    #[serde(default)]
    pub validation: ValidationSpec,

    #[serde(default)]
    pub notes: Vec<String>,
}

/// A single declared change, kept in document form. `type` is an open
/// string so new kinds can be added without breaking older agents at
/// parse time; agents that lack a handler reject the manifest whole
/// during pre-validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "type")]
    pub kind: String,

    /// `service_config`: source path, relative to the repository root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// `service_config`: absolute host path to install at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,

    /// `service_config`: octal file-mode string, e.g. "755"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,

    /// `docker_compose`: service name; absent means the whole stack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// `docker_compose`: "restart" or "recreate"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Operator documentation only. The engine rolls back by restoring its
/// snapshot, never by executing these lines.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackSpec {
    #[serde(default)]
    pub supported: bool,
    #[serde(default)]
    pub steps: Vec<String>,
}

/// Post-apply check descriptors, e.g. `file_exists:/data/config/x.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationSpec {
    #[serde(default)]
    pub steps: Vec<String>,
}

impl ValidationSpec {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Manifest {
    /// Parse a manifest document from YAML.
    pub fn parse(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| UpdateError::Parse(format!("manifest: {e}")))
    }
}
