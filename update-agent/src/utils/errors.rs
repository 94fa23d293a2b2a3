//! Custom error types for the update agent.

use semver::Version;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported step type: {kind}")]
    UnsupportedStep { kind: String },

    #[error("Update {manifest} requires version {requires}, but {installed} is installed")]
    RequirementNotMet {
        manifest: Version,
        requires: Version,
        installed: Version,
    },

    #[error("Step source missing: {0}")]
    SourceMissing(String),

    #[error("Failed to write {}: {source}", path.display())]
    TargetWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown service: {0}")]
    ServiceUnknown(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Verification failed [{check}]: {reason}")]
    VerificationFailed { check: String, reason: String },

    #[error("Version store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpdateError {
    /// Transient errors are worth retrying with backoff; everything else
    /// is final the first time.
    pub fn is_transient(&self) -> bool {
        matches!(self, UpdateError::Network(_))
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
