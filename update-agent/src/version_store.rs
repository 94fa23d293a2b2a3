//! Durable record of the installed system version.
//!
//! The record is a single-field YAML document (`version.yml`). It is the
//! only ground truth the agent owns, so reads fail closed: a missing or
//! unreadable record is an error, never a guessed default. Writes go to a
//! temp file in the same directory and are renamed into place, so a crash
//! mid-commit leaves either the old record or the new one, never a torn
//! file.

use semver::Version;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::manifest::VersionDoc;
use crate::utils::errors::{Result, UpdateError};

pub const VERSION_FILE: &str = "version.yml";

#[derive(Debug, Clone)]
pub struct VersionStore {
    path: PathBuf,
}

impl VersionStore {
    pub fn new(state_dir: &Path) -> Self {
        VersionStore {
            path: state_dir.join(VERSION_FILE),
        }
    }

    /// Read the installed version.
    pub fn current(&self) -> Result<Version> {
        let raw = fs::read_to_string(&self.path).map_err(|e| {
            UpdateError::StoreUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        let doc: VersionDoc = serde_yaml::from_str(&raw).map_err(|e| {
            UpdateError::StoreUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        Version::parse(&doc.version).map_err(|e| {
            UpdateError::StoreUnavailable(format!(
                "{}: invalid version {:?}: {}",
                self.path.display(),
                doc.version,
                e
            ))
        })
    }

    /// Durably record a newly verified version.
    pub fn commit(&self, version: &Version) -> Result<()> {
        let doc = VersionDoc {
            version: version.to_string(),
        };
        let raw = serde_yaml::to_string(&doc)
            .map_err(|e| UpdateError::StoreUnavailable(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("yml.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        debug!(version = %version, path = %self.path.display(), "version record committed");
        Ok(())
    }

    /// First-install helper: write `version` only if no record exists yet.
    /// Returns whether a record was written. A corrupt record still fails
    /// on the next read; seeding never overwrites.
    pub fn seed(&self, version: &Version) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        self.commit(version)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn commit_then_read_round_trips() {
        let tmp = TempDir::new().unwrap();
        let store = VersionStore::new(tmp.path());

        store.commit(&Version::new(1, 2, 0)).unwrap();
        assert_eq!(store.current().unwrap(), Version::new(1, 2, 0));

        store.commit(&Version::new(1, 3, 0)).unwrap();
        assert_eq!(store.current().unwrap(), Version::new(1, 3, 0));
    }

    #[test]
    fn missing_record_fails_closed() {
        let tmp = TempDir::new().unwrap();
        let store = VersionStore::new(tmp.path());

        let err = store.current().unwrap_err();
        assert!(matches!(err, UpdateError::StoreUnavailable(_)));
    }

    #[test]
    fn corrupt_record_fails_closed() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(VERSION_FILE), "version: [not, a, version]").unwrap();
        let store = VersionStore::new(tmp.path());

        assert!(matches!(
            store.current().unwrap_err(),
            UpdateError::StoreUnavailable(_)
        ));
    }

    #[test]
    fn non_semver_record_fails_closed() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(VERSION_FILE), "version: \"latest\"\n").unwrap();
        let store = VersionStore::new(tmp.path());

        assert!(matches!(
            store.current().unwrap_err(),
            UpdateError::StoreUnavailable(_)
        ));
    }

    #[test]
    fn commit_leaves_no_temp_file() {
        let tmp = TempDir::new().unwrap();
        let store = VersionStore::new(tmp.path());
        store.commit(&Version::new(2, 0, 0)).unwrap();

        let names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![VERSION_FILE.to_string()]);
    }

    #[test]
    fn seed_writes_once_and_never_overwrites() {
        let tmp = TempDir::new().unwrap();
        let store = VersionStore::new(tmp.path());

        assert!(store.seed(&Version::new(1, 0, 0)).unwrap());
        assert!(!store.seed(&Version::new(9, 9, 9)).unwrap());
        assert_eq!(store.current().unwrap(), Version::new(1, 0, 0));
    }
}
