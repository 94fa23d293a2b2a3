//! Pre-update snapshots of the host paths a manifest will touch.
//!
//! A snapshot is taken after pre-validation and before the first step
//! runs. Each one lives in its own directory:
//!
//! ```text
//! <backups>/v1.2.0_20250304_101500/backup.json   what was captured
//! <backups>/v1.2.0_20250304_101500/files/...     captured content
//! ```
//!
//! Paths that do not exist yet are recorded as absent, so a rollback can
//! delete a file the update created. Restoring is idempotent: every entry
//! converges on the captured state no matter how often it is replayed.

use chrono::{DateTime, Duration, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::BackupConfig;
use crate::utils::errors::Result;

const BACKUP_META: &str = "backup.json";

/// How one host path looked when the snapshot was taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PathState {
    /// Path did not exist; restore deletes whatever the update put there.
    Absent { path: PathBuf },

    /// Regular file, captured with its mode bits.
    File {
        path: PathBuf,
        stored: PathBuf,
        mode: u32,
    },

    /// Directory tree, captured recursively.
    Dir { path: PathBuf, stored: PathBuf },
}

/// A completed snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub tag: String,
    /// Version whose application this snapshot protects.
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<PathState>,
}

pub struct BackupManager {
    dir: PathBuf,
    max_count: usize,
    max_age_days: i64,
}

impl BackupManager {
    pub fn new(config: &BackupConfig) -> Self {
        BackupManager {
            dir: config.dir.clone(),
            max_count: config.max_count,
            max_age_days: config.max_age_days,
        }
    }

    /// Capture the current state of every path in `paths`. Duplicates
    /// collapse to one entry. Nothing outside the backup directory is
    /// written.
    pub fn snapshot(&self, paths: &[PathBuf], version: &Version) -> Result<Backup> {
        let created_at = Utc::now();
        let tag = format!("v{}_{}", version, created_at.format("%Y%m%d_%H%M%S"));
        let root = self.dir.join(&tag);
        let files_root = root.join("files");
        fs::create_dir_all(&files_root)?;

        let unique: BTreeSet<&PathBuf> = paths.iter().collect();
        let mut entries = Vec::with_capacity(unique.len());
        for path in unique {
            let entry = capture(&files_root, path)?;
            debug!(path = %path.display(), state = entry.label(), "captured");
            entries.push(entry);
        }

        let backup = Backup {
            tag: tag.clone(),
            version: version.to_string(),
            created_at,
            entries,
        };
        let meta = serde_json::to_string_pretty(&backup)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(root.join(BACKUP_META), meta)?;

        info!(tag = %backup.tag, paths = backup.entries.len(), "Snapshot created");
        Ok(backup)
    }

    /// Put every captured path back exactly as recorded.
    pub fn restore(&self, backup: &Backup) -> Result<()> {
        let files_root = self.dir.join(&backup.tag).join("files");
        for entry in &backup.entries {
            match entry {
                PathState::Absent { path } => {
                    remove_existing(path)?;
                    debug!(path = %path.display(), "restored (removed)");
                }
                PathState::File { path, stored, mode } => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::copy(files_root.join(stored), path)?;
                    set_mode(path, *mode)?;
                    debug!(path = %path.display(), "restored (file)");
                }
                PathState::Dir { path, stored } => {
                    remove_existing(path)?;
                    copy_tree(&files_root.join(stored), path)?;
                    debug!(path = %path.display(), "restored (dir)");
                }
            }
        }
        info!(tag = %backup.tag, "Snapshot restored");
        Ok(())
    }

    /// All snapshots on disk, newest first. Unreadable metadata is
    /// skipped with a warning rather than failing the listing.
    pub fn list(&self) -> Result<Vec<Backup>> {
        let mut backups = Vec::new();
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(backups),
            Err(e) => return Err(e.into()),
        };
        for entry in read_dir {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let meta_path = entry.path().join(BACKUP_META);
            let raw = match fs::read_to_string(&meta_path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %meta_path.display(), "Skipping unreadable snapshot: {e}");
                    continue;
                }
            };
            match serde_json::from_str::<Backup>(&raw) {
                Ok(backup) => backups.push(backup),
                Err(e) => {
                    warn!(path = %meta_path.display(), "Skipping corrupt snapshot metadata: {e}");
                }
            }
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// Delete snapshots beyond the retention bounds, oldest first.
    /// Returns how many were removed.
    pub fn prune(&self) -> Result<usize> {
        let backups = self.list()?;
        let cutoff = Utc::now() - Duration::days(self.max_age_days);
        let mut removed = 0;

        for (index, backup) in backups.iter().enumerate() {
            let too_many = index >= self.max_count;
            let too_old = backup.created_at < cutoff;
            if too_many || too_old {
                fs::remove_dir_all(self.dir.join(&backup.tag))?;
                info!(tag = %backup.tag, too_many, too_old, "Pruned snapshot");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl PathState {
    fn label(&self) -> &'static str {
        match self {
            PathState::Absent { .. } => "absent",
            PathState::File { .. } => "file",
            PathState::Dir { .. } => "dir",
        }
    }
}

fn capture(files_root: &Path, path: &Path) -> Result<PathState> {
    let meta = match fs::symlink_metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(PathState::Absent {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(e.into()),
        Ok(meta) => meta,
    };

    let stored = stored_rel(path);
    let stored_abs = files_root.join(&stored);

    if meta.is_dir() {
        copy_tree(path, &stored_abs)?;
        Ok(PathState::Dir {
            path: path.to_path_buf(),
            stored,
        })
    } else {
        if let Some(parent) = stored_abs.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(path, &stored_abs)?;
        Ok(PathState::File {
            path: path.to_path_buf(),
            stored,
            mode: file_mode(&meta),
        })
    }
}

/// Where a host path is kept inside the snapshot: the same path with the
/// leading root stripped.
fn stored_rel(path: &Path) -> PathBuf {
    path.strip_prefix("/").unwrap_or(path).to_path_buf()
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
        // symlinks are not part of the managed config trees
    }
    Ok(())
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
    }
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(root: &Path) -> BackupManager {
        BackupManager::new(&BackupConfig {
            dir: root.join("backups"),
            max_count: 10,
            max_age_days: 30,
        })
    }

    #[test]
    fn restores_an_overwritten_file_with_its_mode() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("host/config.json");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, b"old content").unwrap();
        set_mode(&target, 0o600).unwrap();

        let mgr = manager(tmp.path());
        let backup = mgr
            .snapshot(&[target.clone()], &Version::new(1, 2, 0))
            .unwrap();

        fs::write(&target, b"new content").unwrap();
        set_mode(&target, 0o777).unwrap();

        mgr.restore(&backup).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"old content");
        #[cfg(unix)]
        assert_eq!(file_mode(&fs::metadata(&target).unwrap()), 0o600);
    }

    #[test]
    fn restores_an_absent_path_by_deleting_it() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("host/created-later.json");

        let mgr = manager(tmp.path());
        let backup = mgr
            .snapshot(&[target.clone()], &Version::new(1, 2, 0))
            .unwrap();

        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, b"installed by the update").unwrap();

        mgr.restore(&backup).unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn restore_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let kept = tmp.path().join("host/kept.json");
        let absent = tmp.path().join("host/absent.json");
        fs::create_dir_all(tmp.path().join("host")).unwrap();
        fs::write(&kept, b"v1").unwrap();

        let mgr = manager(tmp.path());
        let backup = mgr
            .snapshot(&[kept.clone(), absent.clone()], &Version::new(1, 2, 0))
            .unwrap();

        fs::write(&kept, b"v2").unwrap();
        fs::write(&absent, b"v2").unwrap();

        mgr.restore(&backup).unwrap();
        mgr.restore(&backup).unwrap();
        assert_eq!(fs::read(&kept).unwrap(), b"v1");
        assert!(!absent.exists());
    }

    #[test]
    fn restores_a_directory_tree_exactly() {
        let tmp = TempDir::new().unwrap();
        let tree = tmp.path().join("host/confdir");
        fs::create_dir_all(tree.join("nested")).unwrap();
        fs::write(tree.join("a.conf"), b"alpha").unwrap();
        fs::write(tree.join("nested/b.conf"), b"beta").unwrap();

        let mgr = manager(tmp.path());
        let backup = mgr
            .snapshot(&[tree.clone()], &Version::new(1, 2, 0))
            .unwrap();

        fs::write(tree.join("a.conf"), b"changed").unwrap();
        fs::write(tree.join("added.conf"), b"should vanish").unwrap();
        fs::remove_file(tree.join("nested/b.conf")).unwrap();

        mgr.restore(&backup).unwrap();
        assert_eq!(fs::read(tree.join("a.conf")).unwrap(), b"alpha");
        assert_eq!(fs::read(tree.join("nested/b.conf")).unwrap(), b"beta");
        assert!(!tree.join("added.conf").exists());
    }

    #[test]
    fn duplicate_paths_collapse_to_one_entry() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("host/one.json");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, b"x").unwrap();

        let mgr = manager(tmp.path());
        let backup = mgr
            .snapshot(&[target.clone(), target.clone()], &Version::new(1, 0, 1))
            .unwrap();
        assert_eq!(backup.entries.len(), 1);
    }

    #[test]
    fn prune_keeps_only_the_newest_snapshots() {
        let tmp = TempDir::new().unwrap();
        let mgr = BackupManager::new(&BackupConfig {
            dir: tmp.path().join("backups"),
            max_count: 2,
            max_age_days: 30,
        });

        for patch in 0..4u64 {
            mgr.snapshot(&[], &Version::new(1, 0, patch)).unwrap();
        }

        let removed = mgr.prune().unwrap();
        assert_eq!(removed, 2);

        let left = mgr.list().unwrap();
        assert_eq!(left.len(), 2);
        // newest first
        assert_eq!(left[0].version, "1.0.3");
        assert_eq!(left[1].version, "1.0.2");
    }

    #[test]
    fn prune_drops_snapshots_past_the_age_limit() {
        let tmp = TempDir::new().unwrap();
        let mgr = BackupManager::new(&BackupConfig {
            dir: tmp.path().join("backups"),
            max_count: 10,
            max_age_days: 7,
        });

        let backup = mgr.snapshot(&[], &Version::new(1, 0, 0)).unwrap();

        // age the metadata past the cutoff
        let meta_path = tmp
            .path()
            .join("backups")
            .join(&backup.tag)
            .join(BACKUP_META);
        let mut doc: Backup =
            serde_json::from_str(&fs::read_to_string(&meta_path).unwrap()).unwrap();
        doc.created_at = Utc::now() - Duration::days(30);
        fs::write(&meta_path, serde_json::to_string(&doc).unwrap()).unwrap();

        assert_eq!(mgr.prune().unwrap(), 1);
        assert!(mgr.list().unwrap().is_empty());
    }

    #[test]
    fn list_survives_a_corrupt_metadata_file() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());
        mgr.snapshot(&[], &Version::new(1, 0, 0)).unwrap();

        let rogue = tmp.path().join("backups/rogue");
        fs::create_dir_all(&rogue).unwrap();
        fs::write(rogue.join(BACKUP_META), "not json").unwrap();

        assert_eq!(mgr.list().unwrap().len(), 1);
    }
}
