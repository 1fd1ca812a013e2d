// backuptool/src/store/mod.rs
//! Manages the backup root: timestamped run directories, retention
//! pruning, per-run metadata, and the `last` convenience link.

pub mod dir_info;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{BackupStrategy, RetentionPolicy};

const DIR_PREFIX: &str = "backup_";
const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const INFO_FILE: &str = "info.json";

/// The single artifact a successful run produces: either the prepared
/// backup directory, an xbstream file, or a tar.gz archive.
#[derive(Debug, Clone)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: chrono::DateTime<Local>,
    pub strategy: BackupStrategy,
}

/// Per-run metadata persisted as `info.json`, so the next run can reason
/// about the compression achieved by the previous one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub data_dir_bytes_used: u64,
    pub backup_bytes_used: u64,
    pub compression_ratio: f64,
}

/// What a pruning pass did: removed paths, plus warnings for entries
/// that violated the policy but could not be deleted.
#[derive(Debug, Default)]
pub struct PruneReport {
    pub deleted: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

pub struct StoreManager {
    backup_root: PathBuf,
    current_dir: PathBuf,
}

impl StoreManager {
    /// Creates a fresh, uniquely named run directory under `backup_root`.
    /// The timestamp in the name orders directories for retention.
    pub fn create(backup_root: &Path) -> Result<Self> {
        let timestamp = Local::now().format(TIMESTAMP_FORMAT);
        let current_dir = backup_root.join(format!("{}{}", DIR_PREFIX, timestamp));
        fs::create_dir_all(&current_dir).with_context(|| {
            format!("Failed to create run directory: {}", current_dir.display())
        })?;
        info!("run directory created at {}", current_dir.display());
        Ok(StoreManager {
            backup_root: backup_root.to_path_buf(),
            current_dir,
        })
    }

    pub fn current_dir(&self) -> &Path {
        &self.current_dir
    }

    /// Prunes prior runs before the backup, leaving one slot for the run
    /// about to happen. Only useful when disk is tight.
    pub fn prune_before(&self, policy: &RetentionPolicy) -> PruneReport {
        self.prune_impl(policy.max_versions.map(|n| n.saturating_sub(1)), policy.max_age_days)
    }

    /// Prunes prior runs after the backup. The current run occupies one
    /// retention slot and is never deleted.
    pub fn prune_after(&self, policy: &RetentionPolicy) -> PruneReport {
        self.prune_impl(policy.max_versions.map(|n| n.saturating_sub(1)), policy.max_age_days)
    }

    /// Deletes prior run directories beyond `max_others` (newest kept) or
    /// older than `max_age_days`. An entry violating either rule goes.
    /// Deletion failures are warnings; they never fail the run.
    fn prune_impl(&self, max_others: Option<usize>, max_age_days: Option<i64>) -> PruneReport {
        let now = Local::now().naive_local();
        let mut report = PruneReport::default();

        for (index, (created_at, path)) in self.prior_run_dirs().into_iter().enumerate() {
            let over_count = max_others.is_some_and(|max| index >= max);
            let too_old = max_age_days
                .is_some_and(|days| now - created_at > TimeDelta::days(days));
            if !over_count && !too_old {
                continue;
            }
            debug!(
                "pruning {} (over_count={}, too_old={})",
                path.display(),
                over_count,
                too_old
            );
            match fs::remove_dir_all(&path) {
                Ok(()) => report.deleted.push(path),
                Err(e) => {
                    warn!("failed to remove old backup {}: {}", path.display(), e);
                    report
                        .warnings
                        .push(format!("retention: could not remove {}: {}", path.display(), e));
                }
            }
        }

        if !report.deleted.is_empty() {
            info!(
                "removed {} old backup director{}",
                report.deleted.len(),
                if report.deleted.len() == 1 { "y" } else { "ies" }
            );
        }
        report
    }

    /// Prior run directories under the backup root, newest first. Entries
    /// not matching the `backup_<timestamp>` naming are ignored, as is
    /// the current run directory.
    fn prior_run_dirs(&self) -> Vec<(NaiveDateTime, PathBuf)> {
        let entries = match fs::read_dir(&self.backup_root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("failed to list backup root {}: {}", self.backup_root.display(), e);
                return Vec::new();
            }
        };

        let mut dirs: Vec<(NaiveDateTime, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir() && *path != self.current_dir)
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?;
                Some((parse_dir_timestamp(name)?, path))
            })
            .collect();
        dirs.sort_by(|a, b| b.0.cmp(&a.0));
        dirs
    }

    /// Writes `info.json` into the run directory after a successful backup.
    pub fn store_backup_info(&self, data_dir_bytes_used: u64) -> Result<()> {
        let backup_bytes_used = dir_info::dir_size_bytes(&self.current_dir);
        let compression_ratio = if data_dir_bytes_used > 0 {
            backup_bytes_used as f64 / data_dir_bytes_used as f64
        } else {
            0.0
        };
        let info = BackupInfo {
            data_dir_bytes_used,
            backup_bytes_used,
            compression_ratio,
        };
        let info_path = self.current_dir.join(INFO_FILE);
        let json = serde_json::to_string_pretty(&info).context("Failed to serialize backup info")?;
        fs::write(&info_path, json)
            .with_context(|| format!("Failed to write {}", info_path.display()))?;
        Ok(())
    }

    /// Points `<backup_root>/last` at the current run directory, replacing
    /// whatever was there.
    pub fn link_to_last(&self) -> Result<()> {
        let link_path = self.backup_root.join("last");
        let metadata = fs::symlink_metadata(&link_path);
        if let Ok(metadata) = metadata {
            if metadata.is_symlink() || metadata.is_file() {
                fs::remove_file(&link_path)
                    .with_context(|| format!("Failed to remove {}", link_path.display()))?;
            } else {
                fs::remove_dir_all(&link_path)
                    .with_context(|| format!("Failed to remove {}", link_path.display()))?;
            }
        }
        std::os::unix::fs::symlink(&self.current_dir, &link_path)
            .with_context(|| format!("Failed to link {}", link_path.display()))?;
        Ok(())
    }

    /// Removes the run directory of a skipped run, so skips leave no
    /// empty directories behind.
    pub fn remove_skipped(&self) {
        if let Err(e) = fs::remove_dir_all(&self.current_dir) {
            warn!(
                "failed to remove skipped run directory {}: {}",
                self.current_dir.display(),
                e
            );
        }
    }
}

/// Parses the timestamp out of a `backup_YYYYMMDD-HHMMSS` directory name.
/// Anything else (including prefixed-but-malformed names) is rejected.
pub fn parse_dir_timestamp(name: &str) -> Option<NaiveDateTime> {
    let timestamp = name.strip_prefix(DIR_PREFIX)?;
    NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn make_run_dir(root: &Path, age: Duration) -> PathBuf {
        let created = Local::now() - age;
        let path = root.join(format!("{}{}", DIR_PREFIX, created.format(TIMESTAMP_FORMAT)));
        fs::create_dir(&path).unwrap();
        fs::write(path.join("dummy"), b"x").unwrap();
        path
    }

    #[test]
    fn parse_dir_timestamp_accepts_only_the_run_format() {
        assert!(parse_dir_timestamp("backup_20260825-120000").is_some());
        assert!(parse_dir_timestamp("backup_2026-08-25").is_none());
        assert!(parse_dir_timestamp("backup_garbage").is_none());
        assert!(parse_dir_timestamp("other_20260825-120000").is_none());
        assert!(parse_dir_timestamp("last").is_none());
    }

    #[test]
    fn prune_by_count_keeps_newest_and_never_current() -> Result<()> {
        let root = tempdir()?;
        let oldest = make_run_dir(root.path(), Duration::days(3));
        let middle = make_run_dir(root.path(), Duration::days(2));
        let newest = make_run_dir(root.path(), Duration::days(1));

        let store = StoreManager::create(root.path())?;
        let policy = RetentionPolicy {
            max_versions: Some(3),
            max_age_days: None,
        };
        let deleted = store.prune_after(&policy).deleted;

        // Current plus two newest priors survive.
        assert_eq!(deleted, vec![oldest.clone()]);
        assert!(!oldest.exists());
        assert!(middle.exists());
        assert!(newest.exists());
        assert!(store.current_dir().exists());
        Ok(())
    }

    #[test]
    fn prune_by_age_removes_expired_runs() -> Result<()> {
        let root = tempdir()?;
        let expired = make_run_dir(root.path(), Duration::days(30));
        let fresh = make_run_dir(root.path(), Duration::days(2));

        let store = StoreManager::create(root.path())?;
        let policy = RetentionPolicy {
            max_versions: None,
            max_age_days: Some(14),
        };
        let deleted = store.prune_after(&policy).deleted;

        assert_eq!(deleted, vec![expired.clone()]);
        assert!(!expired.exists());
        assert!(fresh.exists());
        Ok(())
    }

    #[test]
    fn prune_applies_both_rules() -> Result<()> {
        let root = tempdir()?;
        let expired = make_run_dir(root.path(), Duration::days(30));
        let over_count = make_run_dir(root.path(), Duration::days(3));
        let kept = make_run_dir(root.path(), Duration::days(1));

        let store = StoreManager::create(root.path())?;
        let policy = RetentionPolicy {
            max_versions: Some(2),
            max_age_days: Some(14),
        };
        let deleted = store.prune_after(&policy).deleted;

        assert_eq!(deleted.len(), 2);
        assert!(!expired.exists());
        assert!(!over_count.exists());
        assert!(kept.exists());
        assert!(store.current_dir().exists());
        Ok(())
    }

    #[test]
    fn prune_never_deletes_current_even_with_minimal_policy() -> Result<()> {
        let root = tempdir()?;
        let store = StoreManager::create(root.path())?;
        let policy = RetentionPolicy {
            max_versions: Some(1),
            max_age_days: Some(0),
        };
        store.prune_after(&policy);
        assert!(store.current_dir().exists());
        Ok(())
    }

    #[test]
    fn prune_ignores_foreign_directories() -> Result<()> {
        let root = tempdir()?;
        let foreign = root.path().join("not-a-backup");
        fs::create_dir(&foreign)?;

        let store = StoreManager::create(root.path())?;
        let policy = RetentionPolicy {
            max_versions: Some(1),
            max_age_days: Some(0),
        };
        store.prune_after(&policy);
        assert!(foreign.exists());
        Ok(())
    }

    #[test]
    fn prune_before_leaves_a_slot_for_the_new_run() -> Result<()> {
        let root = tempdir()?;
        let older = make_run_dir(root.path(), Duration::days(2));
        let newer = make_run_dir(root.path(), Duration::days(1));

        let store = StoreManager::create(root.path())?;
        let policy = RetentionPolicy {
            max_versions: Some(2),
            max_age_days: None,
        };
        let deleted = store.prune_before(&policy).deleted;

        assert_eq!(deleted, vec![older.clone()]);
        assert!(newer.exists());
        Ok(())
    }

    #[test]
    fn backup_info_is_written_with_compression_ratio() -> Result<()> {
        let root = tempdir()?;
        let store = StoreManager::create(root.path())?;
        fs::write(store.current_dir().join("backup.tar.gz"), vec![0u8; 500])?;

        store.store_backup_info(1000)?;

        let json = fs::read_to_string(store.current_dir().join(INFO_FILE))?;
        let info: BackupInfo = serde_json::from_str(&json)?;
        assert_eq!(info.data_dir_bytes_used, 1000);
        assert_eq!(info.backup_bytes_used, 500);
        assert!((info.compression_ratio - 0.5).abs() < f64::EPSILON);
        Ok(())
    }

    #[test]
    fn last_link_points_at_current_run() -> Result<()> {
        let root = tempdir()?;
        let store = StoreManager::create(root.path())?;
        store.link_to_last()?;

        let link = root.path().join("last");
        assert_eq!(fs::read_link(&link)?, store.current_dir());

        // Replacing an existing link works too.
        let store2 = StoreManager::create(root.path())?;
        store2.link_to_last()?;
        assert_eq!(fs::read_link(&link)?, store2.current_dir());
        Ok(())
    }

    #[test]
    fn remove_skipped_cleans_up_the_run_dir() -> Result<()> {
        let root = tempdir()?;
        let store = StoreManager::create(root.path())?;
        let current = store.current_dir().to_path_buf();
        store.remove_skipped();
        assert!(!current.exists());
        Ok(())
    }
}
