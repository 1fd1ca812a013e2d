// backuptool/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawZabbixConfig {
    pub item_key: Option<String>,
    pub sender_bin: Option<String>,
    pub agent_conf: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConditionsConfig {
    pub skip_conditions: Option<Vec<String>>,
    pub skip_conditions_timeout: Option<u64>,
    pub run_conditions: Option<Vec<String>>,
    pub run_conditions_timeout: Option<u64>,
    pub terminate_conditions: Option<Vec<String>>,
    pub terminate_conditions_timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawRetentionConfig {
    pub max_versions: Option<usize>,
    pub max_age_days: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    pub backup_dir: Option<PathBuf>,
    pub parallelism: Option<i64>,
    pub retention: Option<RawRetentionConfig>,
    pub delete_before: Option<bool>,
    pub xtrabackup_bin: Option<String>,
    pub mysql_bin: Option<String>,
    pub xtrabackup_options: Option<Vec<String>>,
    pub check_xtrabackup_version: Option<bool>,
    pub streamcompress: Option<bool>,
    pub prepare: Option<bool>,
    pub tgz: Option<bool>,
    pub backup_timeout_secs: Option<u64>,
    pub space_margin_percent: Option<u64>,
    pub verbose_capture: Option<bool>,
    pub log_level: Option<String>,
    pub zabbix: Option<RawZabbixConfig>,
    pub conditions: Option<RawConditionsConfig>,
}

/// The backup mode for a run, derived from the `streamcompress` and
/// `prepare` flags at load time. Selection is exhaustive and mutually
/// exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStrategy {
    /// Uncompressed copy of data files and logs into a fresh directory.
    Regular,
    /// Regular copy followed by an in-place log-apply pass, so the result
    /// is directly startable.
    RegularPrepare,
    /// Single compressed xbstream file written incrementally; no
    /// uncompressed copy ever exists on disk.
    StreamCompress,
}

impl BackupStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStrategy::Regular => "regular",
            BackupStrategy::RegularPrepare => "regular+prepare",
            BackupStrategy::StreamCompress => "streamcompress",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub max_versions: Option<usize>,
    pub max_age_days: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ZabbixConfig {
    /// Empty key disables reporting entirely.
    pub item_key: String,
    pub sender_bin: String,
    pub agent_conf: String,
}

#[derive(Debug, Clone)]
pub struct ConditionsConfig {
    pub skip_conditions: Vec<String>,
    pub skip_conditions_timeout: u64,
    pub run_conditions: Vec<String>,
    pub run_conditions_timeout: u64,
    pub terminate_conditions: Vec<String>,
    pub terminate_conditions_timeout: u64,
}

/// Validated run configuration, immutable after load. Owned by the
/// pipeline controller and passed read-only to every component.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub backup_dir: PathBuf,
    pub parallelism: i64,
    pub retention: RetentionPolicy,
    pub delete_before: bool,
    pub xtrabackup_bin: String,
    pub mysql_bin: String,
    pub xtrabackup_options: Vec<String>,
    /// Pre-flight engine/server version compatibility check.
    pub check_xtrabackup_version: bool,
    pub strategy: BackupStrategy,
    pub tgz: bool,
    /// 0 means no wall-clock limit on the engine subprocess.
    pub backup_timeout_secs: u64,
    pub space_margin_percent: u64,
    pub verbose_capture: bool,
    pub log_level: String,
    pub zabbix: ZabbixConfig,
    pub conditions: ConditionsConfig,
}

impl RunConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw: RawConfig = serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawConfig) -> Result<Self> {
        let backup_dir = raw
            .backup_dir
            .context("backup_dir must be set in config.json")?;
        if backup_dir.as_os_str().is_empty() {
            anyhow::bail!("backup_dir cannot be empty in config.json");
        }
        if !backup_dir.is_dir() {
            anyhow::bail!("Backup directory does not exist: {}", backup_dir.display());
        }

        let streamcompress = raw.streamcompress.unwrap_or(false);
        let prepare = raw.prepare.unwrap_or(false);
        let tgz = raw.tgz.unwrap_or(false);
        if streamcompress && (prepare || tgz) {
            anyhow::bail!("streamcompress is mutually exclusive with prepare and tgz options");
        }
        let strategy = if streamcompress {
            BackupStrategy::StreamCompress
        } else if prepare {
            BackupStrategy::RegularPrepare
        } else {
            BackupStrategy::Regular
        };

        // 0 would silence the engine entirely; negative values mean
        // "CPU count minus N" and are resolved at invocation time.
        let parallelism = match raw.parallelism {
            Some(0) => anyhow::bail!("parallelism cannot be zero"),
            Some(n) => n,
            None => std::thread::available_parallelism().map(|n| n.get() as i64).unwrap_or(1),
        };

        let retention = raw.retention.unwrap_or_default();
        if retention.max_versions == Some(0) {
            anyhow::bail!("retention.max_versions cannot be zero");
        }
        let retention = RetentionPolicy {
            max_versions: retention.max_versions.or(Some(1)),
            max_age_days: retention.max_age_days,
        };

        let zbx = raw.zabbix.unwrap_or_default();
        let conditions = raw.conditions.unwrap_or_default();

        Ok(RunConfig {
            backup_dir,
            parallelism,
            retention,
            delete_before: raw.delete_before.unwrap_or(false),
            xtrabackup_bin: raw.xtrabackup_bin.unwrap_or_else(|| "xtrabackup".to_string()),
            mysql_bin: raw.mysql_bin.unwrap_or_else(|| "mysql".to_string()),
            xtrabackup_options: raw.xtrabackup_options.unwrap_or_default(),
            check_xtrabackup_version: raw.check_xtrabackup_version.unwrap_or(true),
            strategy,
            tgz,
            backup_timeout_secs: raw.backup_timeout_secs.unwrap_or(0),
            space_margin_percent: raw.space_margin_percent.unwrap_or(5),
            verbose_capture: raw.verbose_capture.unwrap_or(false),
            log_level: raw.log_level.unwrap_or_else(|| "info".to_string()),
            zabbix: ZabbixConfig {
                item_key: zbx.item_key.unwrap_or_default(),
                sender_bin: zbx.sender_bin.unwrap_or_else(|| "zabbix_sender".to_string()),
                agent_conf: zbx
                    .agent_conf
                    .unwrap_or_else(|| "/etc/zabbix/zabbix_agentd.conf".to_string()),
            },
            conditions: ConditionsConfig {
                skip_conditions: conditions.skip_conditions.unwrap_or_default(),
                skip_conditions_timeout: conditions.skip_conditions_timeout.unwrap_or(0),
                run_conditions: conditions.run_conditions.unwrap_or_default(),
                run_conditions_timeout: conditions.run_conditions_timeout.unwrap_or(0),
                terminate_conditions: conditions.terminate_conditions.unwrap_or_default(),
                terminate_conditions_timeout: conditions.terminate_conditions_timeout.unwrap_or(0),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn raw_with_backup_dir(dir: &Path) -> RawConfig {
        RawConfig {
            backup_dir: Some(dir.to_path_buf()),
            parallelism: None,
            retention: None,
            delete_before: None,
            xtrabackup_bin: None,
            mysql_bin: None,
            xtrabackup_options: None,
            check_xtrabackup_version: None,
            streamcompress: None,
            prepare: None,
            tgz: None,
            backup_timeout_secs: None,
            space_margin_percent: None,
            verbose_capture: None,
            log_level: None,
            zabbix: None,
            conditions: None,
        }
    }

    #[test]
    fn defaults_are_applied() -> Result<()> {
        let dir = tempdir()?;
        let config = RunConfig::from_raw(raw_with_backup_dir(dir.path()))?;
        assert_eq!(config.strategy, BackupStrategy::Regular);
        assert!(!config.tgz);
        assert_eq!(config.retention.max_versions, Some(1));
        assert_eq!(config.retention.max_age_days, None);
        assert_eq!(config.xtrabackup_bin, "xtrabackup");
        assert_eq!(config.mysql_bin, "mysql");
        assert!(config.check_xtrabackup_version);
        assert_eq!(config.space_margin_percent, 5);
        assert_eq!(config.zabbix.sender_bin, "zabbix_sender");
        assert!(config.parallelism > 0);
        Ok(())
    }

    #[test]
    fn strategy_is_derived_from_flags() -> Result<()> {
        let dir = tempdir()?;

        let mut raw = raw_with_backup_dir(dir.path());
        raw.prepare = Some(true);
        assert_eq!(
            RunConfig::from_raw(raw)?.strategy,
            BackupStrategy::RegularPrepare
        );

        let mut raw = raw_with_backup_dir(dir.path());
        raw.streamcompress = Some(true);
        assert_eq!(
            RunConfig::from_raw(raw)?.strategy,
            BackupStrategy::StreamCompress
        );
        Ok(())
    }

    #[test]
    fn streamcompress_excludes_prepare_and_tgz() {
        let dir = tempdir().unwrap();
        let mut raw = raw_with_backup_dir(dir.path());
        raw.streamcompress = Some(true);
        raw.tgz = Some(true);
        assert!(RunConfig::from_raw(raw).is_err());

        let mut raw = raw_with_backup_dir(dir.path());
        raw.streamcompress = Some(true);
        raw.prepare = Some(true);
        assert!(RunConfig::from_raw(raw).is_err());
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let dir = tempdir().unwrap();
        let mut raw = raw_with_backup_dir(dir.path());
        raw.parallelism = Some(0);
        assert!(RunConfig::from_raw(raw).is_err());
    }

    #[test]
    fn missing_backup_dir_is_rejected() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let raw = raw_with_backup_dir(&missing);
        assert!(RunConfig::from_raw(raw).is_err());
    }

    #[test]
    fn load_from_json_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let config_path = dir.path().join("config.json");
        let json = format!(
            r#"{{
                "backup_dir": "{}",
                "parallelism": 4,
                "tgz": true,
                "check_xtrabackup_version": false,
                "retention": {{"max_versions": 3, "max_age_days": 14}},
                "conditions": {{"run_conditions": ["true"], "run_conditions_timeout": 30}},
                "zabbix": {{"item_key": "backup.status"}}
            }}"#,
            dir.path().display()
        );
        fs::write(&config_path, json)?;

        let config = RunConfig::load_from_json(&config_path)?;
        assert_eq!(config.parallelism, 4);
        assert!(config.tgz);
        assert!(!config.check_xtrabackup_version);
        assert_eq!(config.strategy, BackupStrategy::Regular);
        assert_eq!(config.retention.max_versions, Some(3));
        assert_eq!(config.retention.max_age_days, Some(14));
        assert_eq!(config.conditions.run_conditions, vec!["true".to_string()]);
        assert_eq!(config.conditions.run_conditions_timeout, 30);
        assert_eq!(config.zabbix.item_key, "backup.status");
        Ok(())
    }
}
