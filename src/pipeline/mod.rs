// backuptool/src/pipeline/mod.rs
//! Sequences the end-to-end run: condition gating, space check, engine
//! supervision, post-processing, retention, reporting. Owns the single
//! pass/fail outcome.

use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::conditions::{self, ConditionPhase};
use crate::config::RunConfig;
use crate::engine;
use crate::errors::Failure;
use crate::mysql;
use crate::postprocess;
use crate::report;
use crate::space;
use crate::store::dir_info::{dir_size_bytes, free_bytes};
use crate::store::{BackupArtifact, StoreManager};
use crate::supervisor::ShutdownSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// A skip condition matched; no backup attempted, not an error.
    SkippedOk,
    Failed,
}

/// Terminal result of one pipeline run, finalized once and handed to the
/// reporter. Post-backup housekeeping problems land in `warnings` and
/// never flip a Success status.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub status: RunStatus,
    pub failure: Option<Failure>,
    pub elapsed: Duration,
    pub artifact: Option<BackupArtifact>,
    pub warnings: Vec<String>,
}

impl PipelineOutcome {
    pub fn exit_code(&self) -> u8 {
        match self.status {
            RunStatus::Success | RunStatus::SkippedOk => 0,
            RunStatus::Failed => self.failure.as_ref().map(Failure::exit_code).unwrap_or(1),
        }
    }
}

/// Runs the whole pipeline and reports the outcome. The reporter always
/// runs last, including on failure; its own failure only logs a warning.
pub async fn run(config: &RunConfig, shutdown: &ShutdownSignal) -> PipelineOutcome {
    let started = Instant::now();
    let mut outcome = execute(config, shutdown).await;
    outcome.elapsed = started.elapsed();

    if !report::report(&config.zabbix, &outcome).await {
        warn!("failed to report outcome to monitoring endpoint");
    }
    outcome
}

async fn execute(config: &RunConfig, shutdown: &ShutdownSignal) -> PipelineOutcome {
    let mut warnings: Vec<String> = Vec::new();

    let store = match StoreManager::create(&config.backup_dir) {
        Ok(store) => store,
        Err(e) => {
            error!("failed to set up run directory: {:#}", e);
            return failed(Failure::Config(format!("{:#}", e)), warnings);
        }
    };

    // Skip phase: a match means "don't back up", and that is a success.
    let skip = conditions::run_phase(
        ConditionPhase::Skip,
        &config.conditions.skip_conditions,
        config.conditions.skip_conditions_timeout,
        None,
    )
    .await;
    if skip.matched {
        info!("backup skipped due to skip conditions (but considered successful)");
        store.remove_skipped();
        return PipelineOutcome {
            status: RunStatus::SkippedOk,
            failure: None,
            elapsed: Duration::ZERO,
            artifact: None,
            warnings,
        };
    }

    // Run phase: everything must pass or the pipeline aborts.
    let gate = conditions::run_phase(
        ConditionPhase::Run,
        &config.conditions.run_conditions,
        config.conditions.run_conditions_timeout,
        None,
    )
    .await;
    if gate.failed {
        error!("backup aborted due to failed run conditions");
        store.remove_skipped();
        let reason = gate
            .failure_reason
            .unwrap_or_else(|| "run condition failed".to_string());
        return failed(Failure::Condition(reason), warnings);
    }

    let mysql_info = match mysql::load(&config.mysql_bin).await {
        Ok(info) => info,
        Err(e) => {
            error!("failed to query MySQL server: {:#}", e);
            store.remove_skipped();
            return failed(Failure::Config(format!("{:#}", e)), warnings);
        }
    };
    // A wrong engine release silently produces unusable backups, so the
    // mismatch aborts the run unless the operator disabled the check.
    if config.check_xtrabackup_version {
        if let Err(failure) =
            engine::check_engine_version(&config.xtrabackup_bin, &mysql_info.server_version).await
        {
            error!("{}", failure);
            store.remove_skipped();
            return failed(failure, warnings);
        }
    }

    let data_dir_bytes = dir_size_bytes(&mysql_info.data_dir);
    info!("server reports {} databases", mysql_info.databases.len());
    info!(
        "starting backup with strategy {} (tgz={}), data directory {} uses {}",
        config.strategy.as_str(),
        config.tgz,
        mysql_info.data_dir.display(),
        space::format_bytes(data_dir_bytes)
    );

    if config.delete_before {
        let prune = store.prune_before(&config.retention);
        warnings.extend(prune.warnings);
    }

    // Space guard, before any engine subprocess is launched.
    let free = match free_bytes(&config.backup_dir).await {
        Ok(free) => free,
        Err(e) => {
            error!("failed to query free space: {:#}", e);
            store.remove_skipped();
            return failed(Failure::Config(format!("{:#}", e)), warnings);
        }
    };
    let check = space::check_space(
        free,
        data_dir_bytes,
        config.strategy,
        config.tgz,
        config.space_margin_percent,
    );
    info!(
        "backup requires approximately {}, having {} free",
        space::format_bytes(check.required_bytes),
        space::format_bytes(check.free_bytes)
    );
    if !check.ok {
        error!(
            "not enough free space in target directory, short {}",
            space::format_bytes(check.shortfall_bytes)
        );
        store.remove_skipped();
        return failed(
            Failure::SpaceInsufficient(format!(
                "required {} but only {} free (short {})",
                space::format_bytes(check.required_bytes),
                space::format_bytes(check.free_bytes),
                space::format_bytes(check.shortfall_bytes)
            )),
            warnings,
        );
    }

    // The engine run: the only step allowed to block for hours.
    let raw_path = match engine::run_backup(config, store.current_dir(), shutdown).await {
        Ok(path) => path,
        Err(failure) => {
            error!("{}", failure);
            return failed(failure, warnings);
        }
    };

    let artifact =
        match postprocess::post_process(config, store.current_dir(), raw_path, shutdown).await {
            Ok(artifact) => artifact,
            Err(failure) => {
                error!("{}", failure);
                return failed(failure, warnings);
            }
        };
    info!(
        "backup artifact created at {} ({})",
        artifact.path.display(),
        space::format_bytes(artifact.size_bytes)
    );

    // Housekeeping after a successful backup: problems are warnings only.
    if let Err(e) = store.store_backup_info(data_dir_bytes) {
        warn!("failed to store backup info: {:#}", e);
        warnings.push(format!("backup info: {:#}", e));
    }
    if let Err(e) = store.link_to_last() {
        warn!("failed to update last link: {:#}", e);
        warnings.push(format!("last link: {:#}", e));
    }
    if !config.delete_before {
        let prune = store.prune_after(&config.retention);
        warnings.extend(prune.warnings);
    }

    // Terminate phase: the run is incomplete until finalize actions
    // (e.g. offsite copy) succeed, even though the artifact exists.
    let terminate = conditions::run_phase(
        ConditionPhase::Terminate,
        &config.conditions.terminate_conditions,
        config.conditions.terminate_conditions_timeout,
        Some(store.current_dir()),
    )
    .await;
    if terminate.failed {
        error!("one or more terminate conditions failed");
        let reason = terminate
            .failure_reason
            .unwrap_or_else(|| "terminate condition failed".to_string());
        return PipelineOutcome {
            status: RunStatus::Failed,
            failure: Some(Failure::Terminate(reason)),
            elapsed: Duration::ZERO,
            artifact: Some(artifact),
            warnings,
        };
    }

    info!("backup completed successfully");
    PipelineOutcome {
        status: RunStatus::Success,
        failure: None,
        elapsed: Duration::ZERO,
        artifact: Some(artifact),
        warnings,
    }
}

fn failed(failure: Failure, warnings: Vec<String>) -> PipelineOutcome {
    PipelineOutcome {
        status: RunStatus::Failed,
        failure: Some(failure),
        elapsed: Duration::ZERO,
        artifact: None,
        warnings,
    }
}
