// backuptool/src/engine/mod.rs
//! Builds and runs the xtrabackup invocation for the configured strategy.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{error, info};

use crate::config::{BackupStrategy, RunConfig};
use crate::errors::Failure;
use crate::supervisor::{self, Classification, ShutdownSignal, StdoutSink};

/// Resolves the configured parallelism: positive values are used as-is,
/// zero/negative mean "CPU count plus N", clamped to at least 1.
pub fn effective_parallelism(desired: i64) -> usize {
    if desired > 0 {
        return desired as usize;
    }
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get() as i64)
        .unwrap_or(1);
    (cpus + desired).max(1) as usize
}

/// Arguments for the copy step of the Regular strategies.
pub fn backup_args(config: &RunConfig, target_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "--backup".to_string(),
        format!("--target-dir={}", target_dir.display()),
        format!("--parallel={}", effective_parallelism(config.parallelism)),
    ];
    args.extend(config.xtrabackup_options.iter().cloned());
    args
}

/// Arguments for the in-place prepare pass.
pub fn prepare_args(target_dir: &Path) -> Vec<String> {
    vec![
        "--prepare".to_string(),
        format!("--target-dir={}", target_dir.display()),
    ]
}

/// Arguments for the streaming+compression mode. Output goes to stdout
/// and is redirected to the xbstream file by the supervisor.
pub fn streamcompress_args(config: &RunConfig) -> Vec<String> {
    let threads = effective_parallelism(config.parallelism);
    let mut args = vec![
        "--backup".to_string(),
        "--stream=xbstream".to_string(),
        "--compress".to_string(),
        format!("--compress-threads={}", threads),
        format!("--parallel={}", threads),
    ];
    args.extend(config.xtrabackup_options.iter().cloned());
    args
}

/// Extracts "major.minor" from a `xtrabackup --version` banner, e.g.
/// "xtrabackup version 8.0.35-33 based on MySQL server 8.0.35".
pub fn parse_engine_version(output: &str) -> Option<String> {
    let rest = &output[output.find("version ")? + "version ".len()..];
    major_minor(rest)
}

/// Reduces a full server version string ("8.0.36-0ubuntu0.22.04.1") to
/// its "major.minor" line.
pub fn major_minor(version: &str) -> Option<String> {
    let token: String = version
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = token.split('.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) if !major.is_empty() && !minor.is_empty() => {
            Some(format!("{}.{}", major, minor))
        }
        _ => None,
    }
}

/// Engine line required for a given server line. Each server series has
/// exactly one matching xtrabackup series.
pub fn required_engine_version(server_line: &str) -> Option<&'static str> {
    match server_line {
        "5.6" | "5.7" => Some("2.4"),
        "8.0" => Some("8.0"),
        "8.2" => Some("8.2"),
        "8.4" => Some("8.4"),
        _ => None,
    }
}

/// Queries the installed engine version from `xtrabackup --version`.
/// Some engine versions print the banner on stderr, so both streams are
/// inspected.
pub async fn query_engine_version(xtrabackup_bin: &str) -> Result<String> {
    let output = Command::new(xtrabackup_bin)
        .arg("--version")
        .output()
        .await
        .with_context(|| format!("Failed to execute {} --version", xtrabackup_bin))?;
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    parse_engine_version(&text)
        .with_context(|| format!("Unable to parse engine version from: {}", text.trim()))
}

/// Pre-flight compatibility check between the installed engine and the
/// live server. A mismatched engine silently produces broken backups, so
/// this aborts the run before anything is copied.
pub async fn check_engine_version(
    xtrabackup_bin: &str,
    server_version: &str,
) -> Result<(), Failure> {
    let server_line = major_minor(server_version).ok_or_else(|| {
        Failure::Config(format!("unrecognized MySQL version: {}", server_version))
    })?;
    let required = required_engine_version(&server_line).ok_or_else(|| {
        Failure::Config(format!(
            "MySQL version {} is unknown, disable check_xtrabackup_version to proceed",
            server_line
        ))
    })?;
    let installed = query_engine_version(xtrabackup_bin)
        .await
        .map_err(|e| Failure::Config(format!("{:#}", e)))?;
    if installed != required {
        return Err(Failure::Config(format!(
            "xtrabackup {} is not compatible with MySQL {}, xtrabackup {} is required",
            installed, server_line, required
        )));
    }
    info!("xtrabackup {} is compatible with MySQL {}", installed, server_line);
    Ok(())
}

fn engine_command(config: &RunConfig, args: &[String]) -> Command {
    info!("executing engine command: {} {}", config.xtrabackup_bin, args.join(" "));
    let mut cmd = Command::new(&config.xtrabackup_bin);
    cmd.args(args);
    cmd
}

/// Runs the engine for the configured strategy inside `run_dir` and
/// returns the path of the raw result (directory or xbstream file).
pub async fn run_backup(
    config: &RunConfig,
    run_dir: &Path,
    shutdown: &ShutdownSignal,
) -> Result<PathBuf, Failure> {
    match config.strategy {
        BackupStrategy::Regular | BackupStrategy::RegularPrepare => {
            let backup_dir = run_dir.join("backup");
            let args = backup_args(config, &backup_dir);
            supervise_engine(
                config,
                engine_command(config, &args),
                StdoutSink::Capture,
                "backup",
                shutdown,
            )
            .await?;
            Ok(backup_dir)
        }
        BackupStrategy::StreamCompress => {
            let output_file = run_dir.join("backup.xbstream");
            let args = streamcompress_args(config);
            supervise_engine(
                config,
                engine_command(config, &args),
                StdoutSink::File(output_file.clone()),
                "streamcompress backup",
                shutdown,
            )
            .await?;
            // The stream went straight to disk; an empty file means the
            // engine produced nothing despite claiming success.
            let size = output_file.metadata().map(|m| m.len()).unwrap_or(0);
            if size == 0 {
                error!("streamcompress output file is empty or missing");
                return Err(Failure::Engine(
                    "streamcompress output file is empty or missing".to_string(),
                ));
            }
            Ok(output_file)
        }
    }
}

/// Runs the prepare pass against an already-copied backup directory.
/// Failures here are post-processing failures, not engine failures.
pub async fn run_prepare(
    config: &RunConfig,
    backup_dir: &Path,
    shutdown: &ShutdownSignal,
) -> Result<(), Failure> {
    if !backup_dir.exists() {
        return Err(Failure::PostProcess(format!(
            "backup directory does not exist: {}",
            backup_dir.display()
        )));
    }
    let args = prepare_args(backup_dir);
    supervise_engine(
        config,
        engine_command(config, &args),
        StdoutSink::Capture,
        "prepare",
        shutdown,
    )
    .await
    .map_err(|failure| match failure {
        Failure::Engine(reason) => Failure::PostProcess(format!("prepare: {}", reason)),
        Failure::EngineTimeout(secs) => {
            Failure::PostProcess(format!("prepare timed out after {} seconds", secs))
        }
        other => other,
    })?;
    Ok(())
}

async fn supervise_engine(
    config: &RunConfig,
    command: Command,
    sink: StdoutSink,
    step: &str,
    shutdown: &ShutdownSignal,
) -> Result<(), Failure> {
    let (result, classification) = supervisor::supervise(
        command,
        sink,
        config.backup_timeout_secs,
        config.verbose_capture,
        shutdown.clone(),
    )
    .await
    .map_err(|e| Failure::Engine(format!("{}: {:#}", step, e)))?;

    match classification {
        Classification::Success => {
            info!("engine {} step completed successfully", step);
            Ok(())
        }
        Classification::TimedOut => Err(Failure::EngineTimeout(config.backup_timeout_secs)),
        Classification::Failure(reason) => {
            error!("engine {} step failed: {}", step, reason);
            let stderr = result.stderr.trim();
            if !stderr.is_empty() {
                error!("engine stderr: {}", stderr);
                Err(Failure::Engine(format!("{}: {}; stderr: {}", step, reason, stderr)))
            } else {
                Err(Failure::Engine(format!("{}: {}", step, reason)))
            }
        }
    }
}
