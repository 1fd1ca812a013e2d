// backuptool/src/postprocess/mod.rs
//! Turns a raw engine result into the final backup artifact: optional
//! prepare pass, optional tar.gz compression.

use anyhow::{Context, Result};
use chrono::Local;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;
use which::which;

use crate::config::{BackupStrategy, RunConfig};
use crate::engine;
use crate::errors::Failure;
use crate::store::dir_info::dir_size_bytes;
use crate::store::BackupArtifact;
use crate::supervisor::ShutdownSignal;

/// Applies the configured post-processing to the raw engine output and
/// returns the final artifact. Any sub-step failure is fatal; a partial
/// artifact is never registered.
pub async fn post_process(
    config: &RunConfig,
    run_dir: &Path,
    raw_path: PathBuf,
    shutdown: &ShutdownSignal,
) -> Result<BackupArtifact, Failure> {
    if config.strategy == BackupStrategy::RegularPrepare {
        info!("running prepare pass on {}", raw_path.display());
        engine::run_prepare(config, &raw_path, shutdown).await?;
    }

    let final_path = if config.tgz {
        compress_to_tgz(config, run_dir, &raw_path)
            .await
            .map_err(|e| Failure::PostProcess(format!("{:#}", e)))?
    } else {
        raw_path
    };

    let size_bytes = if final_path.is_dir() {
        dir_size_bytes(&final_path)
    } else {
        final_path.metadata().map(|m| m.len()).unwrap_or(0)
    };

    Ok(BackupArtifact {
        path: final_path,
        size_bytes,
        created_at: Local::now(),
        strategy: config.strategy,
    })
}

/// Archives `<run_dir>/backup` into `<run_dir>/backup.tar.gz`, preferring
/// pigz for parallel compression. The uncompressed directory is removed
/// only after the archive is verified, so a crash mid-archive still
/// leaves the original copy on disk.
async fn compress_to_tgz(
    config: &RunConfig,
    run_dir: &Path,
    backup_dir: &Path,
) -> Result<PathBuf> {
    if !backup_dir.is_dir() {
        anyhow::bail!("backup directory does not exist: {}", backup_dir.display());
    }
    let output_file = run_dir.join("backup.tar.gz");

    if which("pigz").is_ok() {
        let threads = engine::effective_parallelism(config.parallelism);
        info!("compressing backup with pigz using {} threads", threads);
        compress_with_pigz(run_dir, &output_file, threads).await?;
    } else {
        info!("compressing backup with gzip (pigz not available)");
        archive_dir_gz(backup_dir, &output_file)?;
    }

    let size = output_file.metadata().map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        anyhow::bail!("compression produced an empty or missing archive");
    }

    std::fs::remove_dir_all(backup_dir).with_context(|| {
        format!(
            "Failed to remove uncompressed backup directory: {}",
            backup_dir.display()
        )
    })?;
    info!("backup compressed successfully to {}", output_file.display());
    Ok(output_file)
}

async fn compress_with_pigz(run_dir: &Path, output_file: &Path, threads: usize) -> Result<()> {
    let pipeline = format!(
        "tar -cf - -C '{}' backup | pigz -p {} > '{}'",
        run_dir.display(),
        threads,
        output_file.display()
    );
    debug!("compression command: {}", pipeline);
    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(&pipeline)
        .output()
        .await
        .context("Failed to execute compression pipeline")?;
    if !output.status.success() {
        anyhow::bail!(
            "compression pipeline failed with status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

/// In-process tar.gz fallback. Archive entries live under a top-level
/// `backup/` directory, matching the external tar invocation.
fn archive_dir_gz(source_dir: &Path, dest_path: &Path) -> Result<()> {
    let archive_file = File::create(dest_path)
        .with_context(|| format!("Failed to create archive file: {}", dest_path.display()))?;
    let encoder = GzEncoder::new(archive_file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for entry in WalkDir::new(source_dir) {
        let entry = entry
            .with_context(|| format!("Failed to walk directory: {}", source_dir.display()))?;
        let path = entry.path();
        let relative = path.strip_prefix(source_dir).with_context(|| {
            format!("Failed to relativize {} in archive", path.display())
        })?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let name = Path::new("backup").join(relative);
        if path.is_file() {
            builder
                .append_path_with_name(path, &name)
                .with_context(|| format!("Failed to append {} to archive", path.display()))?;
        }
    }

    builder
        .into_inner()
        .context("Failed to finalize tar stream")?
        .finish()
        .context("Failed to finish gzip encoding")?;
    Ok(())
}
