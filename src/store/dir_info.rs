// backuptool/src/store/dir_info.rs
use anyhow::{Context, Result};
use std::path::Path;
use tokio::process::Command;
use walkdir::WalkDir;

/// Total size in bytes of all regular files under `dir`. Symlinks are
/// not followed, matching what the backup actually copies.
pub fn dir_size_bytes(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

/// Free bytes on the filesystem hosting `dir`, queried via `df -Pk`.
pub async fn free_bytes(dir: &Path) -> Result<u64> {
    let output = Command::new("df")
        .arg("-Pk")
        .arg(dir)
        .output()
        .await
        .with_context(|| format!("Failed to execute df for {}", dir.display()))?;
    if !output.status.success() {
        anyhow::bail!(
            "df failed for {} with status {}: {}",
            dir.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    parse_df_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parses POSIX `df -Pk` output: a header line followed by exactly one
/// data line whose fourth column is the available 1K block count.
pub(crate) fn parse_df_output(output: &str) -> Result<u64> {
    let line = output
        .lines()
        .nth(1)
        .context("Unexpected df output: missing data line")?;
    let available_kb: u64 = line
        .split_whitespace()
        .nth(3)
        .context("Unexpected df output: missing available column")?
        .parse()
        .context("Unexpected df output: available column is not a number")?;
    Ok(available_kb * 1024)
}
