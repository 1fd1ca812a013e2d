// backuptool/src/space/mod.rs
//! Pre-flight free-space estimation for the selected strategy.

use crate::config::BackupStrategy;

/// Outcome of the pre-flight space check.
#[derive(Debug, Clone, Copy)]
pub struct SpaceCheck {
    pub ok: bool,
    /// Required bytes including the safety margin.
    pub required_bytes: u64,
    pub free_bytes: u64,
    pub shortfall_bytes: u64,
}

/// Disk-footprint multiplier per strategy.
///
/// Streaming writes a single compressed file, so one source-size worth of
/// space suffices. A tgz step keeps the uncompressed copy around until the
/// archive completes, so it transiently needs twice the source size.
/// Prepare works in place and adds nothing.
pub fn space_multiplier(strategy: BackupStrategy, tgz: bool) -> f64 {
    match (strategy, tgz) {
        (BackupStrategy::StreamCompress, _) => 1.0,
        (BackupStrategy::Regular | BackupStrategy::RegularPrepare, true) => 2.0,
        (BackupStrategy::Regular | BackupStrategy::RegularPrepare, false) => 1.0,
    }
}

pub fn required_bytes(source_bytes: u64, strategy: BackupStrategy, tgz: bool) -> u64 {
    (source_bytes as f64 * space_multiplier(strategy, tgz)).ceil() as u64
}

/// Compares the strategy's space requirement (plus `margin_percent`)
/// against the free bytes on the target filesystem. Insufficient space is
/// a result, not an error; the pipeline aborts before any subprocess.
pub fn check_space(
    free_bytes: u64,
    source_bytes: u64,
    strategy: BackupStrategy,
    tgz: bool,
    margin_percent: u64,
) -> SpaceCheck {
    let base = required_bytes(source_bytes, strategy, tgz);
    let with_margin = (base as f64 * (1.0 + margin_percent as f64 / 100.0)).ceil() as u64;
    SpaceCheck {
        ok: free_bytes >= with_margin,
        required_bytes: with_margin,
        free_bytes,
        shortfall_bytes: with_margin.saturating_sub(free_bytes),
    }
}

/// Human-readable byte count for log lines.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
