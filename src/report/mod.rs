// backuptool/src/report/mod.rs
//! Sends the finalized run outcome to Zabbix via `zabbix_sender`.

use tokio::process::Command;
use tracing::{info, warn};

use crate::config::ZabbixConfig;
use crate::pipeline::{PipelineOutcome, RunStatus};

/// Maximum value size zabbix_sender can ship to the server.
/// https://www.zabbix.com/documentation/current/en/manual/config/items/item#text-data-limits
const MAX_ITEM_BYTES: usize = 65536;

const TRUNCATION_NOTICE: &str =
    "** Report truncated: it exceeds the Zabbix item size limit. **\n";

/// Reports the outcome to the monitoring endpoint. An empty item key
/// disables reporting. Failures are logged, never retried in-run, and
/// never change the already-finalized outcome.
pub async fn report(zbx: &ZabbixConfig, outcome: &PipelineOutcome) -> bool {
    if zbx.item_key.is_empty() {
        return true;
    }

    let value = truncate_value(&summary_value(outcome));
    let output = Command::new(&zbx.sender_bin)
        .arg("-c")
        .arg(&zbx.agent_conf)
        .arg("-k")
        .arg(&zbx.item_key)
        .arg("-o")
        .arg(&value)
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            info!("{}: sent successfully, item_key: {}", zbx.sender_bin, zbx.item_key);
            true
        }
        Ok(output) => {
            warn!(
                "{} failed with status {}: {}",
                zbx.sender_bin,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            false
        }
        Err(e) => {
            warn!("failed to execute {}: {}", zbx.sender_bin, e);
            false
        }
    }
}

/// One summary line plus numeric metric lines for the monitoring side.
fn summary_value(outcome: &PipelineOutcome) -> String {
    let summary = match &outcome.status {
        RunStatus::Success => "Summary: Backup completed successfully. Error=0".to_string(),
        RunStatus::SkippedOk => {
            "Summary: Backup skipped due to skip conditions. Error=0".to_string()
        }
        RunStatus::Failed => match &outcome.failure {
            Some(failure) => format!("Summary: Backup failed ({}). Error=1", failure),
            None => "Summary: Backup failed. Error=1".to_string(),
        },
    };

    let mut value = summary;
    value.push_str(&format!("\nelapsed_secs={}", outcome.elapsed.as_secs()));
    if let Some(artifact) = &outcome.artifact {
        value.push_str(&format!("\nartifact_bytes={}", artifact.size_bytes));
    }
    if !outcome.warnings.is_empty() {
        value.push_str(&format!("\nwarnings={}", outcome.warnings.len()));
        for warning in &outcome.warnings {
            value.push_str(&format!("\nwarning: {}", warning));
        }
    }
    value
}

/// Cuts the value at a line boundary so it fits the Zabbix item limit,
/// appending a notice when anything was dropped.
fn truncate_value(value: &str) -> String {
    if value.len() <= MAX_ITEM_BYTES {
        return value.to_string();
    }
    let budget = MAX_ITEM_BYTES - TRUNCATION_NOTICE.len();
    let mut truncated = String::new();
    for line in value.lines() {
        if truncated.len() + line.len() + 1 > budget {
            break;
        }
        truncated.push_str(line);
        truncated.push('\n');
    }
    truncated.push_str(TRUNCATION_NOTICE);
    truncated
}
