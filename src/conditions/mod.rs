// backuptool/src/conditions/mod.rs
//! Executes the configured skip/run/terminate condition commands around
//! the backup, with per-phase abort semantics.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::supervisor::CommandResult;

/// Environment variable carrying the current run directory, exported to
/// terminate-phase commands (e.g. for offsite copy scripts).
pub const CURRENT_DIR_ENV: &str = "BACKUPTOOL_CURRENT_DIR";

/// The three gating phases around a backup. A single runner handles all
/// of them; only the abort policy differs per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionPhase {
    /// Any command exiting 0 means "skip the backup"; not an error.
    Skip,
    /// Every command must exit 0; the first failure aborts the pipeline.
    Run,
    /// Finalize actions after the backup; a failure flags the run Failed
    /// even though the artifact itself succeeded.
    Terminate,
}

impl ConditionPhase {
    fn label(&self) -> &'static str {
        match self {
            ConditionPhase::Skip => "skip",
            ConditionPhase::Run => "run",
            ConditionPhase::Terminate => "terminate",
        }
    }
}

#[derive(Debug)]
pub struct PhaseResult {
    /// Skip phase only: a command exited 0.
    pub matched: bool,
    /// Run/Terminate phases: a command exited non-zero.
    pub failed: bool,
    pub results: Vec<CommandResult>,
    /// Human-readable description of the failing command, for the outcome.
    pub failure_reason: Option<String>,
}

/// Runs a condition phase command list in order, synchronously,
/// short-circuiting per the phase policy. Commands never retry.
pub async fn run_phase(
    phase: ConditionPhase,
    commands: &[String],
    timeout_secs: u64,
    current_dir: Option<&Path>,
) -> PhaseResult {
    let mut outcome = PhaseResult {
        matched: false,
        failed: false,
        results: Vec::new(),
        failure_reason: None,
    };

    if commands.is_empty() {
        return outcome;
    }
    info!("checking {} conditions ({} commands)", phase.label(), commands.len());

    for command in commands {
        let result = execute_condition(command, timeout_secs, current_dir).await;
        let succeeded = result.exit_code == Some(0);

        match phase {
            ConditionPhase::Skip => {
                if succeeded {
                    info!("skip condition met: '{}' (exit code: 0)", command);
                    if !result.stdout.trim().is_empty() {
                        debug!("skip condition stdout: '{}'", result.stdout.trim());
                    }
                    outcome.matched = true;
                    outcome.results.push(result);
                    break;
                }
                debug!(
                    "skip condition not met: '{}' (exit code: {:?})",
                    command, result.exit_code
                );
                outcome.results.push(result);
            }
            ConditionPhase::Run | ConditionPhase::Terminate => {
                if !succeeded {
                    error!(
                        "{} condition failed: '{}' (exit code: {:?})",
                        phase.label(),
                        command,
                        result.exit_code
                    );
                    if !result.stderr.trim().is_empty() {
                        error!("{} condition stderr: {}", phase.label(), result.stderr.trim());
                    }
                    outcome.failed = true;
                    outcome.failure_reason = Some(describe_failure(command, &result));
                    outcome.results.push(result);
                    break;
                }
                debug!("{} condition passed: '{}'", phase.label(), command);
                if !result.stdout.trim().is_empty() {
                    debug!("{} condition stdout: {}", phase.label(), result.stdout.trim());
                }
                outcome.results.push(result);
            }
        }
    }

    match phase {
        ConditionPhase::Skip if !outcome.matched => {
            info!("no skip conditions met, proceeding with backup");
        }
        ConditionPhase::Run if !outcome.failed => info!("all run conditions met"),
        ConditionPhase::Terminate if !outcome.failed => {
            info!("all terminate conditions succeeded");
        }
        _ => {}
    }

    outcome
}

fn describe_failure(command: &str, result: &CommandResult) -> String {
    let exit = match result.exit_code {
        Some(code) => code.to_string(),
        None => "killed/timed out".to_string(),
    };
    let stderr = result.stderr.trim();
    if stderr.is_empty() {
        format!("'{}' (exit code: {})", command, exit)
    } else {
        format!("'{}' (exit code: {}): {}", command, exit, stderr)
    }
}

/// Runs one condition command through `/bin/sh -c` with an optional
/// timeout (0 = unbounded). Timeouts and spawn errors surface as a
/// failed result rather than an error; no phase ever retries.
async fn execute_condition(
    command: &str,
    timeout_secs: u64,
    current_dir: Option<&Path>,
) -> CommandResult {
    let start = Instant::now();
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = current_dir {
        cmd.env(CURRENT_DIR_ENV, dir);
    }

    let output = if timeout_secs > 0 {
        match tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output()).await {
            Ok(output) => output,
            Err(_) => {
                error!("command timed out after {} seconds: '{}'", timeout_secs, command);
                return CommandResult {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("command timed out after {} seconds", timeout_secs),
                    duration: start.elapsed(),
                };
            }
        }
    } else {
        cmd.output().await
    };

    match output {
        Ok(output) => CommandResult {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: start.elapsed(),
        },
        Err(e) => {
            error!("failed to execute command '{}': {}", command, e);
            CommandResult {
                exit_code: None,
                stdout: String::new(),
                stderr: e.to_string(),
                duration: start.elapsed(),
            }
        }
    }
}
