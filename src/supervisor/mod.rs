// backuptool/src/supervisor/mod.rs
//! Runs the backup engine as a child process, streams its output, and
//! classifies completion from the exit code plus the documented
//! completion marker.

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Terminal line the engine emits only on fully successful completion.
pub const COMPLETION_MARKER: &str = "completed OK!";

/// Upper bound on retained stdout lines when verbose capture is off.
/// The marker is a terminal line, so it always survives the truncation.
const STDOUT_RING_LINES: usize = 500;

/// Seconds to wait for a terminated child before escalating to SIGKILL.
const KILL_GRACE_SECS: u64 = 10;

/// Captured result of one finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// None if the process was killed by a signal or never finished.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Success,
    Failure(String),
    TimedOut,
}

/// Where the child's stdout goes during supervision.
pub enum StdoutSink {
    /// Capture into memory, ring-buffered unless verbose capture is on.
    Capture,
    /// Redirect to a file, used by the streaming backup strategy.
    File(PathBuf),
}

/// Cloneable handle that resolves when the orchestrator is asked to stop.
///
/// A stop request is propagated to the active engine subprocess before the
/// orchestrator exits, so a scheduler stopping this tool never leaves a
/// backup process running detached.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<Option<&'static str>>,
}

impl ShutdownSignal {
    /// Installs process-wide SIGTERM/SIGINT listeners feeding this handle.
    pub fn listen() -> Result<Self> {
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM listener")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT listener")?;
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            let _ = tx.send(Some(name));
        });
        Ok(ShutdownSignal { rx })
    }

    /// A handle that never fires.
    pub fn disabled() -> Self {
        let (_, rx) = watch::channel(None);
        ShutdownSignal { rx }
    }

    #[cfg(test)]
    pub(crate) fn manual() -> (watch::Sender<Option<&'static str>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, ShutdownSignal { rx })
    }

    /// Resolves with the signal name once a stop is requested; pends
    /// forever on a disabled handle.
    async fn fired(&mut self) -> &'static str {
        loop {
            if let Some(name) = *self.rx.borrow_and_update() {
                return name;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

enum WaitEnd {
    Finished(std::process::ExitStatus),
    TimedOut,
    Stopped(&'static str),
}

/// Dual-signal success check over a finished process state.
///
/// Exit code 0 alone is not trusted because historical engine versions
/// returned 0 on partial failure; the marker alone is not trusted because
/// truncated output can carry stale text from a prior phase. Both must
/// agree for a Success classification.
pub fn classify(exit_code: Option<i32>, output: &str) -> Classification {
    let marker_present = output.contains(COMPLETION_MARKER);
    match (exit_code, marker_present) {
        (Some(0), true) => Classification::Success,
        (Some(0), false) => Classification::Failure(
            "exit-code-only: engine exited 0 but the completion marker is missing".to_string(),
        ),
        (Some(code), true) => Classification::Failure(format!(
            "marker-only: completion marker present but engine exited {}",
            code
        )),
        (Some(code), false) => Classification::Failure(format!("engine exited {}", code)),
        (None, _) => Classification::Failure("engine was killed by a signal".to_string()),
    }
}

/// Launches `command` and supervises it to completion.
///
/// Stderr is always retained in full. With `timeout_secs` > 0 the child is
/// terminated once the wall clock expires, escalating to a forceful kill
/// after a grace interval, and the run is classified `TimedOut`. A fired
/// `shutdown` handle terminates the child the same way and classifies the
/// run as a failure naming the stop signal.
pub async fn supervise(
    mut command: Command,
    stdout_sink: StdoutSink,
    timeout_secs: u64,
    verbose_capture: bool,
    mut shutdown: ShutdownSignal,
) -> Result<(CommandResult, Classification)> {
    let start = Instant::now();

    match &stdout_sink {
        StdoutSink::Capture => {
            command.stdout(Stdio::piped());
        }
        StdoutSink::File(path) => {
            let file = std::fs::File::create(path).with_context(|| {
                format!("Failed to create stream output file: {}", path.display())
            })?;
            command.stdout(Stdio::from(file));
        }
    }
    command.stderr(Stdio::piped());
    command.stdin(Stdio::null());
    command.kill_on_drop(true);

    let mut child = command.spawn().context("Failed to spawn backup engine process")?;

    let stderr_pipe = child
        .stderr
        .take()
        .context("Engine child process has no stderr pipe")?;
    let stderr_task = tokio::spawn(read_lines(stderr_pipe, None));

    let stdout_task = match stdout_sink {
        StdoutSink::Capture => {
            let stdout_pipe = child
                .stdout
                .take()
                .context("Engine child process has no stdout pipe")?;
            let limit = if verbose_capture { None } else { Some(STDOUT_RING_LINES) };
            Some(tokio::spawn(read_lines(stdout_pipe, limit)))
        }
        StdoutSink::File(_) => None,
    };

    // The wait future is dropped before the child is terminated, so the
    // exclusive borrow on the child is released for terminate_child.
    let end = {
        let wait = child.wait();
        tokio::pin!(wait);
        tokio::select! {
            status = &mut wait => {
                WaitEnd::Finished(status.context("Failed to wait for engine process")?)
            }
            _ = wall_clock(timeout_secs) => WaitEnd::TimedOut,
            name = shutdown.fired() => WaitEnd::Stopped(name),
        }
    };
    let (status, stopped_by) = match end {
        WaitEnd::Finished(status) => (Some(status), None),
        WaitEnd::TimedOut => {
            error!("engine exceeded {}s wall-clock timeout, terminating", timeout_secs);
            terminate_child(&mut child).await;
            (None, None)
        }
        WaitEnd::Stopped(name) => {
            error!("received {}, terminating engine before exiting", name);
            terminate_child(&mut child).await;
            (None, Some(name))
        }
    };

    let stderr = stderr_task.await.context("Stderr reader task failed")?;
    let stdout = match stdout_task {
        Some(task) => task.await.context("Stdout reader task failed")?,
        None => String::new(),
    };
    let duration = start.elapsed();

    match status {
        None => {
            let result = CommandResult {
                exit_code: None,
                stdout,
                stderr,
                duration,
            };
            let classification = match stopped_by {
                Some(name) => Classification::Failure(format!(
                    "terminated by external stop signal ({})",
                    name
                )),
                None => Classification::TimedOut,
            };
            Ok((result, classification))
        }
        Some(status) => {
            let exit_code = status.code();
            let combined = format!("{}\n{}", stdout, stderr);
            let classification = classify(exit_code, &combined);
            debug!(
                "engine finished in {:.1}s with exit code {:?}",
                duration.as_secs_f64(),
                exit_code
            );
            let result = CommandResult {
                exit_code,
                stdout,
                stderr,
                duration,
            };
            Ok((result, classification))
        }
    }
}

/// Pends forever when no timeout is configured.
async fn wall_clock(timeout_secs: u64) {
    if timeout_secs > 0 {
        tokio::time::sleep(Duration::from_secs(timeout_secs)).await
    } else {
        std::future::pending::<()>().await
    }
}

/// Asks the child to terminate, then kills it if it ignores the request.
async fn terminate_child(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = Command::new("kill").arg(pid.to_string()).status().await;
        if tokio::time::timeout(Duration::from_secs(KILL_GRACE_SECS), child.wait())
            .await
            .is_ok()
        {
            return;
        }
        warn!("engine process {} ignored SIGTERM, sending SIGKILL", pid);
    }
    if let Err(e) = child.kill().await {
        warn!("failed to kill engine process: {}", e);
    }
}

/// Reads lines from a pipe into a string. With a limit, only the newest
/// `limit` lines are kept and a truncation notice is prepended.
async fn read_lines<R>(reader: R, limit: Option<usize>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut ring: VecDeque<String> = VecDeque::new();
    let mut truncated = false;
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(cap) = limit {
            if ring.len() == cap {
                ring.pop_front();
                truncated = true;
            }
        }
        ring.push_back(line);
    }

    let mut out = String::new();
    if truncated {
        out.push_str("[earlier output truncated]\n");
    }
    for line in ring {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn classify_requires_both_signals() {
        assert_eq!(
            classify(Some(0), "xtrabackup: completed OK!"),
            Classification::Success
        );
        match classify(Some(0), "no marker here") {
            Classification::Failure(reason) => assert!(reason.contains("exit-code-only")),
            other => panic!("unexpected classification: {:?}", other),
        }
        match classify(Some(1), "completed OK!") {
            Classification::Failure(reason) => assert!(reason.contains("marker-only")),
            other => panic!("unexpected classification: {:?}", other),
        }
        match classify(Some(1), "error: out of space") {
            Classification::Failure(reason) => assert!(reason.contains("exited 1")),
            other => panic!("unexpected classification: {:?}", other),
        }
        match classify(None, "completed OK!") {
            Classification::Failure(reason) => assert!(reason.contains("signal")),
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[tokio::test]
    async fn read_lines_keeps_only_the_newest_lines() {
        let input: String = (0..10).map(|i| format!("line {}\n", i)).collect();
        let out = read_lines(input.as_bytes(), Some(3)).await;
        assert!(out.starts_with("[earlier output truncated]"));
        assert!(!out.contains("line 0"));
        assert!(out.contains("line 7"));
        assert!(out.contains("line 9"));
    }

    #[tokio::test]
    async fn read_lines_unbounded_keeps_everything() {
        let input: String = (0..10).map(|i| format!("line {}\n", i)).collect();
        let out = read_lines(input.as_bytes(), None).await;
        assert!(out.contains("line 0"));
        assert!(out.contains("line 9"));
        assert!(!out.contains("truncated"));
    }

    #[tokio::test]
    async fn successful_run_is_classified_success() -> Result<()> {
        let (result, classification) = supervise(
            shell("echo doing work; echo 'completed OK!'"),
            StdoutSink::Capture,
            0,
            false,
            ShutdownSignal::disabled(),
        )
        .await?;
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(classification, Classification::Success);
        assert!(result.stdout.contains("doing work"));
        Ok(())
    }

    #[tokio::test]
    async fn clean_exit_without_marker_is_a_failure() -> Result<()> {
        let (result, classification) = supervise(
            shell("echo all done"),
            StdoutSink::Capture,
            0,
            false,
            ShutdownSignal::disabled(),
        )
        .await?;
        assert_eq!(result.exit_code, Some(0));
        match classification {
            Classification::Failure(reason) => assert!(reason.contains("exit-code-only")),
            other => panic!("unexpected classification: {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn stderr_is_retained_on_failure() -> Result<()> {
        let (result, classification) = supervise(
            shell("echo 'disk full' 1>&2; exit 3"),
            StdoutSink::Capture,
            0,
            false,
            ShutdownSignal::disabled(),
        )
        .await?;
        assert_eq!(result.exit_code, Some(3));
        assert!(result.stderr.contains("disk full"));
        assert!(matches!(classification, Classification::Failure(_)));
        Ok(())
    }

    #[tokio::test]
    async fn timeout_classifies_as_timed_out() -> Result<()> {
        let (result, classification) =
            supervise(shell("sleep 30"), StdoutSink::Capture, 1, false, ShutdownSignal::disabled())
                .await?;
        assert_eq!(classification, Classification::TimedOut);
        assert_eq!(result.exit_code, None);
        assert!(result.duration >= Duration::from_secs(1));
        Ok(())
    }

    #[tokio::test]
    async fn file_sink_redirects_stdout_and_classifies_from_stderr() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let out_path = dir.path().join("backup.xbstream");
        let (result, classification) = supervise(
            shell("echo stream-bytes; echo 'completed OK!' 1>&2"),
            StdoutSink::File(out_path.clone()),
            0,
            false,
            ShutdownSignal::disabled(),
        )
        .await?;
        assert_eq!(classification, Classification::Success);
        assert!(result.stdout.is_empty());
        let contents = std::fs::read_to_string(&out_path)?;
        assert!(contents.contains("stream-bytes"));
        Ok(())
    }

    #[tokio::test]
    async fn stop_signal_terminates_the_child_process() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let pid_file = dir.path().join("pid");
        let (tx, shutdown) = ShutdownSignal::manual();
        let task = tokio::spawn(supervise(
            shell(&format!("echo $$ > '{}'; exec sleep 30", pid_file.display())),
            StdoutSink::Capture,
            0,
            false,
            shutdown,
        ));

        while !pid_file.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(Some("SIGTERM")).unwrap();

        let (result, classification) = task.await??;
        assert_eq!(result.exit_code, None);
        match classification {
            Classification::Failure(reason) => assert!(reason.contains("SIGTERM")),
            other => panic!("unexpected classification: {:?}", other),
        }
        assert!(result.duration < Duration::from_secs(30));

        // The child must be gone, not running detached.
        let pid: u32 = std::fs::read_to_string(&pid_file)?.trim().parse()?;
        assert!(!std::path::Path::new(&format!("/proc/{}", pid)).exists());
        Ok(())
    }

    #[tokio::test]
    async fn already_fired_shutdown_aborts_immediately() -> Result<()> {
        let (tx, shutdown) = ShutdownSignal::manual();
        tx.send(Some("SIGINT")).unwrap();
        let (result, classification) =
            supervise(shell("sleep 30"), StdoutSink::Capture, 0, false, shutdown).await?;
        assert_eq!(result.exit_code, None);
        assert!(matches!(classification, Classification::Failure(_)));
        assert!(result.duration < Duration::from_secs(30));
        Ok(())
    }
}
