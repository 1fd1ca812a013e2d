//! backuptool: a configuration-driven wrapper around Percona XtraBackup.
//!
//! Wraps the hot-backup engine with condition gating, free-space checks,
//! subprocess supervision, retention pruning, and Zabbix reporting. The
//! process exit code is 0 for a successful (or skipped) run and a
//! distinct non-zero code per failure class.

mod conditions;
mod config;
mod engine;
mod errors;
mod mysql;
mod pipeline;
mod postprocess;
mod report;
mod space;
mod store;
mod supervisor;

use config::RunConfig;
use pipeline::RunStatus;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::ShutdownSignal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "/etc/backuptool/config.json";

#[derive(Debug, PartialEq, Eq)]
struct CliArgs {
    config_path: PathBuf,
    debug: bool,
    version: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args(env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            eprintln!("Usage: backuptool [-c|--config <path>] [-d|--debug] [-V|--version]");
            return ExitCode::FAILURE;
        }
    };

    if args.version {
        println!("backuptool {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    // Configuration problems surface before the subscriber exists.
    let config = match RunConfig::load_from_json(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let level = if args.debug { "debug" } else { &config.log_level };
    init_tracing(level);
    info!("using configuration file: {}", args.config_path.display());

    // A stop signal must reach the engine subprocess before this process
    // exits, so a stopped orchestrator never orphans a running backup.
    let shutdown = match ShutdownSignal::listen() {
        Ok(shutdown) => shutdown,
        Err(e) => {
            warn!("failed to install stop-signal listeners: {:#}", e);
            ShutdownSignal::disabled()
        }
    };

    let outcome = pipeline::run(&config, &shutdown).await;
    match outcome.status {
        RunStatus::Success => info!(
            "run finished: success in {:.1}s",
            outcome.elapsed.as_secs_f64()
        ),
        RunStatus::SkippedOk => info!("run finished: skipped"),
        RunStatus::Failed => {
            if let Some(failure) = &outcome.failure {
                error!("run finished: {}", failure);
            }
        }
    }
    ExitCode::from(outcome.exit_code())
}

fn parse_args<I>(args: I) -> Result<CliArgs, String>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = CliArgs {
        config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
        debug: false,
        version: false,
    };
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = iter
                    .next()
                    .ok_or_else(|| format!("{} requires a path argument", arg))?;
                parsed.config_path = PathBuf::from(path);
            }
            "-d" | "--debug" => parsed.debug = true,
            "-V" | "--version" => parsed.version = true,
            other => return Err(format!("Unknown argument: {}", other)),
        }
    }
    Ok(parsed)
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
