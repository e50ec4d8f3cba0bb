//! CLI entry point for the stream checker
//!
//! Parses command line arguments, installs logging and starts the daemon.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use stream_checker::{Config, Daemon};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Stream checker - probes channel streams and keeps them ordered by quality
#[derive(Parser, Debug)]
#[command(name = "stream-checker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (ffprobe, schedule, state dir). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Also write daily-rotated log files into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

/// Install the console layer and, when requested, a daily file layer.
///
/// The returned guard must stay alive for buffered file output to flush.
fn init_logging(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "stream-checker.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _guard = init_logging(args.verbose, args.log_dir.as_deref());

    info!(config = %args.config.display(), "Stream checker starting");

    let daemon_result = if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
        match Config::load(&args.config) {
            Ok(config) => Daemon::new_without_checks(config).await,
            Err(e) => Err(e.into()),
        }
    } else {
        Daemon::new(&args.config).await
    };

    match daemon_result {
        Ok(daemon) => {
            info!(
                global_ceiling = daemon.concurrency_plan.global_ceiling,
                max_active_channels = daemon.concurrency_plan.max_active_channels,
                bind = %daemon.config.server.bind,
                "Starting control server"
            );

            if let Err(e) = daemon.run_with_server().await {
                error!(error = %e, "Daemon error");
                return ExitCode::FAILURE;
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize daemon");
            ExitCode::FAILURE
        }
    }
}
