use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str =
    "info,launch_app=debug,launch_deploy=debug,launch_funding=debug,launch_verify=debug";

/// File prefix of the daily log files (`launch.YYYY-MM-DD`).
const LOG_FILE_PREFIX: &str = "launch";

/// Initializes file + console logging for the `launch` binary.
///
/// The file layer rotates daily under `logs_dir`; the console layer is compact.
/// Returns a guard that must be kept alive until the process exits.
pub fn init_logging(logs_dir: &Path) -> Result<WorkerGuard> {
    install(logs_dir, DEFAULT_FILTER, true)
}

/// File-only logging with a caller-supplied filter, for tests and embedding.
pub fn init_logging_to_dir(logs_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    install(logs_dir, filter, false)
}

fn install(logs_dir: &Path, fallback_filter: &str, console: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX));
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback_filter));

    let file_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(writer);
    let console_layer = console.then(|| fmt::layer().with_target(false).compact());

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}
