//! Structured logging setup.
//!
//! The donor declares the full `tracing`/`tracing-subscriber`/
//! `tracing-appender` stack but never wires it up; every subsystem here logs
//! through `tracing::{info,warn,error}` with a `target:` per module
//! (`"executor"`, `"engine"`, `"worktree"`, `"hooks"`, `"store"`), so this
//! module builds the subscriber those calls assume: an `EnvFilter`-gated
//! layer to stderr for interactive runs, plus a non-blocking rolling file
//! appender under the configured log directory for session replay.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Installs the global subscriber. The returned `WorkerGuard` must be held
/// for the lifetime of the process; dropping it flushes and stops the
/// non-blocking file writer.
pub fn init(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir).context("failed to create log directory")?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "forge.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_env("FORGE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter);

    let file_filter = EnvFilter::try_from_env("FORGE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(file_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}
