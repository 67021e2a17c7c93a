//! Structured logging setup using `tracing-subscriber` and `tracing-appender`.
//!
//! Two modes:
//! - **Node** ([`init_node`]): rotated JSON activity log, an append-only
//!   alert log, and a console layer
//! - **CLI** ([`init_cli`]): console-only for one-shot subcommands
//!
//! The alert log keeps every warning and error (anomalies, the kill switch,
//! failed heartbeats) in one unrotated file. `RUST_LOG` does not filter it.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// File name prefix of the daily activity log.
pub const ACTIVITY_LOG_PREFIX: &str = "nebula.log";

/// File name of the alert log.
pub const ALERT_LOG_FILE: &str = "nebula-alerts.log";

/// Holds the non-blocking writer guards for file logging.
///
/// Must be kept alive until the node stops. Dropping it flushes pending
/// entries in both files.
pub struct LoggingGuard {
    _activity: WorkerGuard,
    _alerts: WorkerGuard,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialise logging for the `start` subcommand.
///
/// Writes JSON to `{logs_dir}/nebula.log.YYYY-MM-DD` (daily rotation) and
/// warnings and errors to `{logs_dir}/nebula-alerts.log`. Human-readable
/// output goes to stderr. Both the activity log and stderr follow `RUST_LOG`
/// (default: `info`).
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or a global
/// subscriber is already installed.
pub fn init_node(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;

    let (activity_writer, activity_guard) = tracing_appender::non_blocking(
        tracing_appender::rolling::daily(logs_dir, ACTIVITY_LOG_PREFIX),
    );
    let (alert_writer, alert_guard) = tracing_appender::non_blocking(
        tracing_appender::rolling::never(logs_dir, ALERT_LOG_FILE),
    );

    let activity_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_writer(activity_writer)
        .with_filter(env_filter());

    let alert_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_writer(alert_writer)
        .with_filter(LevelFilter::WARN);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter());

    tracing_subscriber::registry()
        .with(activity_layer)
        .with(alert_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))?;

    Ok(LoggingGuard {
        _activity: activity_guard,
        _alerts: alert_guard,
    })
}

/// Initialise minimal logging for the `check` subcommand.
///
/// Emits human-readable output to stderr only. Controlled by `RUST_LOG`
/// (default: `info`).
pub fn init_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
