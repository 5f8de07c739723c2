//! Logging initialization and configuration.
//!
//! This module provides environment-aware logging setup:
//! - **Production**: JSON logs to rolling files + compact logs to stdout
//! - **Development**: Pretty logs to stdout with span events

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the fallback filter when `RUST_LOG` is unset.
pub const LOG_LEVEL_VAR: &str = "GEOLOCATOR_LOG_LEVEL";

/// Environment variable selecting the logging mode.
pub const ENV_VAR: &str = "GEOLOCATOR_ENV";

/// Prefix of the rolling replay log files.
const LOG_FILE_PREFIX: &str = "geolocator-replay";

/// Daily files kept before the oldest is removed.
const MAX_LOG_FILES: usize = 14;

/// Keep the non-blocking writers flushing until the process exits.
static GUARDS: OnceLock<[WorkerGuard; 2]> = OnceLock::new();

/// Whether `GEOLOCATOR_ENV` selects production logging.
#[must_use]
pub fn is_production() -> bool {
    std::env::var(ENV_VAR).is_ok_and(|v| v.eq_ignore_ascii_case("production"))
}

/// Initialize the logging system.
///
/// Production mode writes JSON to daily files under the platform data
/// directory and compact lines without ANSI colors to stdout. Development
/// mode writes pretty stdout logs with span open/close events.
///
/// # Errors
///
/// Returns an error if the env filter cannot be parsed, or in production if
/// the log directory cannot be created or written.
pub fn init(is_production: bool) -> anyhow::Result<()> {
    let fallback = std::env::var(LOG_LEVEL_VAR).unwrap_or_else(|_| "info".to_string());
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&fallback))?;

    if is_production {
        init_production(env_filter, &log_directory())
    } else {
        init_development(env_filter);
        Ok(())
    }
}

fn init_production(env_filter: EnvFilter, log_dir: &Path) -> anyhow::Result<()> {
    let (file_writer, file_guard) = tracing_appender::non_blocking(rolling_appender(log_dir)?);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(stdout_writer)
                .with_ansi(false),
        )
        .init();

    let _ = GUARDS.set([file_guard, stdout_guard]);
    Ok(())
}

fn init_development(env_filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE),
        )
        .init();
}

/// Daily rolling appender in `log_dir`, created if missing.
fn rolling_appender(log_dir: &Path) -> anyhow::Result<RollingFileAppender> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(log_dir)
        .with_context(|| format!("Failed to open log files in {}", log_dir.display()))
}

/// Returns the log directory for the current platform.
fn log_directory() -> PathBuf {
    directories::ProjectDirs::from("", "", "geolocator")
        .map_or_else(|| PathBuf::from("./logs"), |dirs| dirs.data_local_dir().join("logs"))
}
