use std::fs::{File, OpenOptions};
use std::sync::Arc;

use camino::Utf8Path;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::MigrateError;

pub const DEFAULT_FILTER: &str = "info";

/// Flushes the log file when the run ends.
#[must_use = "dropping the guard flushes the log file"]
pub struct LogGuard {
    file: Option<Arc<File>>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = file.sync_all() {
                eprintln!("failed to flush log file: {err}");
            }
        }
    }
}

pub fn env_filter(level: Option<&str>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    }
}

/// Installs the global subscriber: timestamped lines on stderr, optionally
/// mirrored (without ANSI colors) into `log_file`.
pub fn init(level: Option<&str>, log_file: Option<&Utf8Path>) -> Result<LogGuard, MigrateError> {
    let file = match log_file {
        Some(path) => Some(Arc::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path.as_std_path())
                .map_err(|err| MigrateError::InvalidSetting(format!("log file {path}: {err}")))?,
        )),
        None => None,
    };

    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let file_layer = file.as_ref().map(|file| {
        fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(Arc::clone(file))
    });

    let installed = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    if installed.is_err() {
        warn!("logging already initialised; keeping the existing subscriber");
    }

    Ok(LogGuard { file })
}
