//! Logging setup
//!
//! Installs the global `tracing` subscriber: an `EnvFilter` (default `info`,
//! overridable with `RUST_LOG`), a stderr layer and, when a session log file
//! is configured, a plain-text layer appending to it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ConnectionProfile;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Cannot open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot create log appender for {path}: {source}")]
    Appender {
        path: PathBuf,
        #[source]
        source: InitError,
    },

    #[error("A global logger is already installed")]
    AlreadyInitialized,
}

/// Keeps the background log file writer alive.
///
/// Buffered lines are flushed when it is dropped.
#[must_use = "dropping the guard stops writing to the log file"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// Can only succeed once per process.
pub fn init_logging(log_file: Option<&Path>) -> Result<LogGuard, LoggingError> {
    let (file_layer, guard) = match log_file {
        Some(path) => {
            let (writer, guard) = build_file_writer(path)?;
            (
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                ),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    tracing::debug!(
        "Logging initialized{}",
        log_file
            .map(|p| format!(" (file: {})", p.display()))
            .unwrap_or_default()
    );
    Ok(LogGuard { _file: guard })
}

/// Install the global subscriber, appending to the profile's `logFilePath`
/// when it has one.
pub fn init_profile_logging(profile: &ConnectionProfile) -> Result<LogGuard, LoggingError> {
    init_logging(profile.log_file_path.as_deref())
}

/// Non-blocking writer appending to `path`, flushed by a background thread
fn build_file_writer(path: &Path) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    let to_error = |source| LoggingError::LogFile {
        path: path.to_path_buf(),
        source,
    };

    let file_name = path
        .file_name()
        .ok_or_else(|| to_error(io::Error::new(io::ErrorKind::InvalidInput, "no file name")))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(to_error)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name.to_string_lossy())
        .build(dir)
        .map_err(|source| LoggingError::Appender {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(tracing_appender::non_blocking(appender))
}
