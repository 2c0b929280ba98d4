//! Logging initialization
//!
//! Installs the global `tracing` subscriber from the `logging` section of the
//! pipeline file:
//!
//! - an `EnvFilter` at the configured level (`RUST_LOG` directives still apply)
//! - timestamped, leveled lines on stdout when `console` is set
//! - the same lines, without ANSI colors, appended to `file` through a
//!   non-blocking writer
//!
//! Use the `tracing` macros with structured fields:
//!
//! ```rust,ignore
//! info!(chain = %chain_id, table = %job.table, "Starting table");
//! error!(error = %e, path = %path.display(), "Failed to compress chunk");
//! ```

use crate::config::LoggingSettings;
use crate::error::{Error, Result};
use crate::types::LogLevel;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber
///
/// The returned guard flushes the log file when dropped and must be held
/// until the process exits. `None` when no log file is configured.
pub fn init(settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    let (file_writer, guard) = match &settings.file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = settings
        .console
        .then(|| fmt::layer().with_writer(std::io::stdout));
    let file_layer = file_writer.map(|writer| fmt::layer().with_writer(writer).with_ansi(false));

    tracing_subscriber::registry()
        .with(filter(settings.level))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to install log subscriber: {e}")))?;

    Ok(guard)
}

/// Level filter, extended by `RUST_LOG`
fn filter(level: LogLevel) -> EnvFilter {
    EnvFilter::from_default_env().add_directive(tracing::Level::from(level).into())
}

/// Non-blocking appender for `path`, creating its directory
fn file_writer(path: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path.file_name().ok_or_else(|| {
        Error::invalid_value("logging.file", format!("'{}' is not a file", path.display()))
    })?;

    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::never(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}
