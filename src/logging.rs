//! Logging setup
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` (`RUST_LOG`
//! first, then the configured filter), a console layer and, when a
//! directory is configured, a non-blocking daily-rolling file layer.

use crate::config::LogSettings;
use crate::error::{FlowError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log files are named `<prefix>.<date>`
pub const LOG_FILE_PREFIX: &str = "thingflow.log";

/// Install the global subscriber.
///
/// Returns the file appender's guard when file logging is enabled; keep it
/// alive for as long as logs should be flushed. Fails if a global
/// subscriber is already installed.
pub fn init_logging(settings: &LogSettings) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.filter))
        .map_err(|e| {
            FlowError::Config(format!("Invalid log filter '{}': {}", settings.filter, e))
        })?;

    let console = fmt::layer().with_thread_names(settings.thread_names);

    let (file, guard) = match &settings.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(settings.thread_names);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| FlowError::Config(format!("Failed to install log subscriber: {}", e)))?;

    tracing::debug!("Logging initialised with filter '{}'", settings.filter);
    Ok(guard)
}
