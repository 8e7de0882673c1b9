//! Subscriber setup for applications embedding the client.

use crate::config::LoggingConfig;
use crate::error::{FreeseekError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` wins over `log_level` when set. When `log_file` is set, a
/// second layer writes to that file without ANSI colours; keep the returned
/// guard alive or buffered lines are lost on exit.
///
/// Fails with [`FreeseekError::InvalidConfig`] if a global subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("freeseek={}", config.log_level)).map_err(|e| {
            FreeseekError::InvalidConfig(format!("invalid log level '{}': {e}", config.log_level))
        })?,
    };

    let console = if config.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .boxed()
    };

    let (file, guard) = match &config.log_file {
        Some(path) => {
            let name = path.file_name().ok_or_else(|| {
                FreeseekError::InvalidConfig(format!("log_file has no file name: {}", path.display()))
            })?;
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            std::fs::create_dir_all(dir).map_err(|source| FreeseekError::ConfigFileRead {
                path: dir.to_path_buf(),
                source,
            })?;

            let (writer, guard) = tracing_appender::non_blocking(
                tracing_appender::rolling::never(dir, name),
            );
            let layer = if config.json {
                fmt::layer().json().with_writer(writer).boxed()
            } else {
                fmt::layer().with_ansi(false).with_writer(writer).boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| FreeseekError::InvalidConfig(format!("logging already initialized: {e}")))?;

    Ok(guard)
}
