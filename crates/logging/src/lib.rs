//! Logging policy for the fan-out daemon.
//!
//! §6 of the specification: "human-readable lines to stderr at DEBUG and to
//! `log_file_path` at INFO." This crate wires that policy into a single
//! [`init`] call; call sites elsewhere in the workspace use the plain
//! `tracing` macros (`tracing::info!`, `tracing::debug!`, ...) and never
//! touch a sink directly.

use std::path::PathBuf;

pub use logging_sink::FileSink;

/// Where (if anywhere) the INFO-level file sink should write.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Mirrors `Config.log_file_path`; `None` disables the file sink
    /// entirely and only the stderr layer is installed.
    pub log_file_path: Option<PathBuf>,
}

/// Failure to stand up the logging stack.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// The configured log file could not be opened for appending.
    #[error("failed to open log file {path}: {source}")]
    OpenLogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(feature = "tracing")]
mod tracing_init {
    use super::{LogConfig, LoggingError};
    use logging_sink::FileSink;
    use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

    /// Keeps the file sink alive for the process lifetime; dropping it would
    /// silently stop the INFO log.
    pub struct LoggingGuard {
        _file_sink: Option<std::sync::Arc<FileSink>>,
    }

    /// Installs the global `tracing` subscriber described in [`super::LogConfig`].
    ///
    /// Idempotent-ish in practice: `tracing`'s global dispatcher can only be
    /// set once per process, so a second call returns an error from
    /// `tracing_subscriber` rather than panicking, which callers should treat
    /// as non-fatal (the first call already won).
    pub fn init(config: LogConfig) -> Result<LoggingGuard, LoggingError> {
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(EnvFilter::new("debug"));

        let (file_layer, file_sink) = match config.log_file_path {
            Some(path) => {
                let sink = FileSink::open(&path).map_err(|source| LoggingError::OpenLogFile {
                    path: path.display().to_string(),
                    source,
                })?;
                let sink = std::sync::Arc::new(sink);
                let layer = tracing_subscriber::fmt::layer()
                    .with_writer({
                        let sink = std::sync::Arc::clone(&sink);
                        move || sink.as_ref()
                    })
                    .with_ansi(false)
                    .with_target(false)
                    .with_filter(EnvFilter::new("info"));
                (Some(layer), Some(sink))
            }
            None => (None, None),
        };

        let _ = tracing_subscriber::registry()
            .with(stderr_layer)
            .with(file_layer)
            .try_init();

        Ok(LoggingGuard {
            _file_sink: file_sink,
        })
    }
}

#[cfg(feature = "tracing")]
pub use tracing_init::{LoggingGuard, init};
