//! Tracing subscriber setup.

use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, time::SystemTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::app::config::{LogFormat, LoggingConfig};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter '{0}'")]
    Filter(String),

    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Build the filter: `RUST_LOG` wins, else the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, TelemetryError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|_| TelemetryError::Filter(config.level.clone())),
    }
}

/// Install the global subscriber described by `config`.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = env_filter(config)?;

    let layer = match config.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_target(true)
                .with_file(config.file_line)
                .with_line_number(config.file_line)
                .with_current_span(true);
            if config.timestamps {
                layer.with_timer(SystemTime).boxed()
            } else {
                layer.without_time().boxed()
            }
        }
        LogFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_target(true)
                .with_file(config.file_line)
                .with_line_number(config.file_line);
            if config.timestamps {
                layer.with_timer(SystemTime).boxed()
            } else {
                layer.without_time().boxed()
            }
        }
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .with_target(true)
                .with_file(config.file_line)
                .with_line_number(config.file_line);
            if config.timestamps {
                layer.with_timer(SystemTime).boxed()
            } else {
                layer.without_time().boxed()
            }
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|_| TelemetryError::AlreadyInitialized)?;

    tracing::info!(
        level = %config.level,
        format = ?config.format,
        "logging initialized"
    );
    Ok(())
}
