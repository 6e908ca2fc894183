//! Scheduler configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{MAX_PRIORITY, MAX_RETRIES_LIMIT, MIN_PRIORITY};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the dispatcher looks for work when nothing wakes it.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on concurrently Running tasks.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Terminal tasks older than this are deleted by the sweeper.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Per-task execution timeout. 0 disables it.
    #[serde(default)]
    pub execution_timeout_secs: u64,

    #[serde(default = "default_priority")]
    pub default_priority: u8,

    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry. 0 requeues immediately.
    #[serde(default)]
    pub base_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include file/line info
    #[serde(default)]
    pub file_line: bool,
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_sweep_interval_secs() -> u64 {
    3_600
}

fn default_retention_days() -> u32 {
    7
}

fn default_priority() -> u8 {
    crate::domain::DEFAULT_PRIORITY
}

fn default_max_retries() -> u32 {
    crate::domain::DEFAULT_MAX_RETRIES
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            sweep_interval_secs: default_sweep_interval_secs(),
            retention_days: default_retention_days(),
            execution_timeout_secs: 0,
            default_priority: default_priority(),
            default_max_retries: default_max_retries(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 0,
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            file_line: false,
        }
    }
}

impl SchedulerConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than 0".into(),
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_tasks must be greater than 0".into(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_secs must be greater than 0".into(),
            ));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.default_priority) {
            return Err(ConfigError::Invalid(format!(
                "default_priority must be within {MIN_PRIORITY}..={MAX_PRIORITY}"
            )));
        }
        if self.default_max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "default_max_retries must be at most {MAX_RETRIES_LIMIT}"
            )));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be a finite number >= 1.0".into(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.max_delay_ms must not be below retry.base_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        (self.execution_timeout_secs > 0).then(|| Duration::from_secs(self.execution_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = SchedulerConfig::from_toml_str("").unwrap();
        assert_eq!(config, SchedulerConfig::default());
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.max_concurrent_tasks, 5);
        assert_eq!(config.retention(), chrono::Duration::days(7));
        assert_eq!(config.execution_timeout(), None);
        assert_eq!(config.retry.base_delay_ms, 0);
    }

    #[test]
    fn parses_nested_sections() {
        let config = SchedulerConfig::from_toml_str(
            r#"
            poll_interval_ms = 250
            max_concurrent_tasks = 2
            execution_timeout_secs = 30

            [retry]
            base_delay_ms = 1000
            multiplier = 3.0

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.execution_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.retry.max_delay_ms, 300_000);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.logging.timestamps);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = SchedulerConfig::from_toml_str("max_concurrent_tasks = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_out_of_range_default_priority() {
        let err = SchedulerConfig::from_toml_str("default_priority = 11").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_shrinking_multiplier() {
        let err = SchedulerConfig::from_toml_str("[retry]\nmultiplier = 0.5").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn reports_parse_errors() {
        let err = SchedulerConfig::from_toml_str("max_concurrent_tasks = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = SchedulerConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
