//! Logging configuration structures and validation logic.
//!
//! Services run under process supervisors and log to stdout; the
//! configuration covers level, output format and console decoration. All
//! structures support serialization via `serde` and include validation rules
//! enforced by the `validator` crate.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Available formats for console log output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogFormat {
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "pretty")]
    Pretty,
    #[serde(rename = "json")]
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Compact
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Top-level logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggerConfig {
    /// Global log level. Valid values: trace, debug, info, warn, error
    /// (case-insensitive). `RUST_LOG` overrides this when set.
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    /// Console output format.
    pub format: LogFormat,

    /// Include the log target (module path) in output.
    pub show_target: bool,

    /// Include thread names in output; useful with one thread per loop.
    pub show_thread_names: bool,

    /// Enable ANSI color codes in console output.
    pub ansi_colors: bool,
}

/// Validates that the provided log level is one of the supported values.
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("invalid_log_level");
            err.message = Some(format!("Invalid log level: {}", level).into());
            Err(err)
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
            format: LogFormat::default(),
            show_target: false,
            show_thread_names: true,
            ansi_colors: true,
        }
    }
}

impl LoggerConfig {
    /// Builds a config from `LOG_LEVEL` / `LOG_FORMAT`, falling back to the
    /// defaults for anything unset. Unknown values are validation errors.
    pub fn from_env() -> Result<Self, super::ConfigError> {
        let mut config = LoggerConfig::default();
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            config.format = format
                .parse()
                .map_err(|reason| super::ConfigError::Invalid {
                    name: "LOG_FORMAT".into(),
                    reason,
                })?;
        }
        config
            .validate()
            .map_err(|e| super::ConfigError::Validation(e.to_string()))?;
        Ok(config)
    }
}
