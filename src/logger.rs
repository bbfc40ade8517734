//! Centralized logging initialization.
//!
//! The `LoggerManager` validates logging configuration and initializes the
//! global `tracing` subscriber with a console layer. It supports multiple log
//! formats, ANSI coloring, thread names, and environment-based filtering via
//! `RUST_LOG`.

use std::io;

use thiserror::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};
use validator::{Validate, ValidationErrors};

use crate::config::logger::{LogFormat, LoggerConfig};

/// Errors that can occur during logger configuration or initialization.
#[derive(Error, Debug)]
pub enum LoggerError {
    /// General initialization failure with a descriptive message.
    #[error("Logger initialization error: {0}")]
    InitializationError(String),

    /// Validation errors from the logger configuration struct.
    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    /// Failure to parse an environment-based filter directive.
    #[error("Environment filter error: {0}")]
    EnvFilterError(#[from] tracing_subscriber::filter::FromEnvError),
}

/// Manages logging configuration and global subscriber initialization.
pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// Creates a new `LoggerManager` and validates the provided configuration.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;

        Ok(LoggerManager { config })
    }

    /// Initializes the global `tracing` subscriber.
    ///
    /// Must be called once at process startup before any tracing macros are
    /// used. `RUST_LOG` takes precedence over the configured level.
    pub fn init(&mut self) -> Result<(), LoggerError> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.level));

        let layer = self.console_layer(filter);
        tracing_subscriber::registry().with(layer).init();
        Ok(())
    }

    /// Constructs the console output layer according to the configuration.
    fn console_layer(
        &self,
        filter: EnvFilter,
    ) -> Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync> {
        let writer = io::stdout;
        match self.config.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_target(self.config.show_target)
                .with_thread_names(self.config.show_thread_names)
                .with_ansi(self.config.ansi_colors)
                .with_writer(writer)
                .with_filter(filter)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_target(self.config.show_target)
                .with_thread_names(self.config.show_thread_names)
                .with_ansi(self.config.ansi_colors)
                .with_writer(writer)
                .with_filter(filter)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_target(self.config.show_target)
                .with_thread_names(self.config.show_thread_names)
                .with_ansi(self.config.ansi_colors)
                .with_writer(writer)
                .with_filter(filter)
                .boxed(),
        }
    }
}
