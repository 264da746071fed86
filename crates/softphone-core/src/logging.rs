//! Tracing subscriber setup for binaries and tests
//!
//! The library only emits `tracing` events. Hosts call [`init_logging`] once,
//! or install their own subscriber. `RUST_LOG` directives are honored on top of
//! the configured level.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{PhoneError, PhoneResult};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    /// Emit one JSON object per line
    pub json: bool,
    /// Include file and line of the call site
    pub file_info: bool,
    /// Log span enter and exit
    pub log_spans: bool,
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json: false,
            file_info: false,
            log_spans: false,
            app_name: "softphone".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        Self {
            level,
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }
}

/// Install the global subscriber
///
/// Fails if a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> PhoneResult<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());
    let span_events = if config.log_spans { FmtSpan::ACTIVE } else { FmtSpan::NONE };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let result = if config.json {
        builder.with_writer(std::io::stdout).json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| PhoneError::internal_error(format!("failed to install subscriber: {}", e)))?;

    tracing::info!(app = %config.app_name, version = env!("CARGO_PKG_VERSION"), "Logging initialized");
    Ok(())
}

/// Parse a level name such as `debug` or `WARN`
pub fn parse_log_level(level: &str) -> PhoneResult<Level> {
    Level::from_str(level).map_err(|_| PhoneError::invalid_configuration("log_level", format!("invalid log level: {}", level)))
}
