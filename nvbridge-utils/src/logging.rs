//! Logging infrastructure for nvbridge
//!
//! Provides unified logging setup using the tracing ecosystem.

use std::fs::{File, OpenOptions};
use std::sync::Mutex;

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::{paths, BridgeError, Result};

/// Environment variable overriding the log filter
pub const LOG_ENV: &str = "NVBRIDGE_LOG";

const DEFAULT_LOG_FILE: &str = "nvbridge.log";

/// Log output destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stderr,
    /// The log directory; required when the host owns the terminal
    File,
    Both,
}

impl LogOutput {
    fn to_stderr(self) -> bool {
        matches!(self, Self::Stderr | Self::Both)
    }

    fn to_file(self) -> bool {
        matches!(self, Self::File | Self::Both)
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Output destination
    pub output: LogOutput,
    /// Log level filter (e.g., "info", "debug", "nvbridge_client=debug,tokio=warn")
    pub filter: String,
    /// Include span events (enter/exit)
    pub span_events: bool,
    /// Include file/line in logs
    pub file_line: bool,
    /// Optional custom log file name (defaults to "nvbridge.log")
    pub file_name: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            output: LogOutput::Stderr,
            filter: "info".into(),
            span_events: false,
            file_line: false,
            file_name: None,
        }
    }
}

impl LogConfig {
    /// Config for a host application embedding the client (its UI owns the
    /// terminal, so logs go to a file)
    pub fn client() -> Self {
        Self {
            output: LogOutput::File,
            filter: env_filter_or("warn"),
            span_events: false,
            file_line: false,
            file_name: Some("client.log".into()),
        }
    }

    /// Config for the server daemon
    pub fn server() -> Self {
        Self {
            output: LogOutput::File,
            filter: env_filter_or("info"),
            span_events: true,
            file_line: true,
            file_name: None,
        }
    }

    /// Config for development (verbose stderr)
    pub fn development() -> Self {
        Self {
            output: LogOutput::Stderr,
            filter: "debug".into(),
            span_events: true,
            file_line: true,
            file_name: None,
        }
    }
}

fn env_filter_or(default: &str) -> String {
    std::env::var(LOG_ENV).unwrap_or_else(|_| default.into())
}

/// Initialize logging with default configuration
pub fn init_logging() -> Result<()> {
    init_logging_with_config(LogConfig::default())
}

/// Install the global subscriber described by `config`
///
/// Fails if the filter does not parse, the log file cannot be opened, or a
/// subscriber is already installed.
pub fn init_logging_with_config(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.filter)
        .map_err(|e| BridgeError::config(format!("Invalid log filter '{}': {}", config.filter, e)))?;

    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let stderr_layer = config.output.to_stderr().then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_span_events(span_events.clone())
            .with_file(config.file_line)
            .with_line_number(config.file_line)
    });

    let file_layer = if config.output.to_file() {
        let file = open_log_file(config.file_name.as_deref())?;
        Some(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_span_events(span_events)
                .with_file(config.file_line)
                .with_line_number(config.file_line),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| BridgeError::internal(format!("Failed to install log subscriber: {}", e)))
}

/// Open (appending) the log file inside [`paths::log_dir`]
pub fn open_log_file(file_name: Option<&str>) -> Result<File> {
    let dir = paths::log_dir();
    paths::ensure_private_dir(&dir)?;

    let path = dir.join(file_name.unwrap_or(DEFAULT_LOG_FILE));
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| BridgeError::FileWrite { path, source })
}
