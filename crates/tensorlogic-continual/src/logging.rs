//! Logging for continual-learning runs.
//!
//! Two things live here:
//! - [`TaskLog`], the per-task buffer of `[YYYY-mm-dd HH:MM:SS] message` lines
//!   that callers poll while a task runs.
//! - [`TracingLogger`], a subscriber builder for the `tracing` events every
//!   component emits. It needs the `structured-logging` feature:
//!
//! ```toml
//! [dependencies]
//! tensorlogic-continual = { version = "0.1", features = ["structured-logging"] }
//! ```
//!
//! ```no_run
//! # #[cfg(feature = "structured-logging")]
//! # {
//! use tensorlogic_continual::logging::{LogFormat, TracingLogger};
//!
//! let _logger = TracingLogger::builder()
//!     .with_format(LogFormat::Json)
//!     .build()
//!     .expect("Failed to initialize logger");
//!
//! tracing::info!(task_id = "Task_regular_20240101_000000", "task created");
//! # }
//! ```

use chrono::Local;
use serde::{Deserialize, Serialize};

#[cfg(feature = "structured-logging")]
use crate::{config::LogSettings, ContinualError, ContinualResult};

#[cfg(feature = "structured-logging")]
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Timestamp format used for task log lines.
pub const TASK_LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Ordered, timestamped log lines of one training task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLog {
    lines: Vec<String>,
}

impl TaskLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message stamped with the local wall-clock time.
    pub fn push(&mut self, message: impl AsRef<str>) {
        let stamp = Local::now().format(TASK_LOG_TIME_FORMAT);
        self.lines.push(format!("[{}] {}", stamp, message.as_ref()));
    }

    /// All lines in insertion order.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Number of lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the log has no lines.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Message part of the most recent line.
    pub fn last_message(&self) -> Option<&str> {
        self.lines
            .last()
            .map(|line| line.split_once("] ").map_or(line.as_str(), |(_, msg)| msg))
    }
}

/// Log output format.
#[cfg(feature = "structured-logging")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    Pretty,
    /// Single-line output without colors.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Log level filter.
#[cfg(feature = "structured-logging")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Everything.
    Trace,
    /// Debug and higher.
    Debug,
    /// Info and higher.
    Info,
    /// Warnings and errors.
    Warn,
    /// Errors only.
    Error,
}

#[cfg(feature = "structured-logging")]
impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Parse a level name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Builder for the process-wide tracing subscriber.
#[cfg(feature = "structured-logging")]
#[derive(Debug, Clone)]
pub struct TracingLoggerBuilder {
    format: LogFormat,
    level: LogLevel,
    env_filter: Option<String>,
    with_targets: bool,
    with_thread_names: bool,
}

#[cfg(feature = "structured-logging")]
impl Default for TracingLoggerBuilder {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            level: LogLevel::Info,
            env_filter: None,
            with_targets: true,
            with_thread_names: true,
        }
    }
}

#[cfg(feature = "structured-logging")]
impl TracingLoggerBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from orchestrator log settings.
    pub fn from_settings(settings: &LogSettings) -> Self {
        let format = if settings.json {
            LogFormat::Json
        } else {
            LogFormat::Compact
        };
        Self::new()
            .with_format(format)
            .with_level(LogLevel::parse(&settings.level).unwrap_or(LogLevel::Info))
    }

    /// Set the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the level used when `RUST_LOG` is unset.
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Use an explicit filter directive instead of the level.
    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Include module targets.
    pub fn with_targets(mut self, enabled: bool) -> Self {
        self.with_targets = enabled;
        self
    }

    /// Include worker thread names, which carry the task id.
    pub fn with_thread_names(mut self, enabled: bool) -> Self {
        self.with_thread_names = enabled;
        self
    }

    /// Install the subscriber. Fails if one is already installed.
    pub fn build(self) -> ContinualResult<TracingLogger> {
        let env_filter = match self.env_filter {
            Some(custom) => EnvFilter::try_new(custom)
                .map_err(|e| ContinualError::ConfigError(format!("Invalid env filter: {}", e)))?,
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(self.level.as_str())),
        };

        let base = fmt::layer()
            .with_target(self.with_targets)
            .with_thread_names(self.with_thread_names);

        let result = match self.format {
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(base.pretty())
                .try_init(),
            LogFormat::Compact => tracing_subscriber::registry()
                .with(env_filter)
                .with(base.with_ansi(false).compact())
                .try_init(),
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(base.json())
                .try_init(),
        };
        result.map_err(|e| ContinualError::Other(format!("Failed to initialize tracing: {}", e)))?;

        Ok(TracingLogger {
            format: self.format,
        })
    }
}

/// Handle for an installed tracing subscriber.
#[cfg(feature = "structured-logging")]
#[derive(Debug)]
pub struct TracingLogger {
    format: LogFormat,
}

#[cfg(feature = "structured-logging")]
impl TracingLogger {
    /// Create a builder.
    pub fn builder() -> TracingLoggerBuilder {
        TracingLoggerBuilder::new()
    }

    /// Install a subscriber configured from orchestrator settings.
    pub fn init_from_settings(settings: &LogSettings) -> ContinualResult<Self> {
        TracingLoggerBuilder::from_settings(settings).build()
    }

    /// Output format of the installed subscriber.
    pub fn format(&self) -> LogFormat {
        self.format
    }
}
