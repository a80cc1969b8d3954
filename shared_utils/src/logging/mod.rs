//! Logging module for osrouter.
//!
//! This module provides structured logging functionality using the `tracing` crate.
//! Records emitted through the `log` crate are bridged into `tracing`.

use tracing::Level;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

/// Log initialization options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Log level (default: INFO)
    pub level: Level,

    /// Whether to log to stderr (default: true). Stdout is left to command
    /// output such as `status` and `--dry-run`.
    pub log_to_stderr: bool,

    /// Whether to log to a file (default: false)
    pub log_to_file: bool,

    /// Directory to store log files (default: "/var/log/osrouter")
    pub log_dir: String,

    /// Base filename for log files (default: "osrouterd.log")
    pub log_file_name: String,

    /// Whether to use JSON format for logs (default: false)
    pub json_format: bool,

    /// Whether to include file and line information (default: false)
    pub include_file_line: bool,

    /// Whether to log span open/close events (default: false)
    pub include_span_events: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::INFO,
            log_to_stderr: true,
            log_to_file: false,
            log_dir: "/var/log/osrouter".to_string(),
            log_file_name: "osrouterd.log".to_string(),
            json_format: false,
            include_file_line: false,
            include_span_events: false,
        }
    }
}

/// Parses a level name, falling back to INFO.
pub fn parse_level(name: &str) -> Level {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with the given options.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure logs are flushed properly.
///
/// # Examples
///
/// ```
/// use shared_utils::logging::{init_logging, LogOptions};
/// use tracing::Level;
///
/// let options = LogOptions {
///     level: Level::DEBUG,
///     ..Default::default()
/// };
///
/// let _guard = init_logging(options);
/// ```
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    let _ = LogTracer::init();

    let filter = EnvFilter::from_default_env().add_directive(options.level.into());
    let span_events = if options.include_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let mut layers = Vec::new();
    let mut guard = None;

    if options.log_to_stderr {
        let stderr_layer = fmt::layer()
            .with_file(options.include_file_line)
            .with_line_number(options.include_file_line)
            .with_target(true)
            .with_span_events(span_events.clone())
            .with_writer(std::io::stderr);

        let stderr_layer = if options.json_format {
            stderr_layer.json().boxed()
        } else {
            stderr_layer.boxed()
        };

        layers.push(stderr_layer);
    }

    if options.log_to_file {
        let file_appender =
            RollingFileAppender::new(Rotation::DAILY, &options.log_dir, &options.log_file_name);

        let (non_blocking, worker_guard) = NonBlocking::new(file_appender);
        guard = Some(worker_guard);

        let file_layer = fmt::layer()
            .with_file(options.include_file_line)
            .with_line_number(options.include_file_line)
            .with_target(true)
            .with_ansi(false)
            .with_span_events(span_events)
            .with_writer(non_blocking);

        let file_layer = if options.json_format {
            file_layer.json().boxed()
        } else {
            file_layer.boxed()
        };

        layers.push(file_layer);
    }

    // Ignore if a subscriber is already set in this process
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init();

    guard
}

/// Initialize logging from a configuration.
///
/// `level_override` wins over the configured `log_level`, e.g. a
/// `--log-level` flag on the command line.
///
/// # Examples
///
/// ```
/// use shared_utils::logging::init_logging_from_config;
/// use shared_utils::config::Config;
///
/// let config = Config::default();
/// let _guard = init_logging_from_config(&config, None);
/// ```
pub fn init_logging_from_config(
    config: &crate::config::Config,
    level_override: Option<&str>,
) -> Option<WorkerGuard> {
    let options = LogOptions {
        level: parse_level(level_override.unwrap_or(&config.log_level)),
        log_to_file: config.logging.log_to_file,
        log_dir: config.logging.log_dir.clone(),
        json_format: config.logging.json_format,
        ..Default::default()
    };

    init_logging(options)
}
