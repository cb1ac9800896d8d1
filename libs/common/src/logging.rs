//! Unified logging module for gateway services
//!
//! Console output always; an optional daily-rolling file sink when a log
//! directory is configured. Both sinks share the `timestamp [LEVEL] message`
//! line format.

use std::fs;
use std::path::PathBuf;

use errors::{ServiceError, ServiceResult};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2026-03-02T00:50:44.809312Z [INFO] Gateway listening on 0.0.0.0:1602`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the file prefix and the default debug target
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is not set (e.g. "info", "debug")
    pub level: String,
    /// Directory for the rolling log file; console only when `None`
    pub log_dir: Option<PathBuf>,
    /// Colored console output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            level: "info".to_string(),
            log_dir: None,
            ansi: true,
        }
    }
}

/// Keeps the non-blocking file writer alive; drop it last in `main`.
#[must_use = "dropping the guard stops the file writer"]
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Resolve the filter directive: `RUST_LOG` wins over the configured level.
fn filter_directive(config: &LogConfig, rust_log: Option<String>) -> String {
    match rust_log {
        Some(env_str) if !env_str.trim().is_empty() => env_str,
        _ => config.level.clone(),
    }
}

/// Initialize the global subscriber
pub fn init_logging(config: &LogConfig) -> ServiceResult<LogGuard> {
    let directive = filter_directive(config, std::env::var("RUST_LOG").ok());
    let env_filter = EnvFilter::try_new(&directive)
        .map_err(|e| ServiceError::Logging(format!("invalid log level '{}': {}", directive, e)))?;

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed();
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| ServiceError::Logging(e.to_string()))?;

    match &config.log_dir {
        Some(dir) => tracing::info!("Logging: {} @ {:?}", config.service_name, dir),
        None => tracing::debug!("Logging: {} @ console", config.service_name),
    }

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}
