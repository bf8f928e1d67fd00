//! Unified logging for simulator services
//!
//! Console output always; an optional daily-rolling file layer under
//! `<log_dir>/<service>/`. Both use the bracketed `timestamp [LEVEL] message`
//! format.

use std::fs;
use std::path::PathBuf;

use tracing::Level;
pub use tracing_appender::non_blocking::WorkerGuard;
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

/// Event formatter that outputs: `timestamp [LEVEL] message key=value...`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] sn="JG0001" device registered`
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
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
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
    /// Service name, used for the file prefix and the default filter directive
    pub service_name: String,
    /// Base directory for log files
    pub log_dir: PathBuf,
    /// Console log level
    pub console_level: Level,
    /// Write a daily-rolling log file in addition to the console
    pub file_enabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            log_dir: PathBuf::from("logs"),
            console_level: Level::INFO,
            file_enabled: false,
        }
    }
}

/// Parse a textual log level, falling back to INFO
pub fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Build the filter directive used when `RUST_LOG` is not set
fn default_directive(config: &LogConfig) -> String {
    let level = config.console_level.as_str().to_ascii_lowercase();
    // sqlx logs every statement at INFO
    format!("{},{}={},sqlx=warn", level, config.service_name, level)
}

/// Initialize logging system with configuration
///
/// The returned guard flushes the non-blocking file writer on drop and must be
/// held by the caller for the lifetime of the process. `RUST_LOG` overrides the
/// configured level when present.
pub fn init_with_config(config: LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = match std::env::var("RUST_LOG") {
        Ok(env_str) if !env_str.is_empty() => EnvFilter::new(env_str),
        _ => EnvFilter::new(default_directive(&config)),
    };

    let console_layer = fmt::layer()
        .with_ansi(true)
        .event_format(BracketedLevelFormat)
        .boxed();

    let (file_layer, guard) = if config.file_enabled {
        let dir = config.log_dir.join(&config.service_name);
        fs::create_dir_all(&dir)?;
        let appender = tracing_appender::rolling::daily(&dir, format!("{}.log", config.service_name));
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .event_format(BracketedLevelFormat)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    tracing::info!(
        "Logging: {} @ {:?} (file: {})",
        config.service_name,
        config.log_dir,
        config.file_enabled
    );

    Ok(guard)
}
