//! Unified logging module for the bench services
//!
//! Console output plus a daily rolling log file, both filtered by one
//! `EnvFilter` built from `RUST_LOG` or the configured level.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder as RollingBuilder, Rotation};
use tracing_subscriber::{
    fmt::{
        self,
        format::{FmtSpan, Writer},
        FmtContext, FormatEvent, FormatFields,
    },
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

/// Event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2026-10-18T09:12:44.809123Z [INFO] CDS polling started`
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

// Keeps the non-blocking file writer alive for the process lifetime
static FILE_GUARD: OnceLock<Mutex<Option<WorkerGuard>>> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the log file prefix and the default filter target
    pub service_name: String,
    /// Directory for the rolling log files
    pub log_dir: PathBuf,
    /// Level applied to the service's own target when `RUST_LOG` is unset
    pub level: Level,
    /// Write the file log as JSON lines
    pub enable_json: bool,
    /// Disable the file layer entirely (console only)
    pub console_only: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            log_dir: std::env::var("BENCH_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("logs")),
            level: Level::INFO,
            enable_json: false,
            console_only: false,
        }
    }
}

/// Build the filter directive string.
///
/// `RUST_LOG` wins when present; otherwise dependencies stay at `info` and the
/// service's own target (and the protocol library) use the configured level.
fn filter_spec(config: &LogConfig, rust_log: Option<&str>) -> String {
    match rust_log {
        Some(spec) if !spec.trim().is_empty() => spec.to_string(),
        _ => {
            let level = config.level.as_str().to_lowercase();
            format!(
                "info,{}={},bench_protocols={}",
                config.service_name.replace('-', "_"),
                level,
                level
            )
        },
    }
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let spec = filter_spec(&config, rust_log.as_deref());
    let env_filter = EnvFilter::try_new(&spec)?;

    let console_layer = fmt::layer()
        .with_ansi(true)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = if config.console_only {
        None
    } else {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = RollingBuilder::new()
            .rotation(Rotation::DAILY)
            .filename_prefix(config.service_name.as_str())
            .filename_suffix("log")
            .build(&config.log_dir)?;
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        let guard_slot = FILE_GUARD.get_or_init(|| Mutex::new(None));
        match guard_slot.lock() {
            Ok(mut slot) => *slot = Some(guard),
            Err(poisoned) => {
                eprintln!("Warning: FILE_GUARD lock was poisoned, recovering...");
                *poisoned.into_inner() = Some(guard);
            },
        }

        let layer = if config.enable_json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_level(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_span_events(FmtSpan::CLOSE)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed()
        };
        Some(layer)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    if config.console_only {
        tracing::info!("Logging: {} (console, {})", config.service_name, spec);
    } else {
        tracing::info!(
            "Logging: {} @ {:?} ({})",
            config.service_name, config.log_dir, spec
        );
    }

    Ok(())
}
