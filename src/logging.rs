//! Tracing subscriber setup.

use crate::config::{LogFormat, LoggingSettings};
use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, EnvFilter};

/// Target used for per-stream access records.
pub const ACCESS_LOG_TARGET: &str = "interstellar::access";

fn env_filter(settings: &LoggingSettings) -> EnvFilter {
    match &settings.filter {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::builder()
            .with_default_directive(
                settings
                    .level
                    .parse::<tracing::Level>()
                    .unwrap_or(tracing::Level::INFO)
                    .into(),
            )
            .from_env_lossy(),
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the process when `settings.directory` is set.
pub fn init(settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    LogTracer::init().context("Failed to initialize log tracer")?;

    let (writer, guard) = match &settings.directory {
        Some(directory) => {
            let appender = RollingFileAppender::new(Rotation::DAILY, directory, "interstellar.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (fmt::writer::BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (fmt::writer::BoxMakeWriter::new(std::io::stdout), None),
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(env_filter(settings))
        .with_writer(writer)
        .with_ansi(settings.directory.is_none())
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);

    let installed = match settings.format {
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(guard)
}
