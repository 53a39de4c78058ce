//! Logging initialization

use anyhow::{Context, Result};
use detour_core::config::LoggingConfig;
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::args::{Args, LogFormat};

/// Initialize logging from CLI arguments, falling back to the `[logging]` section.
///
/// Keep the returned guard alive until exit so buffered file output is flushed.
pub fn init(args: &Args, config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let level = if args.quiet {
        Level::ERROR
    } else {
        match args.verbose {
            0 => config.level.parse().unwrap_or(Level::INFO),
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let format = if args.log_format == LogFormat::Text && config.json_format {
        LogFormat::Json
    } else {
        args.log_format
    };

    let log_file = args
        .log_file
        .clone()
        .or_else(|| config.file.as_ref().map(PathBuf::from));
    let (file_writer, guard) = match log_file {
        Some(path) => {
            let file = std::fs::File::create(&path)
                .with_context(|| format!("Failed to create log file: {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    // Console output goes to stderr so command output stays pipeable
    match format {
        LogFormat::Text => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(args.verbose >= 2)
                    .with_thread_ids(args.verbose >= 3)
                    .with_file(args.verbose >= 3)
                    .with_line_number(args.verbose >= 3),
            );
            match file_writer {
                Some(writer) => subscriber
                    .with(fmt::layer().with_ansi(false).with_writer(writer))
                    .init(),
                None => subscriber.init(),
            }
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr));
            match file_writer {
                Some(writer) => subscriber
                    .with(fmt::layer().json().with_writer(writer))
                    .init(),
                None => subscriber.init(),
            }
        }
        LogFormat::Compact => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_writer(std::io::stderr));
            match file_writer {
                Some(writer) => subscriber
                    .with(fmt::layer().compact().with_ansi(false).with_writer(writer))
                    .init(),
                None => subscriber.init(),
            }
        }
    }

    Ok(guard)
}
