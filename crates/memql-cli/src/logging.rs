//! Structured logging for the memql command line
//!
//! Logs go to stderr, to daily-rotated files, or both, so that stdout only
//! carries command output.

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "memql.log";

/// Log format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, multi-line
    Pretty,
    /// One JSON object per event
    Json,
    Compact,
}

impl LogFormat {
    /// Unknown names fall back to compact.
    pub fn from_name(name: &str) -> Self {
        match name {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Compact,
        }
    }
}

/// Log output configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stderr,
    File,
    Both,
}

impl LogOutput {
    /// Unknown names fall back to stderr.
    pub fn from_name(name: &str) -> Self {
        match name {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            _ => LogOutput::Stderr,
        }
    }
}

fn console_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .boxed(),
    }
}

/// Initialize logging from the resolved configuration.
///
/// `level` accepts anything `EnvFilter` does, e.g. `debug` or
/// `memql_model=trace,info`. An unparsable filter falls back to `info`.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let format = LogFormat::from_name(&config.format);
    let output = LogOutput::from_name(&config.output);

    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;

    match output {
        LogOutput::Stderr => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer(format))
                .try_init()?;
        }
        LogOutput::File => {
            std::fs::create_dir_all(&config.directory)?;
            let file_appender =
                RollingFileAppender::new(Rotation::DAILY, &config.directory, LOG_FILE_PREFIX);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(file_appender).with_ansi(false))
                .try_init()?;
        }
        LogOutput::Both => {
            std::fs::create_dir_all(&config.directory)?;
            let file_appender =
                RollingFileAppender::new(Rotation::DAILY, &config.directory, LOG_FILE_PREFIX);

            let file_layer = fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .boxed();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer(format))
                .with(file_layer)
                .try_init()?;
        }
    }

    tracing::debug!(
        format = ?format,
        output = ?output,
        level = %config.level,
        "Logging initialized"
    );
    Ok(())
}
