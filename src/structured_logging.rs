//! Tracing setup for the ask-continue MCP server.
//!
//! Stdout carries the MCP stdio transport, so log output goes to stderr by
//! default, or to a development log file when `--dev-log` is passed.

use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::constants;

/// Initialize tracing for the process.
///
/// Returns a flush guard that must be kept alive until shutdown when dev
/// logging is enabled.
pub fn init_tracing(
    enable_dev_log: bool,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, Box<dyn std::error::Error>> {
    if enable_dev_log {
        use std::fs::OpenOptions;
        use tracing_appender::non_blocking;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(constants::dev_log_path())?;

        let (file_writer, guard) = non_blocking(file);

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_writer)
                    .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG),
            )
            .init();

        eprintln!(
            "Development logging enabled - writing to {} (PID: {})",
            constants::dev_log_path().display(),
            std::process::id()
        );

        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(tracing_subscriber::EnvFilter::from_default_env()),
            )
            .init();

        Ok(None)
    }
}
