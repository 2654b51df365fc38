//! Structured logging setup.

use anyhow::{anyhow, Result};
use tracing::Level;

use crate::config::{LogFormat, LogLevel};

/// Installs the global tracing subscriber. Must run once, before anything
/// logs.
pub fn init(level: LogLevel, format: LogFormat) -> Result<()> {
    let max_level = match level {
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Info => Level::INFO,
        LogLevel::Warn => Level::WARN,
        LogLevel::Error => Level::ERROR,
    };

    let builder = tracing_subscriber::fmt().with_max_level(max_level);
    let result = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Console => builder.try_init(),
    };
    result.map_err(|err| anyhow!("failed to install logger: {err}"))
}
