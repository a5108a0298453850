// src/logging.rs

//! Logging setup for `cinder` using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log level:
//! 1. `--log-level` CLI flag (if provided)
//! 2. `CINDER_LOG` environment variable, either a bare level ("debug") or
//!    a full filter directive ("cinder::engine=debug,info")
//! 3. default to `info`
//!
//! Logs are sent to STDERR so that stdout stays free for command output.

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use crate::cli::LogLevel;

pub const LOG_ENV_VAR: &str = "CINDER_LOG";

/// Initialise global logging subscriber.
///
/// Safe to call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let filter = match cli_level {
        Some(lvl) => EnvFilter::new(level_from_log_level(lvl).to_string()),
        None => match std::env::var(LOG_ENV_VAR) {
            Ok(s) => filter_from_env(&s)?,
            Err(_) => EnvFilter::new("info"),
        },
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))?;

    Ok(())
}

fn filter_from_env(value: &str) -> Result<EnvFilter> {
    if let Some(level) = parse_level_str(value) {
        return Ok(EnvFilter::new(level.to_string()));
    }
    EnvFilter::try_new(value).map_err(|e| anyhow::anyhow!("invalid {LOG_ENV_VAR} value '{value}': {e}"))
}

fn level_from_log_level(lvl: LogLevel) -> tracing::Level {
    match lvl {
        LogLevel::Error => tracing::Level::ERROR,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Trace => tracing::Level::TRACE,
    }
}

fn parse_level_str(s: &str) -> Option<tracing::Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_levels_and_directives_are_accepted() {
        assert_eq!(parse_level_str(" Warning "), Some(tracing::Level::WARN));
        assert!(filter_from_env("cinder::engine=debug,info").is_ok());
        assert!(filter_from_env("cinder=notalevel").is_err());
    }
}
