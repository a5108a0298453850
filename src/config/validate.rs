// src/config/validate.rs

use std::time::Duration;

use crate::config::model::{
    InternalRunnerSettings, QueueSettings, RawServerConfig, ServerConfig, ServerSettings,
};
use crate::errors::{CinderError, Result};
use crate::types::parse_duration;

impl TryFrom<RawServerConfig> for ServerConfig {
    type Error = CinderError;

    fn try_from(raw: RawServerConfig) -> std::result::Result<Self, Self::Error> {
        let defaults = ServerConfig::default();

        let server = ServerSettings {
            core_api_addr: raw
                .server
                .core_api_addr
                .unwrap_or(defaults.server.core_api_addr),
            runner_api_addr: raw
                .server
                .runner_api_addr
                .unwrap_or(defaults.server.runner_api_addr),
            shutdown_timeout: duration_or(
                "server.shutdown_timeout",
                raw.server.shutdown_timeout.as_deref(),
                defaults.server.shutdown_timeout,
            )?,
        };

        let queue = QueueSettings {
            lease_timeout: duration_or(
                "queue.lease_timeout",
                raw.queue.lease_timeout.as_deref(),
                defaults.queue.lease_timeout,
            )?,
            reclaim_interval: duration_or(
                "queue.reclaim_interval",
                raw.queue.reclaim_interval.as_deref(),
                defaults.queue.reclaim_interval,
            )?,
            max_lock_retries: raw
                .queue
                .max_lock_retries
                .unwrap_or(defaults.queue.max_lock_retries),
            max_attempts: raw.queue.max_attempts.unwrap_or(defaults.queue.max_attempts),
            retry_backoff: duration_or(
                "queue.retry_backoff",
                raw.queue.retry_backoff.as_deref(),
                defaults.queue.retry_backoff,
            )?,
            max_retry_backoff: duration_or(
                "queue.max_retry_backoff",
                raw.queue.max_retry_backoff.as_deref(),
                defaults.queue.max_retry_backoff,
            )?,
            job_timeout: duration_or(
                "queue.job_timeout",
                raw.queue.job_timeout.as_deref(),
                defaults.queue.job_timeout,
            )?,
        };

        let internal_runners = InternalRunnerSettings {
            count: raw
                .internal_runners
                .count
                .unwrap_or(defaults.internal_runners.count),
            poll_interval: duration_or(
                "internal_runners.poll_interval",
                raw.internal_runners.poll_interval.as_deref(),
                defaults.internal_runners.poll_interval,
            )?,
            heartbeat_interval: duration_or(
                "internal_runners.heartbeat_interval",
                raw.internal_runners.heartbeat_interval.as_deref(),
                defaults.internal_runners.heartbeat_interval,
            )?,
            grace_period: duration_or(
                "internal_runners.grace_period",
                raw.internal_runners.grace_period.as_deref(),
                defaults.internal_runners.grace_period,
            )?,
        };

        let runners = raw
            .runner
            .into_iter()
            .map(|(name, creds)| (name, creds.token))
            .collect();

        let cfg = ServerConfig {
            server,
            storage: raw.storage,
            queue,
            internal_runners,
            runners,
        };
        validate_server_config(&cfg)?;
        Ok(cfg)
    }
}

fn duration_or(field: &str, value: Option<&str>, default: Duration) -> Result<Duration> {
    match value {
        Some(s) => parse_duration(s)
            .map_err(|e| CinderError::ConfigError(format!("[{field}]: {e}"))),
        None => Ok(default),
    }
}

/// Semantic checks on an assembled config.
pub fn validate_server_config(cfg: &ServerConfig) -> Result<()> {
    validate_listeners(cfg)?;
    validate_queue(cfg)?;
    validate_runner_credentials(cfg)?;
    Ok(())
}

fn validate_listeners(cfg: &ServerConfig) -> Result<()> {
    if cfg.server.core_api_addr == cfg.server.runner_api_addr {
        return Err(CinderError::ConfigError(format!(
            "[server] core_api_addr and runner_api_addr must differ (both are {})",
            cfg.server.core_api_addr
        )));
    }
    Ok(())
}

fn validate_queue(cfg: &ServerConfig) -> Result<()> {
    if cfg.queue.lease_timeout.is_zero() || cfg.queue.reclaim_interval.is_zero() {
        return Err(CinderError::ConfigError(
            "[queue] lease_timeout and reclaim_interval must be > 0".to_string(),
        ));
    }
    if cfg.queue.max_lock_retries == 0 {
        return Err(CinderError::ConfigError(
            "[queue].max_lock_retries must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.queue.max_attempts == 0 {
        return Err(CinderError::ConfigError(
            "[queue].max_attempts must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.queue.job_timeout.is_zero() {
        return Err(CinderError::ConfigError(
            "[queue].job_timeout must be > 0".to_string(),
        ));
    }
    if cfg.queue.retry_backoff > cfg.queue.max_retry_backoff {
        return Err(CinderError::ConfigError(format!(
            "[queue].retry_backoff ({:?}) must not exceed max_retry_backoff ({:?})",
            cfg.queue.retry_backoff, cfg.queue.max_retry_backoff
        )));
    }
    if cfg.internal_runners.heartbeat_interval >= cfg.queue.lease_timeout {
        return Err(CinderError::ConfigError(format!(
            "[internal_runners].heartbeat_interval ({:?}) must be shorter than [queue].lease_timeout ({:?})",
            cfg.internal_runners.heartbeat_interval, cfg.queue.lease_timeout
        )));
    }
    Ok(())
}

fn validate_runner_credentials(cfg: &ServerConfig) -> Result<()> {
    for (name, token) in cfg.runners.iter() {
        if token.trim().is_empty() {
            return Err(CinderError::ConfigError(format!(
                "[runner.{name}] token must not be empty"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StorageBackend;

    fn parse(src: &str) -> Result<ServerConfig> {
        let raw: RawServerConfig = toml::from_str(src)?;
        ServerConfig::try_from(raw)
    }

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.queue.lease_timeout, Duration::from_secs(30));
        assert_eq!(cfg.internal_runners.count, 1);
        assert!(cfg.runners.is_empty());
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = parse(
            r#"
            [storage]
            backend = "sqlite"
            path = "/tmp/x.db"

            [queue]
            lease_timeout = "2m"

            [internal_runners]
            count = 0
            heartbeat_interval = "500ms"

            [runner.builder]
            token = "t0ken"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.storage.backend, StorageBackend::Sqlite);
        assert_eq!(cfg.queue.lease_timeout, Duration::from_secs(120));
        assert_eq!(cfg.internal_runners.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(cfg.runners["builder"], "t0ken");
    }

    #[test]
    fn heartbeat_must_beat_the_lease_timeout() {
        let err = parse(
            r#"
            [queue]
            lease_timeout = "5s"
            [internal_runners]
            heartbeat_interval = "5s"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, CinderError::ConfigError(_)));
    }

    #[test]
    fn retry_and_timeout_settings_are_read_and_checked() {
        let cfg = parse(
            r#"
            [queue]
            max_attempts = 3
            retry_backoff = "2s"
            max_retry_backoff = "5s"
            job_timeout = "30m"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.queue.max_attempts, 3);
        assert_eq!(cfg.queue.job_timeout, Duration::from_secs(30 * 60));
        assert_eq!(cfg.queue.retry_delay(1), Duration::from_secs(2));
        assert_eq!(cfg.queue.retry_delay(2), Duration::from_secs(4));
        assert_eq!(cfg.queue.retry_delay(3), Duration::from_secs(5));
        assert_eq!(cfg.queue.retry_delay(40), Duration::from_secs(5));

        assert!(parse("[queue]\nmax_attempts = 0").is_err());
        assert!(parse("[queue]\njob_timeout = \"0s\"").is_err());
        assert!(parse("[queue]\nretry_backoff = \"2m\"").is_err());
    }

    #[test]
    fn listeners_must_not_share_an_address() {
        let err = parse(
            r#"
            [server]
            core_api_addr = "127.0.0.1:9000"
            runner_api_addr = "127.0.0.1:9000"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, CinderError::ConfigError(_)));
    }

    #[test]
    fn bad_durations_and_tokens_are_rejected() {
        assert!(parse("[queue]\nlease_timeout = \"soon\"").is_err());
        assert!(parse("[runner.x]\ntoken = \" \"").is_err());
    }
}
