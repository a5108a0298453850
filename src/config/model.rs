// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::types::StorageBackend;

pub const DEFAULT_CORE_API_ADDR: &str = "127.0.0.1:7700";
pub const DEFAULT_RUNNER_API_ADDR: &str = "127.0.0.1:7701";
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STORAGE_PATH: &str = "cinder.db";
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_LOCK_RETRIES: usize = 8;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Server configuration as read from `Cinder.toml`.
///
/// ```toml
/// [server]
/// core_api_addr = "127.0.0.1:7700"
/// runner_api_addr = "127.0.0.1:7701"
/// shutdown_timeout = "10s"
///
/// [storage]
/// backend = "sqlite"
/// path = "cinder.db"
///
/// [queue]
/// lease_timeout = "30s"
/// reclaim_interval = "5s"
/// max_attempts = 10
/// retry_backoff = "1s"
/// max_retry_backoff = "1m"
/// job_timeout = "2h"
///
/// [internal_runners]
/// count = 2
///
/// [runner.builder-1]
/// token = "s3cret"
/// ```
///
/// Every section is optional. Durations are strings with a `ms`, `s`, `m`
/// or `h` suffix and are parsed during validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawServerConfig {
    #[serde(default)]
    pub server: RawServerSection,

    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub queue: RawQueueSection,

    #[serde(default)]
    pub internal_runners: RawInternalRunnersSection,

    /// External runner credentials from `[runner.<name>]`.
    #[serde(default)]
    pub runner: BTreeMap<String, RunnerCredentials>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawServerSection {
    pub core_api_addr: Option<String>,
    pub runner_api_addr: Option<String>,
    pub shutdown_timeout: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Database file for the `sqlite` backend.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

fn default_storage_path() -> String {
    DEFAULT_STORAGE_PATH.to_string()
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawQueueSection {
    /// How long a lease survives without a heartbeat.
    pub lease_timeout: Option<String>,
    /// How often the reaper looks for expired leases.
    pub reclaim_interval: Option<String>,
    /// Optimistic-lock retries per coordinator operation.
    pub max_lock_retries: Option<usize>,
    /// Leases a job may use before it is failed.
    pub max_attempts: Option<u32>,
    pub retry_backoff: Option<String>,
    pub max_retry_backoff: Option<String>,
    /// Longest a job may run, counted from its first lease.
    pub job_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawInternalRunnersSection {
    pub count: Option<usize>,
    pub poll_interval: Option<String>,
    pub heartbeat_interval: Option<String>,
    /// How long `stop` waits for in-flight jobs before aborting them.
    pub grace_period: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerCredentials {
    pub token: String,
}

/// Validated server configuration. Construct via `TryFrom<RawServerConfig>`.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub storage: StorageSection,
    pub queue: QueueSettings,
    pub internal_runners: InternalRunnerSettings,
    /// External runner name → token.
    pub runners: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub core_api_addr: String,
    pub runner_api_addr: String,
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub lease_timeout: Duration,
    pub reclaim_interval: Duration,
    pub max_lock_retries: usize,
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt up to
    /// `max_retry_backoff`.
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub job_timeout: Duration,
}

impl QueueSettings {
    /// Exponential backoff after `attempts` unfinished leases.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let doublings = attempts.saturating_sub(1).min(30);
        self.retry_backoff
            .checked_mul(1 << doublings)
            .unwrap_or(self.max_retry_backoff)
            .min(self.max_retry_backoff)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InternalRunnerSettings {
    pub count: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub grace_period: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            core_api_addr: DEFAULT_CORE_API_ADDR.to_string(),
            runner_api_addr: DEFAULT_RUNNER_API_ADDR.to_string(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
            max_lock_retries: DEFAULT_MAX_LOCK_RETRIES,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_retry_backoff: DEFAULT_MAX_RETRY_BACKOFF,
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }
}

impl Default for InternalRunnerSettings {
    fn default() -> Self {
        Self {
            count: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}
