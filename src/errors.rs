// src/errors.rs

//! Crate-wide error type and result alias.
//!
//! The variants mirror the failure classes of the orchestration engine:
//! store-level errors (`NotFound`, `AlreadyExists`, `OptimisticLockFailed`)
//! propagate unchanged to the coordinator, which decides whether they are
//! retried or surfaced. Each variant has a stable wire code so that the two
//! network surfaces can round-trip errors to their clients.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CinderError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("optimistic lock failed for {kind} {id} (expected version {expected})")]
    OptimisticLockFailed {
        kind: &'static str,
        id: String,
        expected: u64,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("runner {runner} does not hold the lease on work item {item}")]
    LeaseNotOwned { item: String, runner: String },

    #[error("cycle detected in job graph: {0}")]
    GraphCycle(String),

    #[error("internal inconsistency: job {job} cannot transition from {from} to {to}")]
    InvalidTransition {
        job: String,
        from: String,
        to: String,
    },

    #[error("invalid log append: {0}")]
    InvalidLog(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    StorageError(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CinderError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        CinderError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn already_exists(kind: &'static str, id: impl ToString) -> Self {
        CinderError::AlreadyExists {
            kind,
            id: id.to_string(),
        }
    }

    pub fn lock_failed(kind: &'static str, id: impl ToString, expected: u64) -> Self {
        CinderError::OptimisticLockFailed {
            kind,
            id: id.to_string(),
            expected,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CinderError::NotFound { .. })
    }

    pub fn is_lock_failure(&self) -> bool {
        matches!(self, CinderError::OptimisticLockFailed { .. })
    }

    /// Stable code used on the wire by both API surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            CinderError::NotFound { .. } => "not_found",
            CinderError::AlreadyExists { .. } => "already_exists",
            CinderError::OptimisticLockFailed { .. } => "optimistic_lock_failed",
            CinderError::Unauthorized(_) => "unauthorized",
            CinderError::LeaseNotOwned { .. } => "lease_not_owned",
            CinderError::GraphCycle(_) => "graph_cycle",
            CinderError::InvalidLog(_) | CinderError::InvalidRequest(_) => "invalid_request",
            CinderError::ConfigError(_) => "config",
            _ => "internal",
        }
    }

    /// Rebuild an error received from the wire.
    ///
    /// Structured fields are not transmitted, so the message is carried in
    /// the `id` / payload slot of the reconstructed variant.
    pub fn from_wire(code: &str, message: String) -> Self {
        match code {
            "not_found" => CinderError::NotFound {
                kind: "resource",
                id: message,
            },
            "already_exists" => CinderError::AlreadyExists {
                kind: "resource",
                id: message,
            },
            "optimistic_lock_failed" => CinderError::OptimisticLockFailed {
                kind: "resource",
                id: message,
                expected: 0,
            },
            "unauthorized" => CinderError::Unauthorized(message),
            "lease_not_owned" => CinderError::LeaseNotOwned {
                item: message,
                runner: String::new(),
            },
            "graph_cycle" => CinderError::GraphCycle(message),
            "invalid_request" => CinderError::InvalidRequest(message),
            "config" => CinderError::ConfigError(message),
            _ => CinderError::Other(anyhow::anyhow!(message)),
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, CinderError>;
