// src/types.rs

//! Small shared types: resource identifiers and configuration enums.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh, globally unique identifier.
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "-{}"), uuid::Uuid::new_v4()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

resource_id!(
    /// Identifier of a submitted build.
    BuildId,
    "build"
);
resource_id!(
    /// Identifier of a single job within a build.
    JobId,
    "job"
);
resource_id!(
    /// Identifier of a leasable work item.
    WorkItemId,
    "work-item"
);
resource_id!(
    /// Identifier of a registered runner.
    RunnerId,
    "runner"
);

impl WorkItemId {
    /// Work items are 1:1 with jobs, so the id is derived from the job id.
    /// Materialising the same job twice therefore collides on `Create`.
    pub fn for_job(job: &JobId) -> Self {
        Self(format!("work-item-{}", job.as_str()))
    }
}

/// What a job does when one of its dependencies finishes without success.
///
/// - `Skip` (default): the job transitions straight to `Skipped`.
/// - `Run`: the job becomes eligible once every dependency is terminal,
///   regardless of outcome (e.g. cleanup or notification jobs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DependencyPolicy {
    #[default]
    Skip,
    Run,
}

impl FromStr for DependencyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "skip" => Ok(DependencyPolicy::Skip),
            "run" => Ok(DependencyPolicy::Run),
            other => Err(format!(
                "invalid on_dependency_failure: {other} (expected \"skip\" or \"run\")"
            )),
        }
    }
}

/// Where resource tables and log lines are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Keep everything in memory (lost on restart).
    #[default]
    Memory,
    /// Persist to a SQLite database file.
    Sqlite,
}

/// Parse a duration string such as `"500ms"`, `"30s"`, `"5m"` or `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
