// src/store/records.rs

//! Persisted builds, jobs and runners.
//!
//! A build never stores its own status: it is always derived from its jobs
//! by [`crate::dag::JobGraph::aggregate_status`]. The only build-level field
//! that changes after submission is the failure summary written once the
//! build reaches a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::JobStatus;
use crate::store::Resource;
use crate::types::{BuildId, DependencyPolicy, JobId, RunnerId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub name: String,
    pub submitted_at: DateTime<Utc>,
    /// Summary such as `"2 job(s) failed"`, set when the build terminates.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub version: u64,
}

impl Resource for Build {
    const KIND: &'static str = "build";
    const TABLE: &'static str = "builds";

    fn id(&self) -> &str {
        self.id.as_str()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Wall-clock milestones of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTimings {
    pub created_at: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub build_id: BuildId,
    pub name: String,
    /// Position of the job in its build definition; second ordering key
    /// after the submission time.
    pub index: u32,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub depends_on: Vec<JobId>,
    #[serde(default)]
    pub policy: DependencyPolicy,
    #[serde(default)]
    pub commands: Vec<String>,
    pub status: JobStatus,
    /// Failure reason reported by the runner, stored verbatim.
    #[serde(default)]
    pub error: Option<String>,
    /// Runner that last leased this job.
    #[serde(default)]
    pub runner: Option<RunnerId>,
    #[serde(default)]
    pub timings: JobTimings,
    #[serde(default)]
    pub version: u64,
}

impl Job {
    /// Deterministic scheduling order: submission time, then definition
    /// position, then identifier.
    pub fn sort_key(&self) -> (DateTime<Utc>, u32, &str) {
        (self.submitted_at, self.index, self.id.as_str())
    }
}

impl Resource for Job {
    const KIND: &'static str = "job";
    const TABLE: &'static str = "jobs";

    fn id(&self) -> &str {
        self.id.as_str()
    }

    fn owner(&self) -> Option<&str> {
        Some(self.build_id.as_str())
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// A runner known to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerRecord {
    pub id: RunnerId,
    pub name: String,
    /// Runs inside the server process.
    pub internal: bool,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl RunnerRecord {
    /// Runner ids are stable per name so that a restarted runner keeps its
    /// identity.
    pub fn id_for(name: &str) -> RunnerId {
        RunnerId::from(format!("runner-{name}"))
    }
}

impl Resource for RunnerRecord {
    const KIND: &'static str = "runner";
    const TABLE: &'static str = "runners";

    fn id(&self) -> &str {
        self.id.as_str()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}
