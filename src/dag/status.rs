// src/dag/status.rs

//! Status state machine shared by jobs and work items.
//!
//! ```text
//! Submitted -> Queued -> Running -> { Succeeded, Failed, Canceled }
//! Submitted | Queued -> Skipped
//! any non-terminal   -> Canceled
//! ```
//!
//! Transitions only move forward. Re-entering the current non-terminal state
//! is a no-op (a reclaimed lease being granted again leaves a job `Running`);
//! any attempt to leave a terminal state is an internal inconsistency.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{CinderError, Result};
use crate::types::RunnerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Admitted, waiting on dependencies.
    Submitted,
    /// Dependencies satisfied; a work item exists and awaits a runner.
    Queued,
    /// Leased by a runner.
    Running,
    Succeeded,
    Failed,
    Canceled,
    /// Never ran because a dependency did not succeed.
    Skipped,
}

impl JobStatus {
    /// Submitted, Queued and Running.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            JobStatus::Submitted | JobStatus::Queued | JobStatus::Running
        )
    }

    pub fn has_finished(self) -> bool {
        !self.is_pending()
    }

    pub fn is_success(self) -> bool {
        self == JobStatus::Succeeded
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Submitted => 0,
            JobStatus::Queued => 1,
            JobStatus::Running => 2,
            _ => 3,
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.has_finished() {
            return false;
        }
        if self == next {
            return true;
        }
        match next {
            JobStatus::Submitted => false,
            JobStatus::Queued | JobStatus::Running => next.rank() > self.rank(),
            JobStatus::Succeeded | JobStatus::Failed => self == JobStatus::Running,
            JobStatus::Canceled => true,
            JobStatus::Skipped => matches!(self, JobStatus::Submitted | JobStatus::Queued),
        }
    }

    /// Validate `self -> next` for the given job, returning the new status.
    pub fn transition(self, job: &str, next: JobStatus) -> Result<JobStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            tracing::error!(
                job = %job,
                from = %self,
                to = %next,
                "rejected invalid job status transition"
            );
            Err(CinderError::InvalidTransition {
                job: job.to_string(),
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Collapsed status used by observers.
    pub fn display(self) -> DisplayStatus {
        match self {
            JobStatus::Submitted | JobStatus::Queued | JobStatus::Running => DisplayStatus::Pending,
            JobStatus::Succeeded => DisplayStatus::Succeeded,
            JobStatus::Failed => DisplayStatus::Failed,
            JobStatus::Canceled => DisplayStatus::Canceled,
            JobStatus::Skipped => DisplayStatus::Skipped,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// What a UI shows: the three pending states fold into one indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayStatus {
    Pending,
    Succeeded,
    Failed,
    Canceled,
    Skipped,
}

/// Terminal result reported by a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Succeeded,
    Failed,
    Canceled,
}

impl Outcome {
    pub fn job_status(self) -> JobStatus {
        match self {
            Outcome::Succeeded => JobStatus::Succeeded,
            Outcome::Failed => JobStatus::Failed,
            Outcome::Canceled => JobStatus::Canceled,
        }
    }
}

/// Lifecycle of a work item. `Pending` pairs with Submitted/Queued jobs,
/// `Leased` with Running, and `Done` carries the terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum WorkItemState {
    Pending,
    Leased {
        runner: RunnerId,
        leased_at: DateTime<Utc>,
        heartbeat_at: DateTime<Utc>,
    },
    Done {
        outcome: Outcome,
    },
}

impl WorkItemState {
    pub fn job_status(&self) -> JobStatus {
        match self {
            WorkItemState::Pending => JobStatus::Queued,
            WorkItemState::Leased { .. } => JobStatus::Running,
            WorkItemState::Done { outcome } => outcome.job_status(),
        }
    }

    pub fn lease_holder(&self) -> Option<&RunnerId> {
        match self {
            WorkItemState::Leased { runner, .. } => Some(runner),
            _ => None,
        }
    }
}
