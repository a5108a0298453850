// src/api/protocol.rs

//! Wire format shared by both listeners.
//!
//! Each connection carries newline-delimited JSON: one request object per
//! line, answered by one reply line. Requests are tagged by `op`:
//!
//! ```json
//! {"op":"poll","session":{"runner_id":"runner-a","token":"..."}}
//! ```
//!
//! Replies are either `{"ok": <value>}` or
//! `{"error": {"code": "lease_not_owned", "message": "..."}}`.

use serde::{Deserialize, Serialize};

use crate::config::build::BuildDefinition;
use crate::dag::Outcome;
use crate::engine::{Credentials, RunnerSession};
use crate::errors::{CinderError, Result};
use crate::log::LogLine;
use crate::types::{BuildId, JobId, WorkItemId};

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 500;

/// Requests accepted by the core (user-facing) listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CoreRequest {
    SubmitBuild {
        definition: BuildDefinition,
    },
    CancelBuild {
        build_id: BuildId,
    },
    GetBuild {
        build_id: BuildId,
    },
    GetGraph {
        build_id: BuildId,
    },
    ListBuilds {
        #[serde(default)]
        page: PageRequest,
    },
    ListJobs {
        build_id: BuildId,
        #[serde(default)]
        page: PageRequest,
    },
    ListRunners {
        #[serde(default)]
        page: PageRequest,
    },
    GetJob {
        job_id: JobId,
    },
    LogDescriptor {
        job_id: JobId,
    },
    LogLines {
        job_id: JobId,
        #[serde(default)]
        after: u64,
        #[serde(default)]
        limit: Option<usize>,
    },
    LogBlocks {
        job_id: JobId,
    },
}

/// Requests accepted by the runner listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RunnerRequest {
    Register {
        credentials: Credentials,
    },
    Poll {
        session: RunnerSession,
    },
    Heartbeat {
        session: RunnerSession,
        item_id: WorkItemId,
    },
    AppendLog {
        session: RunnerSession,
        item_id: WorkItemId,
        lines: Vec<LogLine>,
    },
    Complete {
        session: RunnerSession,
        item_id: WorkItemId,
        outcome: Outcome,
        #[serde(default)]
        error: Option<String>,
    },
    Deregister {
        session: RunnerSession,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(serde_json::Value),
    Error(WireError),
}

impl Reply {
    pub fn from_result(result: Result<serde_json::Value>) -> Self {
        match result {
            Ok(value) => Reply::Ok(value),
            Err(e) => Reply::Error(WireError {
                code: e.code().to_string(),
                message: e.to_string(),
            }),
        }
    }

    pub fn into_result(self) -> Result<serde_json::Value> {
        match self {
            Reply::Ok(value) => Ok(value),
            Reply::Error(e) => Err(CinderError::from_wire(&e.code, e.message)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub limit: Option<usize>,
    /// A `prev_url`/`next_url` value from an earlier page.
    #[serde(default)]
    pub cursor: Option<String>,
}

/// One page of a listing. An empty `prev_url`/`next_url` means there is no
/// such page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub prev_url: String,
    pub next_url: String,
}

impl<T> Page<T> {
    pub fn has_next(&self) -> bool {
        !self.next_url.is_empty()
    }
}

fn cursor_offset(cursor: &str) -> Result<usize> {
    let raw = match cursor.split_once("cursor=") {
        Some((_, rest)) => rest.split('&').next().unwrap_or(""),
        None => cursor,
    };
    raw.parse()
        .map_err(|_| CinderError::InvalidRequest(format!("invalid page cursor '{cursor}'")))
}

fn page_url(base: &str, offset: usize, limit: usize) -> String {
    format!("{base}?cursor={offset}&limit={limit}")
}

/// Cut one page out of `items`. `base` names the listing in the cursor
/// URLs, e.g. `builds` or `builds/<id>/jobs`.
pub fn paginate<T: Clone>(items: &[T], req: &PageRequest, base: &str) -> Result<Page<T>> {
    let limit = req.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
    let offset = match req.cursor.as_deref() {
        None | Some("") => 0,
        Some(c) => cursor_offset(c)?,
    };
    let start = offset.min(items.len());
    let end = (start + limit).min(items.len());

    let prev_url = if start == 0 {
        String::new()
    } else {
        page_url(base, start.saturating_sub(limit), limit)
    };
    let next_url = if end < items.len() {
        page_url(base, end, limit)
    } else {
        String::new()
    };

    Ok(Page {
        items: items[start..end].to_vec(),
        prev_url,
        next_url,
    })
}
