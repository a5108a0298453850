// src/log/mod.rs

//! Job log streams.
//!
//! A job's log is an append-only sequence of [`LogLine`]s numbered from 1.
//! Only the runner holding the job's lease may append, so there is a single
//! writer per job; any number of readers poll with "give me everything after
//! `seq_no` N".
//!
//! - [`store`] persists lines and enforces numbering and sealing.
//! - [`reader`] pages through a log lazily.
//! - [`blocks`] groups lines into named blocks for display.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::JobId;

pub mod blocks;
pub mod reader;
pub mod store;

pub use blocks::{group_blocks, LogBlock};
pub use reader::LogReader;
pub use store::{LogStore, MemoryLogStore, SqliteLogStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// Ordinary output line.
    Line,
    /// Output the runner flagged as an error (e.g. stderr).
    Error,
    /// Opens a named block; following lines are its children.
    BlockStart { name: String },
    BlockEnd,
    /// Marks an intentional gap in numbering, e.g. after output was dropped.
    Discontinuity,
    /// Closes the stream. Nothing may be appended afterwards.
    End,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub seq_no: u64,
    pub kind: LogKind,
    #[serde(default)]
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    pub fn new(seq_no: u64, kind: LogKind, text: impl Into<String>) -> Self {
        Self {
            seq_no,
            kind,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn line(seq_no: u64, text: impl Into<String>) -> Self {
        Self::new(seq_no, LogKind::Line, text)
    }
}

/// Extent and completion of a job's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogDescriptor {
    pub job_id: JobId,
    /// Highest `seq_no` written so far; 0 for an empty log.
    pub last_seq: u64,
    /// No more lines will be appended.
    pub sealed: bool,
}

impl LogDescriptor {
    pub fn empty(job_id: JobId) -> Self {
        Self {
            job_id,
            last_seq: 0,
            sealed: false,
        }
    }

    /// Next sequence number a writer should use.
    pub fn next_seq(&self) -> u64 {
        self.last_seq + 1
    }
}
