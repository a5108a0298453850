// src/exec/backend.rs

//! Pluggable job executor abstraction.
//!
//! The runner loop talks to a `JobExecutor` instead of spawning processes
//! itself. Production runners use [`crate::exec::ShellExecutor`]; tests
//! substitute a scripted executor that finishes instantly with a chosen
//! outcome.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::dag::Outcome;
use crate::log::LogKind;
use crate::store::Job;

/// What an executor reports when a job finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub outcome: Outcome,
    /// Failure reason, shown to users verbatim.
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded() -> Self {
        Self {
            outcome: Outcome::Succeeded,
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failed,
            error: Some(reason.into()),
        }
    }
}

impl From<Outcome> for ExecutionResult {
    fn from(outcome: Outcome) -> Self {
        Self {
            outcome,
            error: None,
        }
    }
}

/// One unnumbered log entry produced by an executor. The runner assigns
/// sequence numbers when it forwards entries to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub kind: LogKind,
    pub text: String,
}

/// Where an executor writes job output. Cheap to clone; the log stream
/// ends when every clone has been dropped.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl LogSink {
    pub fn new(tx: mpsc::UnboundedSender<LogEntry>) -> Self {
        Self { tx }
    }

    fn send(&self, kind: LogKind, text: String) {
        // The receiver only goes away when the job is being abandoned.
        let _ = self.tx.send(LogEntry { kind, text });
    }

    pub fn line(&self, text: impl Into<String>) {
        self.send(LogKind::Line, text.into());
    }

    pub fn error(&self, text: impl Into<String>) {
        self.send(LogKind::Error, text.into());
    }

    pub fn block(&self, name: impl Into<String>) {
        let name = name.into();
        self.send(LogKind::BlockStart { name: name.clone() }, name);
    }

    pub fn end_block(&self) {
        self.send(LogKind::BlockEnd, String::new());
    }
}

/// Trait abstracting how a leased job is executed.
///
/// Dropping the returned future must stop the job; runners drop it when
/// their lease is lost or the job's build is canceled.
pub trait JobExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        job: &'a Job,
        log: LogSink,
    ) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send + 'a>>;
}
