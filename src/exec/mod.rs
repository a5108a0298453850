// src/exec/mod.rs

//! Job execution on the runner side.
//!
//! - [`backend`] provides the `JobExecutor` trait, the log sink executors
//!   write to, and the execution result.
//! - [`shell`] is the production executor that runs job commands.
//! - [`runner`] is the register/poll/execute/report loop plus the
//!   `RunnerClient` abstraction over the coordinator.
//! - [`manager`] supervises runners embedded in the server process.

pub mod backend;
pub mod manager;
pub mod runner;
pub mod shell;

pub use backend::{ExecutionResult, JobExecutor, LogEntry, LogSink};
pub use manager::InternalRunnerManager;
pub use runner::{LocalRunnerClient, Runner, RunnerClient, RunnerOptions};
pub use shell::ShellExecutor;
