// src/dag/mod.rs

//! Job graph model and status rules.
//!
//! - [`status`] is the state machine shared by jobs and work items.
//! - [`graph`] evaluates a snapshot of a build's jobs: eligibility, skips,
//!   aggregate status and a display view.
//! - [`decompose`] turns a build definition into job records.

pub mod decompose;
pub mod graph;
pub mod status;

pub use decompose::decompose;
pub use graph::{GraphView, JobGraph};
pub use status::{DisplayStatus, JobStatus, Outcome, WorkItemState};
