// src/engine/mod.rs

//! Runner coordination.
//!
//! [`Coordinator`] owns the scheduling rules: it admits builds, leases work
//! items to runners, accepts heartbeats, completions and log lines, and
//! re-evaluates the build's job graph after every transition. Its methods
//! are synchronous and safe to call from many tasks at once; the only
//! concurrency control is the store's optimistic locking.
//!
//! - [`auth`] verifies runner credentials and tracks sessions.
//! - [`clock`] abstracts time for lease expiry.
//! - [`reaper`] reclaims expired leases in the background.

pub mod auth;
pub mod clock;
pub mod coordinator;
pub mod reaper;

pub use auth::{Credentials, RunnerRegistry, RunnerSession};
pub use clock::{Clock, SystemClock};
pub use coordinator::{BuildSnapshot, Coordinator, LeaseGrant};
pub use reaper::Reaper;
