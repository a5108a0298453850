// src/api/mod.rs

//! Network surfaces.
//!
//! Two independently stoppable listeners share one wire format
//! ([`protocol`]): the core API for users and the runner API for external
//! runners. [`client`] holds the matching clients.

pub mod client;
pub mod core;
pub mod protocol;
pub mod runner;
pub mod server;

pub use client::{Connection, CoreClient, RemoteRunnerClient};
pub use self::core::CoreApi;
pub use protocol::{CoreRequest, Page, PageRequest, Reply, RunnerRequest, WireError};
pub use runner::RunnerApi;
pub use server::{Handler, Listener};
