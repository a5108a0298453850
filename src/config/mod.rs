// src/config/mod.rs

//! Configuration loading and validation.
//!
//! - [`model`] is the TOML-backed server configuration.
//! - [`loader`] reads it from disk.
//! - [`validate`] turns the raw form into a checked [`ServerConfig`].
//! - [`build`] is the build definition users submit.

pub mod build;
pub mod loader;
pub mod model;
pub mod validate;

pub use build::{load_build_definition, BuildDefinition, JobDefinition};
pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{
    InternalRunnerSettings, QueueSettings, RawServerConfig, ServerConfig, ServerSettings,
    StorageSection,
};
pub use validate::validate_server_config;
