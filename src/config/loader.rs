// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::model::{RawServerConfig, ServerConfig};
use crate::errors::Result;

/// Read `path` as TOML without semantic validation.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawServerConfig> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawServerConfig = toml::from_str(&contents)?;

    Ok(config)
}

/// Load and validate the server configuration.
///
/// A missing file at the default location is not an error: the server then
/// runs with built-in defaults (in-memory storage, one internal runner).
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ServerConfig> {
    let path = path.as_ref();
    let raw = if !path.exists() && path == default_config_path() {
        info!(path = %path.display(), "no config file found; using defaults");
        RawServerConfig::default()
    } else {
        load_from_path(path)?
    };
    ServerConfig::try_from(raw)
}

/// `Cinder.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Cinder.toml")
}
