// src/engine/auth.rs

//! Runner credentials and sessions.
//!
//! Tokens are kept only as BLAKE3 digests; `blake3::Hash` equality is
//! constant-time. A successful registration opens a session whose token
//! must accompany every later runner call.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{CinderError, Result};
use crate::store::RunnerRecord;
use crate::types::RunnerId;

/// What a runner presents to register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub name: String,
    pub token: String,
}

/// Handle returned by registration and presented on every runner call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSession {
    pub runner_id: RunnerId,
    pub token: String,
}

#[derive(Debug, Clone)]
struct Registered {
    digest: blake3::Hash,
    internal: bool,
}

#[derive(Debug, Default)]
pub struct RunnerRegistry {
    runners: RwLock<HashMap<String, Registered>>,
    sessions: RwLock<HashMap<String, RunnerId>>,
}

fn poisoned() -> CinderError {
    CinderError::Other(anyhow!("runner registry lock poisoned"))
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` for runner `name`, replacing any previous token.
    pub fn allow(&self, name: &str, token: &str, internal: bool) -> Result<()> {
        let mut runners = self.runners.write().map_err(|_| poisoned())?;
        runners.insert(
            name.to_string(),
            Registered {
                digest: blake3::hash(token.as_bytes()),
                internal,
            },
        );
        debug!(runner = %name, internal, "runner credentials registered");
        Ok(())
    }

    /// Check credentials; returns whether the runner is internal.
    pub fn verify(&self, creds: &Credentials) -> Result<bool> {
        let runners = self.runners.read().map_err(|_| poisoned())?;
        let presented = blake3::hash(creds.token.as_bytes());
        match runners.get(&creds.name) {
            Some(reg) if reg.digest == presented => Ok(reg.internal),
            _ => {
                warn!(runner = %creds.name, "rejected runner credentials");
                Err(CinderError::Unauthorized(format!(
                    "invalid credentials for runner '{}'",
                    creds.name
                )))
            }
        }
    }

    pub fn open_session(&self, name: &str) -> Result<RunnerSession> {
        let session = RunnerSession {
            runner_id: RunnerRecord::id_for(name),
            token: uuid::Uuid::new_v4().to_string(),
        };
        let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
        sessions.insert(session.token.clone(), session.runner_id.clone());
        Ok(session)
    }

    /// Resolve a session to its runner, failing closed.
    pub fn authenticate(&self, session: &RunnerSession) -> Result<RunnerId> {
        let sessions = self.sessions.read().map_err(|_| poisoned())?;
        match sessions.get(&session.token) {
            Some(id) if *id == session.runner_id => Ok(id.clone()),
            _ => Err(CinderError::Unauthorized(format!(
                "unknown session for runner {}",
                session.runner_id
            ))),
        }
    }

    pub fn close_session(&self, session: &RunnerSession) -> Result<()> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
        sessions.remove(&session.token);
        Ok(())
    }

    pub fn is_allowed(&self, name: &str) -> Result<bool> {
        Ok(self.runners.read().map_err(|_| poisoned())?.contains_key(name))
    }

    /// Forget `name`'s token and close all of its sessions.
    pub fn revoke(&self, name: &str) -> Result<()> {
        self.runners.write().map_err(|_| poisoned())?.remove(name);
        let id = RunnerRecord::id_for(name);
        self.sessions
            .write()
            .map_err(|_| poisoned())?
            .retain(|_, owner| *owner != id);
        debug!(runner = %name, "runner credentials revoked");
        Ok(())
    }
}
