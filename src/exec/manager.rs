// src/exec/manager.rs

//! Supervision of runners living inside the server process.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::InternalRunnerSettings;
use crate::engine::{Coordinator, Credentials};
use crate::errors::Result;
use crate::exec::backend::JobExecutor;
use crate::exec::runner::{LocalRunnerClient, Runner, RunnerOptions};

struct Pool {
    shutdown: watch::Sender<bool>,
    handles: Vec<(String, JoinHandle<Result<()>>)>,
}

/// Starts `count` internal runners as ordinary coordinator clients and
/// stops them with a bounded grace period.
pub struct InternalRunnerManager {
    coordinator: Arc<Coordinator>,
    executor: Arc<dyn JobExecutor>,
    settings: InternalRunnerSettings,
    pool: Option<Pool>,
}

impl std::fmt::Debug for InternalRunnerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalRunnerManager")
            .field("settings", &self.settings)
            .field("running", &self.running())
            .finish_non_exhaustive()
    }
}

impl InternalRunnerManager {
    pub fn new(
        coordinator: Arc<Coordinator>,
        executor: Arc<dyn JobExecutor>,
        settings: InternalRunnerSettings,
    ) -> Self {
        Self {
            coordinator,
            executor,
            settings,
            pool: None,
        }
    }

    /// Number of runners currently supervised.
    pub fn running(&self) -> usize {
        self.pool.as_ref().map(|p| p.handles.len()).unwrap_or(0)
    }

    /// Launch the runners. Each gets a fresh one-off token, registered with
    /// the coordinator as an internal runner. Calling `start` twice is a
    /// no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.pool.is_some() {
            return Ok(());
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let options = RunnerOptions {
            poll_interval: self.settings.poll_interval,
            heartbeat_interval: self.settings.heartbeat_interval,
        };
        let client = Arc::new(LocalRunnerClient::new(self.coordinator.clone()));

        let mut handles = Vec::with_capacity(self.settings.count);
        for i in 0..self.settings.count {
            let name = format!("internal-{i}");
            let token = uuid::Uuid::new_v4().to_string();
            self.coordinator.registry().allow(&name, &token, true)?;

            let runner = Runner::new(
                Credentials {
                    name: name.clone(),
                    token,
                },
                client.clone(),
                self.executor.clone(),
                options,
            );
            let handle = tokio::spawn(runner.run(shutdown_rx.clone()));
            handles.push((name, handle));
        }

        info!(count = self.settings.count, "internal runners started");
        self.pool = Some(Pool { shutdown, handles });
        Ok(())
    }

    /// Ask every runner to stop after its current job, wait up to the grace
    /// period, then abort the stragglers. Aborted jobs keep their leases
    /// until the heartbeat timeout returns them to the queue. The one-off
    /// tokens handed out by `start` are revoked.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(pool) = self.pool.take() else {
            return Ok(());
        };

        let _ = pool.shutdown.send(true);
        let deadline = tokio::time::Instant::now() + self.settings.grace_period;

        for (name, mut handle) in pool.handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(runner = %name, error = %e, "internal runner exited with error"),
                Ok(Err(e)) => error!(runner = %name, error = %e, "internal runner panicked"),
                Err(_) => {
                    warn!(runner = %name, "grace period elapsed; aborting internal runner");
                    handle.abort();
                }
            }
            self.coordinator.registry().revoke(&name)?;
        }

        info!("internal runners stopped");
        Ok(())
    }
}
