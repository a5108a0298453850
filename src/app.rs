// src/app.rs

//! Process-level wiring of the orchestration server.
//!
//! Start order: store, coordinator, reaper, core listener, runner listener,
//! internal runners. `stop` unwinds in roughly reverse order so that no new
//! work is handed out while in-flight jobs are drained.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::api::{CoreApi, Listener, RunnerApi};
use crate::config::ServerConfig;
use crate::engine::{Clock, Coordinator, Reaper, SystemClock};
use crate::errors::{CinderError, Result};
use crate::exec::{InternalRunnerManager, JobExecutor, ShellExecutor};
use crate::store::Store;

#[derive(Debug)]
pub struct App {
    coordinator: Arc<Coordinator>,
    reaper: Option<Reaper>,
    core_listener: Option<Listener>,
    runner_listener: Option<Listener>,
    internal_runners: InternalRunnerManager,
    shutdown_timeout: Duration,
}

impl App {
    /// Start a production server: wall clock and shell executor.
    pub async fn start(config: ServerConfig) -> Result<Self> {
        Self::start_with(config, Arc::new(SystemClock), Arc::new(ShellExecutor::new())).await
    }

    /// Start with an injected clock and executor. If any step fails, the
    /// parts already started are stopped before the error is returned.
    pub async fn start_with(
        config: ServerConfig,
        clock: Arc<dyn Clock>,
        executor: Arc<dyn JobExecutor>,
    ) -> Result<Self> {
        let store = Store::open(config.storage.backend, &config.storage.path)?;
        let coordinator = Arc::new(Coordinator::new(store, clock, config.queue));
        for (name, token) in &config.runners {
            coordinator.registry().allow(name, token, false)?;
        }

        let mut app = App {
            coordinator: coordinator.clone(),
            reaper: Some(Reaper::spawn(coordinator.clone(), config.queue.reclaim_interval)),
            core_listener: None,
            runner_listener: None,
            internal_runners: InternalRunnerManager::new(
                coordinator.clone(),
                executor,
                config.internal_runners,
            ),
            shutdown_timeout: config.server.shutdown_timeout,
        };

        if let Err(e) = app.start_surfaces(&config).await {
            error!(error = %e, "startup failed; stopping started components");
            if let Err(stop_err) = app.stop().await {
                error!(error = %stop_err, "cleanup after failed startup also failed");
            }
            return Err(e);
        }

        info!(
            core = ?app.core_addr(),
            runner = ?app.runner_addr(),
            internal_runners = app.internal_runners.running(),
            "cinder server started"
        );
        Ok(app)
    }

    async fn start_surfaces(&mut self, config: &ServerConfig) -> Result<()> {
        let core = Arc::new(CoreApi::new(self.coordinator.clone()));
        self.core_listener = Some(Listener::bind("core", &config.server.core_api_addr, core).await?);

        let runner = Arc::new(RunnerApi::new(self.coordinator.clone()));
        self.runner_listener =
            Some(Listener::bind("runner", &config.server.runner_api_addr, runner).await?);

        self.internal_runners.start()
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn core_addr(&self) -> Option<SocketAddr> {
        self.core_listener.as_ref().map(Listener::local_addr)
    }

    pub fn runner_addr(&self) -> Option<SocketAddr> {
        self.runner_listener.as_ref().map(Listener::local_addr)
    }

    /// Stop leasing, drain internal runners, close both listeners, stop the
    /// reaper. Every step runs even if an earlier one fails; the first error
    /// is returned and the rest are logged.
    pub async fn stop(mut self) -> Result<()> {
        self.coordinator.stop_leasing();

        let mut first: Option<CinderError> = None;
        let mut record = |step: &str, result: Result<()>| {
            if let Err(e) = result {
                error!(step, error = %e, "shutdown step failed");
                first.get_or_insert(e);
            }
        };

        record("internal runners", self.internal_runners.stop().await);

        if let Some(listener) = self.runner_listener.take() {
            record("runner listener", listener.stop(self.shutdown_timeout).await);
        }
        if let Some(listener) = self.core_listener.take() {
            record("core listener", listener.stop(self.shutdown_timeout).await);
        }
        if let Some(reaper) = self.reaper.take() {
            record("reaper", reaper.stop().await);
        }

        info!("cinder server stopped");
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
