// src/engine/reaper.rs

//! Background lease reclamation and job timeouts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::engine::Coordinator;
use crate::errors::{CinderError, Result};

/// Handle to the running reaper task.
#[derive(Debug)]
pub struct Reaper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Reaper {
    /// Spawn a task that calls [`Coordinator::reclaim_expired_leases`] and
    /// [`Coordinator::fail_timed_out_jobs`] every `interval`.
    pub fn spawn(coordinator: Arc<Coordinator>, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            info!(?interval, "lease reaper started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let c = coordinator.clone();
                        let pass = tokio::task::spawn_blocking(move || {
                            Ok::<_, CinderError>((c.reclaim_expired_leases()?, c.fail_timed_out_jobs()?))
                        })
                        .await;
                        match pass {
                            Ok(Ok((0, 0))) => {}
                            Ok(Ok((reclaimed, timed_out))) => {
                                debug!(reclaimed, timed_out, "reaper pass complete")
                            }
                            Ok(Err(e)) => error!(error = %e, "reaper pass failed"),
                            Err(e) => error!(error = %e, "reaper task panicked"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("lease reaper stopped");
        });

        Self { shutdown, handle }
    }

    /// Signal the loop to exit and wait for it.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.handle
            .await
            .map_err(|e| CinderError::Other(anyhow::anyhow!("reaper task failed: {e}")))
    }
}
