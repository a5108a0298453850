// src/exec/runner.rs

//! The runner loop: register, poll, execute, report.
//!
//! A runner only ever talks to the coordinator through [`RunnerClient`], so
//! an in-process runner and a remote one follow identical rules and race
//! for work items on equal terms.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::dag::JobStatus;
use crate::engine::{Coordinator, Credentials, LeaseGrant, RunnerSession};
use crate::errors::{CinderError, Result};
use crate::exec::backend::{ExecutionResult, JobExecutor, LogEntry, LogSink};
use crate::log::{LogDescriptor, LogKind, LogLine};
use crate::types::WorkItemId;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const MAX_LOG_BATCH: usize = 256;

/// The runner side of the coordination protocol.
pub trait RunnerClient: Send + Sync {
    fn register<'a>(&'a self, creds: &'a Credentials) -> BoxFuture<'a, Result<RunnerSession>>;

    fn poll<'a>(&'a self, session: &'a RunnerSession) -> BoxFuture<'a, Result<Option<LeaseGrant>>>;

    fn heartbeat<'a>(
        &'a self,
        session: &'a RunnerSession,
        item: &'a WorkItemId,
    ) -> BoxFuture<'a, Result<()>>;

    fn append_log<'a>(
        &'a self,
        session: &'a RunnerSession,
        item: &'a WorkItemId,
        lines: Vec<LogLine>,
    ) -> BoxFuture<'a, Result<LogDescriptor>>;

    fn complete<'a>(
        &'a self,
        session: &'a RunnerSession,
        item: &'a WorkItemId,
        result: ExecutionResult,
    ) -> BoxFuture<'a, Result<JobStatus>>;

    /// End the session. Leases still held run out through heartbeat expiry.
    fn deregister<'a>(&'a self, session: &'a RunnerSession) -> BoxFuture<'a, Result<()>>;
}

/// Client for runners living in the server process. It calls the same
/// public coordinator operations the runner API exposes, on the blocking
/// pool like the network listener does.
#[derive(Debug, Clone)]
pub struct LocalRunnerClient {
    coordinator: Arc<Coordinator>,
}

impl LocalRunnerClient {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Coordinator) -> Result<T> + Send + 'static,
    {
        let coordinator = self.coordinator.clone();
        tokio::task::spawn_blocking(move || f(&coordinator))
            .await
            .map_err(|e| CinderError::Other(anyhow::anyhow!("coordinator call failed: {e}")))?
    }
}

impl RunnerClient for LocalRunnerClient {
    fn register<'a>(&'a self, creds: &'a Credentials) -> BoxFuture<'a, Result<RunnerSession>> {
        let creds = creds.clone();
        Box::pin(self.call(move |c| c.register_runner(&creds)))
    }

    fn poll<'a>(&'a self, session: &'a RunnerSession) -> BoxFuture<'a, Result<Option<LeaseGrant>>> {
        let session = session.clone();
        Box::pin(self.call(move |c| c.poll_for_work(&session)))
    }

    fn heartbeat<'a>(
        &'a self,
        session: &'a RunnerSession,
        item: &'a WorkItemId,
    ) -> BoxFuture<'a, Result<()>> {
        let (session, item) = (session.clone(), item.clone());
        Box::pin(self.call(move |c| c.heartbeat(&session, &item)))
    }

    fn append_log<'a>(
        &'a self,
        session: &'a RunnerSession,
        item: &'a WorkItemId,
        lines: Vec<LogLine>,
    ) -> BoxFuture<'a, Result<LogDescriptor>> {
        let (session, item) = (session.clone(), item.clone());
        Box::pin(self.call(move |c| c.append_log(&session, &item, &lines)))
    }

    fn complete<'a>(
        &'a self,
        session: &'a RunnerSession,
        item: &'a WorkItemId,
        result: ExecutionResult,
    ) -> BoxFuture<'a, Result<JobStatus>> {
        let (session, item) = (session.clone(), item.clone());
        Box::pin(self.call(move |c| {
            c.report_completion(&session, &item, result.outcome, result.error)
        }))
    }

    fn deregister<'a>(&'a self, session: &'a RunnerSession) -> BoxFuture<'a, Result<()>> {
        let session = session.clone();
        Box::pin(self.call(move |c| c.deregister_runner(&session)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunnerOptions {
    /// Pause between polls when no work is available.
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

pub struct Runner {
    creds: Credentials,
    client: Arc<dyn RunnerClient>,
    executor: Arc<dyn JobExecutor>,
    options: RunnerOptions,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("name", &self.creds.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// True for errors meaning "this lease is gone": the build was canceled
/// or finished, or the item was reclaimed and handed to someone else.
fn lease_lost(err: &CinderError) -> bool {
    matches!(
        err,
        CinderError::NotFound { .. } | CinderError::LeaseNotOwned { .. }
    )
}

impl Runner {
    pub fn new(
        creds: Credentials,
        client: Arc<dyn RunnerClient>,
        executor: Arc<dyn JobExecutor>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            creds,
            client,
            executor,
            options,
        }
    }

    /// Run until `shutdown` flips to `true`. A job already in progress is
    /// finished before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let session = self.client.register(&self.creds).await?;
        info!(runner = %session.runner_id, "runner started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.client.poll(&session).await {
                Ok(Some(grant)) => {
                    self.run_job(&session, grant).await;
                    false
                }
                Ok(None) => true,
                Err(CinderError::Unauthorized(msg)) => {
                    error!(runner = %session.runner_id, %msg, "runner session rejected; stopping");
                    return Err(CinderError::Unauthorized(msg));
                }
                Err(e) => {
                    warn!(runner = %session.runner_id, error = %e, "poll failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.client.deregister(&session).await {
            debug!(runner = %session.runner_id, error = %e, "deregister failed");
        }
        info!(runner = %session.runner_id, "runner stopped");
        Ok(())
    }

    /// Execute one leased job, heartbeating while it runs. If the lease is
    /// lost the executor future is dropped, which stops the job.
    async fn run_job(&self, session: &RunnerSession, grant: LeaseGrant) {
        let item = grant.item_id.clone();
        info!(
            runner = %session.runner_id,
            item = %item,
            job = %grant.job.name,
            attempt = grant.attempt,
            "executing job"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_logs(
            self.client.clone(),
            session.clone(),
            item.clone(),
            grant.next_seq,
            rx,
        ));

        let mut execution = self.executor.execute(&grant.job, LogSink::new(tx));

        let mut ticker = tokio::time::interval(self.options.heartbeat_interval);
        ticker.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut execution => break Some(result),
                _ = ticker.tick() => {
                    match self.client.heartbeat(session, &item).await {
                        Ok(()) => {}
                        Err(e) if lease_lost(&e) => {
                            warn!(item = %item, error = %e, "lease lost; abandoning job");
                            break None;
                        }
                        Err(e) => warn!(item = %item, error = %e, "heartbeat failed"),
                    }
                }
            }
        };
        // Dropping the execution closes the log sink and ends the pump.
        drop(execution);

        let (next_seq, gap) = match pump.await {
            Ok(position) => position,
            Err(e) => {
                error!(item = %item, error = %e, "log pump failed");
                return;
            }
        };

        let Some(result) = result else {
            return;
        };

        let mut closing = Vec::with_capacity(2);
        if gap {
            closing.push(LogLine::new(next_seq, LogKind::Discontinuity, "log lines lost"));
        }
        let end_seq = next_seq + closing.len() as u64;
        closing.push(LogLine::new(end_seq, LogKind::End, ""));
        if let Err(e) = self.client.append_log(session, &item, closing).await {
            debug!(item = %item, error = %e, "could not close log; completion will seal it");
        }

        let outcome = result.outcome;
        match self.client.complete(session, &item, result).await {
            Ok(status) => info!(item = %item, ?outcome, %status, "job reported"),
            Err(e) => warn!(item = %item, error = %e, "completion rejected"),
        }
    }
}

/// Number executor output and forward it in batches. Once the sink is
/// closed, returns the next free sequence number and whether the last batch
/// was lost. A failed append leaves a gap that the next batch opens with a
/// `Discontinuity` line.
async fn pump_logs(
    client: Arc<dyn RunnerClient>,
    session: RunnerSession,
    item: WorkItemId,
    mut next_seq: u64,
    mut rx: mpsc::UnboundedReceiver<LogEntry>,
) -> (u64, bool) {
    let mut gap = false;

    while let Some(first) = rx.recv().await {
        let mut entries = vec![first];
        while entries.len() < MAX_LOG_BATCH {
            match rx.try_recv() {
                Ok(entry) => entries.push(entry),
                Err(_) => break,
            }
        }

        let mut lines = Vec::with_capacity(entries.len() + 1);
        if gap {
            lines.push(LogLine::new(next_seq, LogKind::Discontinuity, "log lines lost"));
            next_seq += 1;
        }
        for entry in entries {
            lines.push(LogLine::new(next_seq, entry.kind, entry.text));
            next_seq += 1;
        }

        match client.append_log(&session, &item, lines).await {
            Ok(_) => gap = false,
            Err(e) => {
                warn!(item = %item, error = %e, "dropping log lines");
                gap = true;
            }
        }
    }

    (next_seq, gap)
}
