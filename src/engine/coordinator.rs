// src/engine/coordinator.rs

//! Runner coordination: builds in, leases out, completions back.
//!
//! Every mutation goes through an optimistic [`ResourceTable::update`];
//! there is no global scheduling lock. Lost races are retried a bounded
//! number of times (`max_lock_retries`), and for leasing a lost race just
//! moves on to the next candidate item.
//!
//! Leases that expire are retried with exponential backoff until the job
//! has used `max_attempts` leases; after that, and for jobs running past
//! `job_timeout`, the job is failed with a reason.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::QueueSettings;
use crate::config::build::BuildDefinition;
use crate::dag::{decompose, GraphView, JobGraph, JobStatus, Outcome, WorkItemState};
use crate::engine::auth::{Credentials, RunnerRegistry, RunnerSession};
use crate::engine::clock::Clock;
use crate::errors::{CinderError, Result};
use crate::log::{group_blocks, LogBlock, LogDescriptor, LogLine, LogReader};
use crate::store::{Build, Job, Resource, ResourceTable, RunnerRecord, Store, WorkItem};
use crate::types::{BuildId, JobId, RunnerId, WorkItemId};

/// A leased work item, as handed to a runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub item_id: WorkItemId,
    pub job: Job,
    /// First `seq_no` the runner should write; continues a log left by a
    /// previous lease holder.
    pub next_seq: u64,
    /// 1 on the first lease, higher after reclamation.
    pub attempt: u32,
}

/// Build with its jobs and derived status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSnapshot {
    pub build: Build,
    /// Aggregate status; pending builds report `Running`.
    pub status: JobStatus,
    pub jobs: Vec<Job>,
}

#[derive(Debug)]
pub struct Coordinator {
    store: Store,
    registry: RunnerRegistry,
    clock: Arc<dyn Clock>,
    settings: QueueSettings,
    accepting: AtomicBool,
}

impl Coordinator {
    pub fn new(store: Store, clock: Arc<dyn Clock>, settings: QueueSettings) -> Self {
        Self {
            store,
            registry: RunnerRegistry::new(),
            clock,
            settings,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Stop granting new leases. Heartbeats, completions and log appends
    /// for existing leases are still accepted.
    pub fn stop_leasing(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("coordinator stopped granting leases");
        }
    }

    // ---------------------------------------------------------------------
    // Builds
    // ---------------------------------------------------------------------

    /// Admit a build. Cyclic or otherwise invalid definitions are rejected
    /// before anything is persisted.
    pub fn submit_build(&self, def: &BuildDefinition) -> Result<BuildId> {
        let now = self.clock.now();
        let build_id = BuildId::generate();
        let jobs = decompose(def, &build_id, now)?;

        let mut build = Build {
            id: build_id.clone(),
            name: def.name.clone(),
            submitted_at: now,
            error: None,
            version: 0,
        };
        self.store.builds.create(&mut build)?;
        for mut job in jobs {
            self.store.jobs.create(&mut job)?;
        }

        info!(build = %build_id, name = %def.name, jobs = def.job.len(), "build submitted");
        self.reevaluate(&build_id)?;
        Ok(build_id)
    }

    /// Cancel every unfinished job of a build and drop its work items.
    /// Racing with normal completion is harmless.
    pub fn cancel_build(&self, build_id: &BuildId) -> Result<JobStatus> {
        self.store.builds.read(build_id.as_str())?;
        let now = self.clock.now();

        for job in self.store.jobs.list_by_owner(build_id.as_str())? {
            if job.status.has_finished() {
                continue;
            }
            self.update_with_retry(&self.store.jobs, job.id.as_str(), |j| {
                if j.status.has_finished() {
                    return Ok(false);
                }
                j.status = j.status.transition(j.id.as_str(), JobStatus::Canceled)?;
                j.timings.finished_at = Some(now);
                Ok(true)
            })?;
            self.store.logs.seal(&job.id)?;
        }
        self.store.work_items.delete_for_build(build_id)?;

        info!(build = %build_id, "build canceled");
        self.reevaluate(build_id)
    }

    pub fn build_snapshot(&self, build_id: &BuildId) -> Result<BuildSnapshot> {
        let build = self.store.builds.read(build_id.as_str())?;
        let graph = self.graph(build_id)?;
        Ok(BuildSnapshot {
            build,
            status: graph.aggregate_status(),
            jobs: graph.jobs().to_vec(),
        })
    }

    pub fn build_graph_view(&self, build_id: &BuildId) -> Result<GraphView> {
        self.store.builds.read(build_id.as_str())?;
        Ok(self.graph(build_id)?.indirected_view())
    }

    /// Builds, newest first.
    pub fn list_builds(&self) -> Result<Vec<Build>> {
        let mut builds = self.store.builds.list()?;
        builds.sort_by(|a, b| {
            b.submitted_at
                .cmp(&a.submitted_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(builds)
    }

    /// Jobs of a build in scheduling order.
    pub fn list_jobs(&self, build_id: &BuildId) -> Result<Vec<Job>> {
        self.store.builds.read(build_id.as_str())?;
        Ok(self.graph(build_id)?.jobs().to_vec())
    }

    pub fn job(&self, job_id: &JobId) -> Result<Job> {
        self.store.jobs.read(job_id.as_str())
    }

    fn graph(&self, build_id: &BuildId) -> Result<JobGraph> {
        Ok(JobGraph::new(self.store.jobs.list_by_owner(build_id.as_str())?))
    }

    /// Apply the graph rules to a build's current snapshot: skip jobs behind
    /// failed dependencies, queue newly eligible jobs, and close the build
    /// once its aggregate status is terminal.
    pub fn reevaluate(&self, build_id: &BuildId) -> Result<JobStatus> {
        let now = self.clock.now();

        for job in self.graph(build_id)?.skippable() {
            self.update_with_retry(&self.store.jobs, job.id.as_str(), |j| {
                if !matches!(j.status, JobStatus::Submitted | JobStatus::Queued) {
                    return Ok(false);
                }
                j.status = j.status.transition(j.id.as_str(), JobStatus::Skipped)?;
                j.timings.finished_at = Some(now);
                Ok(true)
            })?;
            self.store.work_items.delete(&WorkItemId::for_job(&job.id))?;
            self.store.logs.seal(&job.id)?;
            info!(build = %build_id, job = %job.name, "job skipped after dependency failure");
        }

        let graph = self.graph(build_id)?;
        for job in graph.eligible() {
            if job.status != JobStatus::Submitted {
                continue;
            }
            // Queue the job before the item exists, so a poller can never
            // lease an item whose job is still Submitted.
            let current = self.update_with_retry(&self.store.jobs, job.id.as_str(), |j| {
                if j.status != JobStatus::Submitted {
                    return Ok(false);
                }
                j.status = j.status.transition(j.id.as_str(), JobStatus::Queued)?;
                j.timings.queued_at = Some(now);
                Ok(true)
            })?;
            // A stale snapshot: someone else queued the job and it has moved on.
            if current.status != JobStatus::Queued {
                continue;
            }

            let mut item =
                WorkItem::pending(job.id.clone(), build_id.clone(), job.submitted_at, job.index);
            match self.store.work_items.create(&mut item) {
                Ok(()) => debug!(build = %build_id, job = %job.name, item = %item.id, "work item created"),
                Err(CinderError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        // The aggregate can be Failed while other jobs still run; the build
        // closes only when every job has finished.
        let status = graph.aggregate_status();
        if graph.all_finished() {
            self.finish_build(build_id, &graph, status)?;
        }
        Ok(status)
    }

    fn finish_build(&self, build_id: &BuildId, graph: &JobGraph, status: JobStatus) -> Result<()> {
        self.store.work_items.delete_for_build(build_id)?;

        let failed = graph.failed_count();
        let summary = (failed > 0).then(|| format!("{failed} job(s) failed"));
        self.update_with_retry(&self.store.builds, build_id.as_str(), |b| {
            if b.error == summary {
                return Ok(false);
            }
            b.error = summary.clone();
            Ok(true)
        })?;

        info!(build = %build_id, status = %status, failed, "build finished");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Runners
    // ---------------------------------------------------------------------

    pub fn register_runner(&self, creds: &Credentials) -> Result<RunnerSession> {
        let internal = self.registry.verify(creds)?;
        let now = self.clock.now();
        let id = RunnerRecord::id_for(&creds.name);

        let mut record = RunnerRecord {
            id: id.clone(),
            name: creds.name.clone(),
            internal,
            registered_at: now,
            last_seen_at: now,
            version: 0,
        };
        match self.store.runners.create(&mut record) {
            Ok(()) => {}
            Err(CinderError::AlreadyExists { .. }) => {
                self.update_with_retry(&self.store.runners, id.as_str(), |r| {
                    r.internal = internal;
                    r.last_seen_at = now;
                    Ok(true)
                })?;
            }
            Err(e) => return Err(e),
        }

        let session = self.registry.open_session(&creds.name)?;
        info!(runner = %id, internal, "runner registered");
        Ok(session)
    }

    pub fn deregister_runner(&self, session: &RunnerSession) -> Result<()> {
        self.registry.authenticate(session)?;
        self.registry.close_session(session)
    }

    pub fn list_runners(&self) -> Result<Vec<RunnerRecord>> {
        self.store.runners.list()
    }

    fn touch_runner(&self, runner: &RunnerId, now: DateTime<Utc>) {
        let Ok(mut record) = self.store.runners.read(runner.as_str()) else {
            return;
        };
        record.last_seen_at = now;
        if let Err(e) = self.store.runners.update(&mut record) {
            debug!(runner = %runner, error = %e, "skipped last-seen update");
        }
    }

    /// Lease one eligible work item, or `None` when nothing can be leased.
    ///
    /// Candidates are pending items plus leased items whose heartbeat has
    /// expired, in submission order. An item is only leased if its job is in
    /// its build's eligible set.
    pub fn poll_for_work(&self, session: &RunnerSession) -> Result<Option<LeaseGrant>> {
        let runner = self.registry.authenticate(session)?;
        if !self.accepting.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let now = self.clock.now();
        self.touch_runner(&runner, now);

        let candidates = self.store.work_items.leasable(self.lease_deadline(now), now)?;
        let mut eligible: HashMap<BuildId, HashSet<JobId>> = HashMap::new();

        for item in candidates {
            if item.state != WorkItemState::Pending {
                // Expired lease: give up on the job, or wait out the backoff.
                if item.attempts >= self.settings.max_attempts {
                    let reason = self.exhausted_reason(&item);
                    self.fail_item(item, reason, now)?;
                    continue;
                }
                if self.retry_at(&item).is_some_and(|at| at > now) {
                    continue;
                }
            }
            if !eligible.contains_key(&item.build_id) {
                let ids: HashSet<JobId> = self
                    .graph(&item.build_id)?
                    .eligible()
                    .into_iter()
                    .map(|j| j.id.clone())
                    .collect();
                eligible.insert(item.build_id.clone(), ids);
            }
            if !eligible
                .get(&item.build_id)
                .is_some_and(|ids| ids.contains(&item.job_id))
            {
                continue;
            }

            match self.try_lease(item, &runner, now) {
                Ok(Some(grant)) => return Ok(Some(grant)),
                Ok(None) => {}
                // Another poller took the item; it is not coming back.
                Err(e) if e.is_lock_failure() || e.is_not_found() => {
                    debug!(runner = %runner, error = %e, "lost lease race; trying next item");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn try_lease(&self, mut item: WorkItem, runner: &RunnerId, now: DateTime<Utc>) -> Result<Option<LeaseGrant>> {
        let previous = item.state.lease_holder().cloned();
        item.state = WorkItemState::Leased {
            runner: runner.clone(),
            leased_at: now,
            heartbeat_at: now,
        };
        item.attempts += 1;
        item.not_before = None;
        self.store.work_items.update(&mut item)?;

        if let Some(previous) = previous {
            warn!(
                item = %item.id,
                previous = %previous,
                runner = %runner,
                "reassigned work item with expired lease"
            );
        }

        let job = self.update_with_retry(&self.store.jobs, item.job_id.as_str(), |j| {
            if j.status.has_finished() {
                return Ok(false);
            }
            j.status = j.status.transition(j.id.as_str(), JobStatus::Running)?;
            j.runner = Some(runner.clone());
            j.timings.started_at.get_or_insert(now);
            Ok(true)
        })?;

        if job.status.has_finished() {
            // Canceled between the eligibility check and the lease.
            self.store.work_items.delete(&item.id)?;
            return Ok(None);
        }

        let next_seq = self.store.logs.descriptor(&job.id)?.next_seq();
        info!(item = %item.id, job = %job.name, runner = %runner, attempt = item.attempts, "work item leased");
        Ok(Some(LeaseGrant {
            item_id: item.id,
            job,
            next_seq,
            attempt: item.attempts,
        }))
    }

    /// Read `item_id` and check that `runner` holds its lease.
    fn leased_item(&self, item_id: &WorkItemId, runner: &RunnerId) -> Result<WorkItem> {
        let item = self.store.work_items.read(item_id)?;
        if item.state.lease_holder() != Some(runner) {
            return Err(CinderError::LeaseNotOwned {
                item: item_id.to_string(),
                runner: runner.to_string(),
            });
        }
        Ok(item)
    }

    /// Extend a lease. A `NotFound` answer means the build was canceled or
    /// finished and the runner should abandon the job.
    pub fn heartbeat(&self, session: &RunnerSession, item_id: &WorkItemId) -> Result<()> {
        let runner = self.registry.authenticate(session)?;
        for _ in 0..self.settings.max_lock_retries {
            let mut item = self.leased_item(item_id, &runner)?;
            let now = self.clock.now();
            if let WorkItemState::Leased { heartbeat_at, .. } = &mut item.state {
                *heartbeat_at = now;
            }
            match self.store.work_items.update(&mut item) {
                Ok(()) => {
                    debug!(item = %item_id, runner = %runner, "heartbeat");
                    return Ok(());
                }
                Err(e) if e.is_lock_failure() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CinderError::lock_failed(WorkItem::KIND, item_id, 0))
    }

    /// Record the outcome of a leased job. `error` is stored verbatim on
    /// the job.
    pub fn report_completion(
        &self,
        session: &RunnerSession,
        item_id: &WorkItemId,
        outcome: Outcome,
        error: Option<String>,
    ) -> Result<JobStatus> {
        let runner = self.registry.authenticate(session)?;

        let mut attempts = 0;
        let item = loop {
            let mut item = self.leased_item(item_id, &runner)?;
            item.state = WorkItemState::Done { outcome };
            match self.store.work_items.update(&mut item) {
                Ok(()) => break item,
                Err(e) if e.is_lock_failure() && attempts + 1 < self.settings.max_lock_retries => {
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let now = self.clock.now();
        let target = outcome.job_status();
        let job = self.update_with_retry(&self.store.jobs, item.job_id.as_str(), |j| {
            if j.status.has_finished() {
                warn!(job = %j.id, status = %j.status, reported = %target, "ignoring outcome for finished job");
                return Ok(false);
            }
            j.status = j.status.transition(j.id.as_str(), target)?;
            j.error = error.clone();
            j.timings.finished_at = Some(now);
            Ok(true)
        })?;
        self.store.logs.seal(&job.id)?;

        info!(
            item = %item_id,
            job = %job.name,
            runner = %runner,
            status = %job.status,
            "job completed"
        );
        self.reevaluate(&item.build_id)?;
        Ok(job.status)
    }

    /// Return expired leases to the pending pool after their retry backoff,
    /// or fail the job once it has used `max_attempts` leases. Jobs stay
    /// `Running` while they wait; the next lease continues them.
    pub fn reclaim_expired_leases(&self) -> Result<usize> {
        let now = self.clock.now();
        let deadline = self.lease_deadline(now);
        let mut reclaimed = 0;

        for mut item in self.store.work_items.list()? {
            if !item.lease_expired(deadline) {
                continue;
            }
            if item.attempts >= self.settings.max_attempts {
                let reason = self.exhausted_reason(&item);
                if self.fail_item(item, reason, now)? {
                    reclaimed += 1;
                }
                continue;
            }

            let holder = item.state.lease_holder().cloned();
            item.not_before = self.retry_at(&item);
            item.state = WorkItemState::Pending;
            match self.store.work_items.update(&mut item) {
                Ok(()) => {
                    reclaimed += 1;
                    warn!(
                        item = %item.id,
                        runner = ?holder,
                        attempts = item.attempts,
                        not_before = ?item.not_before,
                        "reclaimed work item after heartbeat timeout"
                    );
                }
                Err(e) if e.is_lock_failure() || e.is_not_found() => {
                    debug!(item = %item.id, error = %e, "lease changed while reclaiming");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }

    /// Fail every running job whose first lease is older than
    /// `job_timeout`. A runner still executing one loses its lease.
    pub fn fail_timed_out_jobs(&self) -> Result<usize> {
        let now = self.clock.now();
        let timeout = chrono_duration(self.settings.job_timeout);
        let mut failed = 0;

        for item in self.store.work_items.list()? {
            if matches!(item.state, WorkItemState::Done { .. }) {
                continue;
            }
            let job = match self.store.jobs.read(item.job_id.as_str()) {
                Ok(job) => job,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let Some(started_at) = job.timings.started_at else {
                continue;
            };
            let timed_out = started_at
                .checked_add_signed(timeout)
                .is_some_and(|end| end <= now);
            if job.status != JobStatus::Running || !timed_out {
                continue;
            }

            let reason = format!("job timed out after {:?}", self.settings.job_timeout);
            if self.fail_item(item, reason, now)? {
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Close `item` as failed and fail its job with `reason`. Returns
    /// `false` if the item changed underneath us, e.g. because a runner
    /// just leased or completed it.
    fn fail_item(&self, mut item: WorkItem, reason: String, now: DateTime<Utc>) -> Result<bool> {
        item.state = WorkItemState::Done {
            outcome: Outcome::Failed,
        };
        match self.store.work_items.update(&mut item) {
            Ok(()) => {}
            Err(e) if e.is_lock_failure() || e.is_not_found() => {
                debug!(item = %item.id, error = %e, "item changed before it could be failed");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        let job = self.update_with_retry(&self.store.jobs, item.job_id.as_str(), |j| {
            if j.status.has_finished() {
                return Ok(false);
            }
            j.status = j.status.transition(j.id.as_str(), JobStatus::Failed)?;
            j.error = Some(reason.clone());
            j.timings.finished_at = Some(now);
            Ok(true)
        })?;
        self.store.logs.seal(&job.id)?;

        warn!(item = %item.id, job = %job.name, %reason, "job failed by the coordinator");
        self.reevaluate(&item.build_id)?;
        Ok(true)
    }

    fn exhausted_reason(&self, item: &WorkItem) -> String {
        format!(
            "job abandoned after {} attempt(s) without completing",
            item.attempts
        )
    }

    /// When an expired lease may be handed out again.
    fn retry_at(&self, item: &WorkItem) -> Option<DateTime<Utc>> {
        let delay = chrono_duration(self.settings.retry_delay(item.attempts));
        item.lease_expires_at(chrono_duration(self.settings.lease_timeout))?
            .checked_add_signed(delay)
    }

    fn lease_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(chrono_duration(self.settings.lease_timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    // ---------------------------------------------------------------------
    // Logs
    // ---------------------------------------------------------------------

    /// Append lines to the log of a leased job.
    pub fn append_log(
        &self,
        session: &RunnerSession,
        item_id: &WorkItemId,
        lines: &[LogLine],
    ) -> Result<LogDescriptor> {
        let runner = self.registry.authenticate(session)?;
        let item = self.leased_item(item_id, &runner)?;
        self.store.logs.append(&item.job_id, lines)
    }

    pub fn fetch_log_descriptor(&self, job_id: &JobId) -> Result<LogDescriptor> {
        self.store.jobs.read(job_id.as_str())?;
        self.store.logs.descriptor(job_id)
    }

    pub fn fetch_log_lines(&self, job_id: &JobId, after: u64, limit: Option<usize>) -> Result<Vec<LogLine>> {
        self.store.jobs.read(job_id.as_str())?;
        self.store.logs.lines_after(job_id, after, limit)
    }

    /// The whole log so far, grouped into blocks.
    pub fn fetch_log_blocks(&self, job_id: &JobId) -> Result<Vec<LogBlock>> {
        self.store.jobs.read(job_id.as_str())?;
        let lines = LogReader::new(0, 500, |after, limit| {
            self.store.logs.lines_after(job_id, after, Some(limit))
        })
        .collect::<Result<Vec<_>>>()?;
        Ok(group_blocks(&lines))
    }

    // ---------------------------------------------------------------------

    /// Read-modify-write with bounded retries on lock failure. `apply`
    /// returns `false` when no write is needed; the current record is
    /// returned either way.
    fn update_with_retry<R, F>(
        &self,
        table: &Arc<dyn ResourceTable<R>>,
        id: &str,
        mut apply: F,
    ) -> Result<R>
    where
        R: Resource,
        F: FnMut(&mut R) -> Result<bool>,
    {
        let mut last = None;
        for attempt in 0..self.settings.max_lock_retries {
            let mut record = table.read(id)?;
            if !apply(&mut record)? {
                return Ok(record);
            }
            match table.update(&mut record) {
                Ok(()) => return Ok(record),
                Err(e) if e.is_lock_failure() => {
                    debug!(kind = R::KIND, id = %id, attempt, "optimistic lock conflict; retrying");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        let err = last.unwrap_or_else(|| CinderError::lock_failed(R::KIND, id, 0));
        error!(kind = R::KIND, id = %id, "giving up after repeated lock conflicts");
        Err(err)
    }
}

fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
