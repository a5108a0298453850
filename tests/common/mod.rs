#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cinder::config::QueueSettings;
use cinder::dag::{JobStatus, Outcome};
use cinder::engine::{Clock, Coordinator, Credentials, LeaseGrant, RunnerSession};
use cinder::store::Store;
use cinder::types::BuildId;

pub use cinder_test_utils::{init_tracing, with_timeout};

pub const LEASE_TIMEOUT: Duration = Duration::from_secs(30);

pub fn queue_settings() -> QueueSettings {
    QueueSettings {
        lease_timeout: LEASE_TIMEOUT,
        ..QueueSettings::default()
    }
}

/// Coordinator over a fresh in-memory store.
pub fn coordinator(clock: Arc<dyn Clock>) -> Arc<Coordinator> {
    coordinator_with(clock, queue_settings())
}

pub fn coordinator_with(clock: Arc<dyn Clock>, settings: QueueSettings) -> Arc<Coordinator> {
    init_tracing();
    Arc::new(Coordinator::new(Store::memory(), clock, settings))
}

/// Allow `name` and register it, returning its session.
pub fn runner(c: &Coordinator, name: &str) -> RunnerSession {
    let token = format!("{name}-token");
    c.registry().allow(name, &token, false).unwrap();
    c.register_runner(&Credentials {
        name: name.to_string(),
        token,
    })
    .unwrap()
}

pub fn complete(c: &Coordinator, session: &RunnerSession, grant: &LeaseGrant, outcome: Outcome) -> JobStatus {
    c.report_completion(session, &grant.item_id, outcome, None).unwrap()
}

/// Job name → status for one build.
pub fn statuses(c: &Coordinator, build: &BuildId) -> BTreeMap<String, JobStatus> {
    c.list_jobs(build)
        .unwrap()
        .into_iter()
        .map(|j| (j.name, j.status))
        .collect()
}

/// Poll and succeed jobs until nothing is leasable. Returns job names in
/// the order they were leased.
pub fn drain(c: &Coordinator, session: &RunnerSession) -> Vec<String> {
    let mut order = Vec::new();
    while let Some(grant) = c.poll_for_work(session).unwrap() {
        order.push(grant.job.name.clone());
        complete(c, session, &grant, Outcome::Succeeded);
    }
    order
}
