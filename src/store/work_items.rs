// src/store/work_items.rs

//! Leasable work items.
//!
//! A work item exists from the moment its job becomes eligible until the
//! owning build terminates. Leasing is an optimistic [`ResourceTable::update`]
//! conditioned on the version the poller read, so concurrent pollers race
//! safely without a global lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dag::WorkItemState;
use crate::errors::Result;
use crate::store::{Resource, ResourceTable};
use crate::types::{BuildId, JobId, WorkItemId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    /// The job this item executes.
    pub job_id: JobId,
    pub build_id: BuildId,
    pub submitted_at: DateTime<Utc>,
    pub index: u32,
    pub state: WorkItemState,
    /// Number of times the item has been leased.
    #[serde(default)]
    pub attempts: u32,
    /// A reclaimed item waits out its retry backoff before it can be leased.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl WorkItem {
    pub fn pending(job_id: JobId, build_id: BuildId, submitted_at: DateTime<Utc>, index: u32) -> Self {
        Self {
            id: WorkItemId::for_job(&job_id),
            job_id,
            build_id,
            submitted_at,
            index,
            state: WorkItemState::Pending,
            attempts: 0,
            not_before: None,
            version: 0,
        }
    }

    pub fn sort_key(&self) -> (DateTime<Utc>, u32, &str) {
        (self.submitted_at, self.index, self.id.as_str())
    }

    /// True when the item is leased and its last heartbeat is older than
    /// `deadline`.
    pub fn lease_expired(&self, deadline: DateTime<Utc>) -> bool {
        matches!(&self.state, WorkItemState::Leased { heartbeat_at, .. } if *heartbeat_at < deadline)
    }

    /// When a lease without further heartbeats runs out.
    pub fn lease_expires_at(&self, lease_timeout: chrono::Duration) -> Option<DateTime<Utc>> {
        match &self.state {
            WorkItemState::Leased { heartbeat_at, .. } => heartbeat_at.checked_add_signed(lease_timeout),
            _ => None,
        }
    }

    fn ready(&self, now: DateTime<Utc>) -> bool {
        self.state == WorkItemState::Pending && self.not_before.is_none_or(|t| t <= now)
    }
}

impl Resource for WorkItem {
    const KIND: &'static str = "work item";
    const TABLE: &'static str = "work_items";

    fn id(&self) -> &str {
        self.id.as_str()
    }

    fn owner(&self) -> Option<&str> {
        Some(self.build_id.as_str())
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Typed view over the work item table.
#[derive(Clone)]
pub struct WorkItemStore {
    table: Arc<dyn ResourceTable<WorkItem>>,
}

impl WorkItemStore {
    pub fn new(table: Arc<dyn ResourceTable<WorkItem>>) -> Self {
        Self { table }
    }

    pub fn create(&self, item: &mut WorkItem) -> Result<()> {
        self.table.create(item)
    }

    pub fn read(&self, id: &WorkItemId) -> Result<WorkItem> {
        self.table.read(id.as_str())
    }

    pub fn update(&self, item: &mut WorkItem) -> Result<()> {
        self.table.update(item)
    }

    pub fn delete(&self, id: &WorkItemId) -> Result<()> {
        self.table.delete(id.as_str())
    }

    /// All items in scheduling order.
    pub fn list(&self) -> Result<Vec<WorkItem>> {
        let mut items = self.table.list()?;
        items.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Ok(items)
    }

    /// Items that a poller may try to lease at `now`: pending ones past
    /// their backoff, plus leased ones whose heartbeat is older than
    /// `deadline`. Scheduling order.
    pub fn leasable(&self, deadline: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<WorkItem>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|item| item.ready(now) || item.lease_expired(deadline))
            .collect())
    }

    /// Remove every item of a build. Safe to race with other cleanup paths.
    pub fn delete_for_build(&self, build: &BuildId) -> Result<usize> {
        let items = self.table.list_by_owner(build.as_str())?;
        for item in &items {
            self.table.delete(item.id.as_str())?;
        }
        debug!(build = %build, count = items.len(), "deleted work items for build");
        Ok(items.len())
    }
}

impl std::fmt::Debug for WorkItemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItemStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::dag::Outcome;
    use crate::store::MemoryTable;
    use crate::types::RunnerId;

    fn store() -> WorkItemStore {
        WorkItemStore::new(Arc::new(MemoryTable::<WorkItem>::new()))
    }

    #[test]
    fn leasable_items_follow_submission_order_then_index() {
        let store = store();
        let t0 = Utc::now();
        let b1 = BuildId::from("b1");
        let b2 = BuildId::from("b2");

        store
            .create(&mut WorkItem::pending("z".into(), b2.clone(), t0 + Duration::seconds(1), 0))
            .unwrap();
        store.create(&mut WorkItem::pending("y".into(), b1.clone(), t0, 1)).unwrap();
        store.create(&mut WorkItem::pending("x".into(), b1.clone(), t0, 0)).unwrap();

        let order: Vec<_> = store
            .leasable(t0, t0 + Duration::seconds(1))
            .unwrap()
            .into_iter()
            .map(|i| i.job_id.to_string())
            .collect();
        assert_eq!(order, vec!["x", "y", "z"]);
    }

    #[test]
    fn leased_items_are_leasable_only_after_heartbeat_expiry() {
        let store = store();
        let now = Utc::now();
        let mut item = WorkItem::pending("j".into(), "b".into(), now, 0);
        store.create(&mut item).unwrap();

        item.state = WorkItemState::Leased {
            runner: RunnerId::from("r"),
            leased_at: now,
            heartbeat_at: now,
        };
        store.update(&mut item).unwrap();

        assert!(store.leasable(now - Duration::seconds(10), now).unwrap().is_empty());
        assert_eq!(store.leasable(now + Duration::seconds(1), now).unwrap().len(), 1);

        item.state = WorkItemState::Done {
            outcome: Outcome::Succeeded,
        };
        store.update(&mut item).unwrap();
        assert!(store.leasable(now + Duration::seconds(1), now).unwrap().is_empty());
    }

    #[test]
    fn backed_off_items_wait_for_their_retry_time() {
        let store = store();
        let now = Utc::now();
        let mut item = WorkItem::pending("j".into(), "b".into(), now, 0);
        item.not_before = Some(now + Duration::seconds(5));
        store.create(&mut item).unwrap();

        assert!(store.leasable(now, now).unwrap().is_empty());
        assert_eq!(store.leasable(now, now + Duration::seconds(5)).unwrap().len(), 1);
    }

    #[test]
    fn deleting_a_build_twice_is_harmless() {
        let store = store();
        let build = BuildId::from("b");
        store.create(&mut WorkItem::pending("a".into(), build.clone(), Utc::now(), 0)).unwrap();
        store.create(&mut WorkItem::pending("c".into(), build.clone(), Utc::now(), 1)).unwrap();

        assert_eq!(store.delete_for_build(&build).unwrap(), 2);
        assert_eq!(store.delete_for_build(&build).unwrap(), 0);
        store.delete(&WorkItemId::for_job(&"a".into())).unwrap();
    }
}
