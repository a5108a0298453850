// src/store/mod.rs

//! Durable storage for the orchestration engine.
//!
//! - [`ResourceTable`] is the generic versioned-resource capability: create,
//!   read, optimistic update, idempotent delete. It is implemented once per
//!   backend ([`memory`], [`sqlite`]) and reused for every resource kind.
//! - [`records`] defines the persisted builds, jobs and runners.
//! - [`work_items`] defines the leasable work item and its typed store.
//! - [`Store`] bundles one table per kind plus the log line store.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::Result;
use crate::log::store::{LogStore, MemoryLogStore, SqliteLogStore};
use crate::types::StorageBackend;

pub mod memory;
pub mod records;
pub mod sqlite;
pub mod work_items;

pub use memory::MemoryTable;
pub use records::{Build, Job, JobTimings, RunnerRecord};
pub use sqlite::SqliteTable;
pub use work_items::{WorkItem, WorkItemStore};

/// A persisted record with an identifier and an optimistic-lock version.
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Human-readable kind, used in error messages.
    const KIND: &'static str;
    /// Table name for SQL backends.
    const TABLE: &'static str;

    fn id(&self) -> &str;

    /// Owning resource (e.g. the build of a job); used for grouped listing.
    fn owner(&self) -> Option<&str> {
        None
    }

    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
}

/// Versioned resource table.
///
/// Invariant: for any observed version, at most one `update` succeeds. A
/// stale version yields `OptimisticLockFailed` instead of overwriting.
pub trait ResourceTable<R: Resource>: Send + Sync {
    /// Insert a new record with version 0. `AlreadyExists` on duplicate id.
    fn create(&self, item: &mut R) -> Result<()>;

    /// Current snapshot, or `NotFound`.
    fn read(&self, id: &str) -> Result<R>;

    /// Replace the record if its stored version equals `item.version()`.
    /// On success `item` carries the incremented version.
    fn update(&self, item: &mut R) -> Result<()>;

    /// Remove the record. Deleting an absent id succeeds.
    fn delete(&self, id: &str) -> Result<()>;

    /// All records, ordered by id.
    fn list(&self) -> Result<Vec<R>>;

    /// Records owned by `owner`, ordered by id.
    fn list_by_owner(&self, owner: &str) -> Result<Vec<R>>;
}

pub type Table<R> = Arc<dyn ResourceTable<R>>;

/// All tables used by the engine.
#[derive(Clone)]
pub struct Store {
    pub builds: Table<Build>,
    pub jobs: Table<Job>,
    pub runners: Table<RunnerRecord>,
    pub work_items: WorkItemStore,
    pub logs: Arc<dyn LogStore>,
}

impl Store {
    /// Fresh in-memory store.
    pub fn memory() -> Self {
        Self {
            builds: Arc::new(MemoryTable::<Build>::new()),
            jobs: Arc::new(MemoryTable::<Job>::new()),
            runners: Arc::new(MemoryTable::<RunnerRecord>::new()),
            work_items: WorkItemStore::new(Arc::new(MemoryTable::<WorkItem>::new())),
            logs: Arc::new(MemoryLogStore::new()),
        }
    }

    /// Open (or create) a SQLite-backed store at `path`.
    pub fn sqlite(path: &str) -> Result<Self> {
        let conn = Arc::new(Mutex::new(sqlite::open_connection(path)?));
        Ok(Self {
            builds: Arc::new(SqliteTable::<Build>::new(conn.clone())?),
            jobs: Arc::new(SqliteTable::<Job>::new(conn.clone())?),
            runners: Arc::new(SqliteTable::<RunnerRecord>::new(conn.clone())?),
            work_items: WorkItemStore::new(Arc::new(SqliteTable::<WorkItem>::new(conn.clone())?)),
            logs: Arc::new(SqliteLogStore::new(conn)?),
        })
    }

    pub fn open(backend: StorageBackend, path: &str) -> Result<Self> {
        match backend {
            StorageBackend::Memory => Ok(Self::memory()),
            StorageBackend::Sqlite => Self::sqlite(path),
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}
