// src/store/memory.rs

//! In-memory [`ResourceTable`] guarded by a single `RwLock`.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::anyhow;

use crate::errors::{CinderError, Result};
use crate::store::{Resource, ResourceTable};

#[derive(Debug)]
pub struct MemoryTable<R: Resource> {
    rows: RwLock<BTreeMap<String, R>>,
}

impl<R: Resource> MemoryTable<R> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<R: Resource> Default for MemoryTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> CinderError {
    CinderError::Other(anyhow!("memory table lock poisoned"))
}

impl<R: Resource> ResourceTable<R> for MemoryTable<R> {
    fn create(&self, item: &mut R) -> Result<()> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        if rows.contains_key(item.id()) {
            return Err(CinderError::already_exists(R::KIND, item.id()));
        }
        item.set_version(0);
        rows.insert(item.id().to_string(), item.clone());
        Ok(())
    }

    fn read(&self, id: &str) -> Result<R> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        rows.get(id)
            .cloned()
            .ok_or_else(|| CinderError::not_found(R::KIND, id))
    }

    fn update(&self, item: &mut R) -> Result<()> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        let stored = rows
            .get_mut(item.id())
            .ok_or_else(|| CinderError::not_found(R::KIND, item.id()))?;

        if stored.version() != item.version() {
            return Err(CinderError::lock_failed(R::KIND, item.id(), item.version()));
        }

        item.set_version(item.version() + 1);
        *stored = item.clone();
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        rows.remove(id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<R>> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.values().cloned().collect())
    }

    fn list_by_owner(&self, owner: &str) -> Result<Vec<R>> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows
            .values()
            .filter(|r| r.owner() == Some(owner))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Widget {
        pub id: String,
        pub owner: String,
        pub colour: String,
        pub version: u64,
    }

    impl Widget {
        pub fn new(id: &str, owner: &str, colour: &str) -> Self {
            Self {
                id: id.into(),
                owner: owner.into(),
                colour: colour.into(),
                version: 42,
            }
        }
    }

    impl Resource for Widget {
        const KIND: &'static str = "widget";
        const TABLE: &'static str = "widgets";

        fn id(&self) -> &str {
            &self.id
        }

        fn owner(&self) -> Option<&str> {
            Some(&self.owner)
        }

        fn version(&self) -> u64 {
            self.version
        }

        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
    }

    /// Contract shared by every backend.
    pub(crate) fn exercise_table(table: &dyn ResourceTable<Widget>) {
        let mut w = Widget::new("w1", "o1", "red");
        table.create(&mut w).unwrap();
        assert_eq!(w.version, 0);

        let mut dup = Widget::new("w1", "o1", "blue");
        assert!(matches!(
            table.create(&mut dup),
            Err(CinderError::AlreadyExists { .. })
        ));

        let mut a = table.read("w1").unwrap();
        let mut b = table.read("w1").unwrap();
        a.colour = "green".into();
        b.colour = "yellow".into();
        table.update(&mut a).unwrap();
        assert_eq!(a.version, 1);
        assert!(table.update(&mut b).unwrap_err().is_lock_failure());
        assert_eq!(table.read("w1").unwrap().colour, "green");

        let mut other = Widget::new("w2", "o2", "red");
        table.create(&mut other).unwrap();
        let owned: Vec<_> = table
            .list_by_owner("o1")
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(owned, vec!["w1".to_string()]);
        assert_eq!(table.list().unwrap().len(), 2);

        table.delete("w1").unwrap();
        table.delete("w1").unwrap();
        assert!(table.read("w1").unwrap_err().is_not_found());

        let mut ghost = Widget::new("ghost", "o1", "grey");
        ghost.version = 0;
        assert!(table.update(&mut ghost).unwrap_err().is_not_found());
    }

    #[test]
    fn memory_table_honours_the_contract() {
        exercise_table(&MemoryTable::<Widget>::new());
    }

    #[test]
    fn concurrent_updates_on_one_version_have_a_single_winner() {
        use std::sync::Arc;

        let table = Arc::new(MemoryTable::<Widget>::new());
        let mut w = Widget::new("w", "o", "red");
        table.create(&mut w).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = table.clone();
                let mut snapshot = w.clone();
                std::thread::spawn(move || {
                    snapshot.colour = format!("c{i}");
                    table.update(&mut snapshot)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| e.is_lock_failure()));
    }
}
