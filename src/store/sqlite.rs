// src/store/sqlite.rs

//! SQLite-backed [`ResourceTable`].
//!
//! Each resource kind gets its own table:
//!
//! ```sql
//! CREATE TABLE <kind> (id TEXT PRIMARY KEY, owner TEXT, version INTEGER, body TEXT)
//! ```
//!
//! The body is the JSON-encoded record; `version` is authoritative and is
//! written back into the record on read. Optimistic updates are a single
//! conditional `UPDATE`, so the check-and-increment is atomic in the database.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::debug;

use crate::errors::{CinderError, Result};
use crate::store::{Resource, ResourceTable};

pub type SharedConnection = Arc<Mutex<Connection>>;

/// Open a database file and apply connection-level pragmas.
pub fn open_connection(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
    debug!(path = %path, "opened sqlite store");
    Ok(conn)
}

pub(crate) fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| CinderError::Other(anyhow!("sqlite connection lock poisoned")))
}

pub struct SqliteTable<R: Resource> {
    conn: SharedConnection,
    _kind: PhantomData<fn() -> R>,
}

impl<R: Resource> SqliteTable<R> {
    pub fn new(conn: SharedConnection) -> Result<Self> {
        {
            let guard = lock(&conn)?;
            guard.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id      TEXT PRIMARY KEY,
                    owner   TEXT,
                    version INTEGER NOT NULL,
                    body    TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS {table}_owner ON {table} (owner);",
                table = R::TABLE
            ))?;
        }
        Ok(Self {
            conn,
            _kind: PhantomData,
        })
    }

    fn decode(version: i64, body: &str) -> Result<R> {
        let mut record: R = serde_json::from_str(body)?;
        record.set_version(version as u64);
        Ok(record)
    }

    fn query_many(&self, sql: &str, owner: Option<&str>) -> Result<Vec<R>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(sql)?;
        let rows: Vec<(i64, String)> = match owner {
            Some(owner) => stmt
                .query_map(params![owner], version_and_body)?
                .collect::<rusqlite::Result<_>>()?,
            None => stmt
                .query_map([], version_and_body)?
                .collect::<rusqlite::Result<_>>()?,
        };

        rows.iter()
            .map(|(version, body)| Self::decode(*version, body))
            .collect()
    }
}

fn version_and_body(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String)> {
    Ok((row.get(0)?, row.get(1)?))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

impl<R: Resource> ResourceTable<R> for SqliteTable<R> {
    fn create(&self, item: &mut R) -> Result<()> {
        item.set_version(0);
        let body = serde_json::to_string(item)?;
        let conn = lock(&self.conn)?;
        let res = conn.execute(
            &format!(
                "INSERT INTO {} (id, owner, version, body) VALUES (?1, ?2, 0, ?3)",
                R::TABLE
            ),
            params![item.id(), item.owner(), body],
        );
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                Err(CinderError::already_exists(R::KIND, item.id()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read(&self, id: &str) -> Result<R> {
        let conn = lock(&self.conn)?;
        let row: Option<(i64, String)> = conn
            .query_row(
                &format!("SELECT version, body FROM {} WHERE id = ?1", R::TABLE),
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((version, body)) => Self::decode(version, &body),
            None => Err(CinderError::not_found(R::KIND, id)),
        }
    }

    fn update(&self, item: &mut R) -> Result<()> {
        let expected = item.version();
        let mut next = item.clone();
        next.set_version(expected + 1);
        let body = serde_json::to_string(&next)?;

        let conn = lock(&self.conn)?;
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET owner = ?1, body = ?2, version = version + 1
                 WHERE id = ?3 AND version = ?4",
                R::TABLE
            ),
            params![item.owner(), body, item.id(), expected as i64],
        )?;

        if changed == 1 {
            *item = next;
            return Ok(());
        }

        let exists: Option<i64> = conn
            .query_row(
                &format!("SELECT version FROM {} WHERE id = ?1", R::TABLE),
                params![item.id()],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Err(CinderError::lock_failed(R::KIND, item.id(), expected)),
            None => Err(CinderError::not_found(R::KIND, item.id())),
        }
    }

    fn delete(&self, id: &str) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", R::TABLE),
            params![id],
        )?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<R>> {
        self.query_many(
            &format!("SELECT version, body FROM {} ORDER BY id", R::TABLE),
            None,
        )
    }

    fn list_by_owner(&self, owner: &str) -> Result<Vec<R>> {
        self.query_many(
            &format!(
                "SELECT version, body FROM {} WHERE owner = ?1 ORDER BY id",
                R::TABLE
            ),
            Some(owner),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::tests::{exercise_table, Widget};

    #[test]
    fn sqlite_table_honours_the_contract() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let conn = Arc::new(Mutex::new(open_connection(path.to_str().unwrap()).unwrap()));
        let table = SqliteTable::<Widget>::new(conn).unwrap();
        exercise_table(&table);
    }

    #[test]
    fn listings_carry_stored_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let conn = Arc::new(Mutex::new(open_connection(path.to_str().unwrap()).unwrap()));
        let table = SqliteTable::<Widget>::new(conn).unwrap();

        for (id, owner) in [("b", "o1"), ("a", "o1"), ("c", "o2")] {
            table.create(&mut Widget::new(id, owner, "red")).unwrap();
        }
        let mut b = table.read("b").unwrap();
        b.colour = "blue".into();
        table.update(&mut b).unwrap();

        let owned = table.list_by_owner("o1").unwrap();
        let ids: Vec<_> = owned.iter().map(|w| (w.id.as_str(), w.version)).collect();
        assert_eq!(ids, vec![("a", 0), ("b", 1)]);
        assert_eq!(table.list().unwrap().len(), 3);
        assert!(table.list_by_owner("nobody").unwrap().is_empty());
    }

    #[test]
    fn records_survive_reopening_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let path = path.to_str().unwrap();

        {
            let conn = Arc::new(Mutex::new(open_connection(path).unwrap()));
            let table = SqliteTable::<Widget>::new(conn).unwrap();
            let mut w = Widget::new("w", "o", "red");
            table.create(&mut w).unwrap();
            w.colour = "blue".into();
            table.update(&mut w).unwrap();
        }

        let conn = Arc::new(Mutex::new(open_connection(path).unwrap()));
        let table = SqliteTable::<Widget>::new(conn).unwrap();
        let w = table.read("w").unwrap();
        assert_eq!(w.colour, "blue");
        assert_eq!(w.version, 1);
    }
}
