// src/log/store.rs

//! Log line persistence.
//!
//! Both backends share [`check_append`], which enforces the numbering rules:
//!
//! - the first line of a batch continues at `last_seq + 1`, and each
//!   following line at its predecessor + 1;
//! - a `Discontinuity` line may skip ahead, but never backwards;
//! - an `End` line seals the log and must be the last line of its batch;
//! - appending to a sealed log is rejected.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::anyhow;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::errors::{CinderError, Result};
use crate::log::{LogDescriptor, LogKind, LogLine};
use crate::store::sqlite::{lock, SharedConnection};
use crate::types::JobId;

pub trait LogStore: Send + Sync {
    /// Append a batch written by the current lease holder. Returns the
    /// updated descriptor. An empty batch is a no-op.
    fn append(&self, job: &JobId, lines: &[LogLine]) -> Result<LogDescriptor>;

    /// Mark the log complete without writing a line. Idempotent.
    fn seal(&self, job: &JobId) -> Result<LogDescriptor>;

    /// Current extent; an unknown job has an empty, unsealed log.
    fn descriptor(&self, job: &JobId) -> Result<LogDescriptor>;

    /// Lines with `seq_no > after`, in order, at most `limit` of them.
    fn lines_after(&self, job: &JobId, after: u64, limit: Option<usize>) -> Result<Vec<LogLine>>;
}

/// Validate `lines` against `current` and return the descriptor after the
/// append.
pub fn check_append(current: &LogDescriptor, lines: &[LogLine]) -> Result<LogDescriptor> {
    if current.sealed && !lines.is_empty() {
        return Err(CinderError::InvalidLog(format!(
            "log of job {} is sealed",
            current.job_id
        )));
    }

    let mut next = current.clone();
    for (i, line) in lines.iter().enumerate() {
        if next.sealed {
            return Err(CinderError::InvalidLog(format!(
                "line {} follows the end of the log of job {}",
                line.seq_no, current.job_id
            )));
        }

        let expected = next.last_seq + 1;
        let ok = match line.kind {
            LogKind::Discontinuity => line.seq_no >= expected,
            _ => line.seq_no == expected,
        };
        if !ok {
            return Err(CinderError::InvalidLog(format!(
                "job {}: line {} of batch has seq_no {}, expected {}",
                current.job_id, i, line.seq_no, expected
            )));
        }

        next.last_seq = line.seq_no;
        if line.kind == LogKind::End {
            next.sealed = true;
        }
    }
    Ok(next)
}

fn apply_limit(lines: impl Iterator<Item = LogLine>, limit: Option<usize>) -> Vec<LogLine> {
    match limit {
        Some(n) => lines.take(n).collect(),
        None => lines.collect(),
    }
}

#[derive(Debug, Default)]
struct JobLog {
    lines: Vec<LogLine>,
    sealed: bool,
}

impl JobLog {
    fn descriptor(&self, job: &JobId) -> LogDescriptor {
        LogDescriptor {
            job_id: job.clone(),
            last_seq: self.lines.last().map(|l| l.seq_no).unwrap_or(0),
            sealed: self.sealed,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryLogStore {
    logs: RwLock<HashMap<JobId, JobLog>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> CinderError {
    CinderError::Other(anyhow!("log store lock poisoned"))
}

impl LogStore for MemoryLogStore {
    fn append(&self, job: &JobId, lines: &[LogLine]) -> Result<LogDescriptor> {
        let mut logs = self.logs.write().map_err(|_| poisoned())?;
        let log = logs.entry(job.clone()).or_default();
        let next = check_append(&log.descriptor(job), lines)?;
        log.lines.extend_from_slice(lines);
        log.sealed = next.sealed;
        Ok(next)
    }

    fn seal(&self, job: &JobId) -> Result<LogDescriptor> {
        let mut logs = self.logs.write().map_err(|_| poisoned())?;
        let log = logs.entry(job.clone()).or_default();
        log.sealed = true;
        Ok(log.descriptor(job))
    }

    fn descriptor(&self, job: &JobId) -> Result<LogDescriptor> {
        let logs = self.logs.read().map_err(|_| poisoned())?;
        Ok(logs
            .get(job)
            .map(|log| log.descriptor(job))
            .unwrap_or_else(|| LogDescriptor::empty(job.clone())))
    }

    fn lines_after(&self, job: &JobId, after: u64, limit: Option<usize>) -> Result<Vec<LogLine>> {
        let logs = self.logs.read().map_err(|_| poisoned())?;
        let Some(log) = logs.get(job) else {
            return Ok(Vec::new());
        };
        // Lines are sorted by seq_no, so binary search for the resume point.
        let start = log.lines.partition_point(|l| l.seq_no <= after);
        Ok(apply_limit(log.lines[start..].iter().cloned(), limit))
    }
}

/// Log lines keyed by `(job_id, seq_no)` in the shared SQLite database.
pub struct SqliteLogStore {
    conn: SharedConnection,
}

impl SqliteLogStore {
    pub fn new(conn: SharedConnection) -> Result<Self> {
        {
            let guard = lock(&conn)?;
            guard.execute_batch(
                "CREATE TABLE IF NOT EXISTS log_lines (
                    job_id TEXT NOT NULL,
                    seq_no INTEGER NOT NULL,
                    body   TEXT NOT NULL,
                    PRIMARY KEY (job_id, seq_no)
                 );
                 CREATE TABLE IF NOT EXISTS log_streams (
                    job_id   TEXT PRIMARY KEY,
                    last_seq INTEGER NOT NULL,
                    sealed   INTEGER NOT NULL
                 );",
            )?;
        }
        Ok(Self { conn })
    }

    fn read_descriptor(conn: &rusqlite::Connection, job: &JobId) -> Result<LogDescriptor> {
        let row: Option<(i64, bool)> = conn
            .query_row(
                "SELECT last_seq, sealed FROM log_streams WHERE job_id = ?1",
                params![job.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            Some((last_seq, sealed)) => LogDescriptor {
                job_id: job.clone(),
                last_seq: last_seq as u64,
                sealed,
            },
            None => LogDescriptor::empty(job.clone()),
        })
    }

    fn write_descriptor(conn: &rusqlite::Connection, desc: &LogDescriptor) -> Result<()> {
        conn.execute(
            "INSERT INTO log_streams (job_id, last_seq, sealed) VALUES (?1, ?2, ?3)
             ON CONFLICT(job_id) DO UPDATE SET last_seq = excluded.last_seq, sealed = excluded.sealed",
            params![desc.job_id.as_str(), desc.last_seq as i64, desc.sealed],
        )?;
        Ok(())
    }
}

impl LogStore for SqliteLogStore {
    fn append(&self, job: &JobId, lines: &[LogLine]) -> Result<LogDescriptor> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let current = Self::read_descriptor(&tx, job)?;
        let next = check_append(&current, lines)?;
        if lines.is_empty() {
            return Ok(next);
        }

        {
            let mut stmt =
                tx.prepare("INSERT INTO log_lines (job_id, seq_no, body) VALUES (?1, ?2, ?3)")?;
            for line in lines {
                let body = serde_json::to_string(line)?;
                stmt.execute(params![job.as_str(), line.seq_no as i64, body])?;
            }
        }
        Self::write_descriptor(&tx, &next)?;
        tx.commit()?;

        debug!(job = %job, last_seq = next.last_seq, sealed = next.sealed, "appended log lines");
        Ok(next)
    }

    fn seal(&self, job: &JobId) -> Result<LogDescriptor> {
        let conn = lock(&self.conn)?;
        let mut desc = Self::read_descriptor(&conn, job)?;
        desc.sealed = true;
        Self::write_descriptor(&conn, &desc)?;
        Ok(desc)
    }

    fn descriptor(&self, job: &JobId) -> Result<LogDescriptor> {
        let conn = lock(&self.conn)?;
        Self::read_descriptor(&conn, job)
    }

    fn lines_after(&self, job: &JobId, after: u64, limit: Option<usize>) -> Result<Vec<LogLine>> {
        let conn = lock(&self.conn)?;
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(
            "SELECT body FROM log_lines WHERE job_id = ?1 AND seq_no > ?2
             ORDER BY seq_no LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![job.as_str(), after as i64, limit], |row| {
            row.get::<_, String>(0)
        })?;

        let mut out = Vec::new();
        for body in rows {
            out.push(serde_json::from_str(&body?)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::store::sqlite::open_connection;

    fn job() -> JobId {
        JobId::from("job-1")
    }

    fn exercise_log_store(store: &dyn LogStore) {
        let job = job();
        assert_eq!(store.descriptor(&job).unwrap(), LogDescriptor::empty(job.clone()));

        let desc = store
            .append(
                &job,
                &[
                    LogLine::new(1, LogKind::BlockStart { name: "build".into() }, "build"),
                    LogLine::line(2, "compiling"),
                    LogLine::line(3, "done"),
                ],
            )
            .unwrap();
        assert_eq!(desc.last_seq, 3);

        // Reused and skipped numbers are both rejected.
        assert!(matches!(
            store.append(&job, &[LogLine::line(3, "again")]),
            Err(CinderError::InvalidLog(_))
        ));
        assert!(matches!(
            store.append(&job, &[LogLine::line(5, "gap")]),
            Err(CinderError::InvalidLog(_))
        ));
        assert_eq!(store.descriptor(&job).unwrap().last_seq, 3);

        store
            .append(&job, &[LogLine::new(10, LogKind::Discontinuity, "")])
            .unwrap();
        let desc = store
            .append(&job, &[LogLine::line(11, "tail"), LogLine::new(12, LogKind::End, "")])
            .unwrap();
        assert!(desc.sealed);
        assert!(store.append(&job, &[LogLine::line(13, "late")]).is_err());

        let all = store.lines_after(&job, 0, None).unwrap();
        let seqs: Vec<_> = all.iter().map(|l| l.seq_no).collect();
        assert_eq!(seqs, vec![1, 2, 3, 10, 11, 12]);

        let tail = store.lines_after(&job, 3, Some(2)).unwrap();
        let seqs: Vec<_> = tail.iter().map(|l| l.seq_no).collect();
        assert_eq!(seqs, vec![10, 11]);

        assert!(store.lines_after(&job, 12, None).unwrap().is_empty());
        assert!(store.lines_after(&JobId::from("other"), 0, None).unwrap().is_empty());
    }

    #[test]
    fn memory_log_store_enforces_numbering() {
        exercise_log_store(&MemoryLogStore::new());
    }

    #[test]
    fn sqlite_log_store_enforces_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.db");
        let conn = Arc::new(Mutex::new(open_connection(path.to_str().unwrap()).unwrap()));
        exercise_log_store(&SqliteLogStore::new(conn).unwrap());
    }

    #[test]
    fn sealing_is_idempotent_and_blocks_appends() {
        let store = MemoryLogStore::new();
        let job = job();
        store.append(&job, &[LogLine::line(1, "x")]).unwrap();
        assert!(store.seal(&job).unwrap().sealed);
        assert!(store.seal(&job).unwrap().sealed);
        assert!(store.append(&job, &[LogLine::line(2, "y")]).is_err());
        assert!(store.append(&job, &[]).is_ok());
    }

    #[test]
    fn end_must_close_its_batch() {
        let current = LogDescriptor::empty(job());
        let batch = [LogLine::new(1, LogKind::End, ""), LogLine::line(2, "after")];
        assert!(check_append(&current, &batch).is_err());
    }
}
