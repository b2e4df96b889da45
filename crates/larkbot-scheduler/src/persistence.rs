//! SQLite-backed job store and execution history.
//! Survives restarts; one connection per store guarded by a mutex.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use larkbot_core::config::HistoryCapScope;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::StoreError;
use crate::history::{ExecutionHistoryStore, ExecutionRecord};
use crate::jobs::{JobInfo, JobTrigger};
use crate::store::JobStore;

fn open(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Connection::open(path)?)
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ─── Job store ─────────────────────────────────────────────

/// SQLite job store.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Open or create the job database.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::with_connection(open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS scheduler_jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                trigger_type TEXT NOT NULL,     -- 'interval' or 'cron'
                trigger_data TEXT NOT NULL,     -- JSON: {type, seconds} or {type, expression}
                paused INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, bool, String)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get::<_, i32>(3)? != 0,
            row.get(4)?,
        ))
    }

    fn decode(
        (id, name, trigger_data, paused, created_at): (String, String, String, bool, String),
    ) -> Result<JobInfo, StoreError> {
        let trigger: JobTrigger = serde_json::from_str(&trigger_data)?;
        Ok(JobInfo {
            id,
            name,
            trigger,
            paused,
            created_at: parse_time(&created_at),
            next_run: None,
        })
    }
}

impl JobStore for SqliteJobStore {
    fn save_job(&self, job: &JobInfo) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO scheduler_jobs (id, name, trigger_type, trigger_data, paused, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id,
                job.name,
                job.trigger.trigger_type(),
                serde_json::to_string(&job.trigger)?,
                job.paused as i32,
                job.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn load_job(&self, id: &str) -> Result<Option<JobInfo>, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, name, trigger_data, paused, created_at FROM scheduler_jobs WHERE id = ?1",
                params![id],
                Self::row_to_job,
            )
            .optional()?;
        row.map(Self::decode).transpose()
    }

    fn load_jobs(&self) -> Result<Vec<JobInfo>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, trigger_data, paused, created_at FROM scheduler_jobs ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], Self::row_to_job)?;
        let mut jobs = Vec::new();
        for row in rows {
            match Self::decode(row?) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("⚠️ Skipping unreadable stored job: {e}"),
            }
        }
        Ok(jobs)
    }

    fn delete_job(&self, id: &str) -> Result<bool, StoreError> {
        let n = self
            .conn()
            .execute("DELETE FROM scheduler_jobs WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }
}

// ─── Execution history ─────────────────────────────────────

/// SQLite execution history, capped like [`crate::history::MemoryHistoryStore`].
pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
    max_records: usize,
    scope: HistoryCapScope,
}

impl SqliteHistoryStore {
    pub fn open(path: &Path, max_records: usize, scope: HistoryCapScope) -> Result<Self, StoreError> {
        Self::with_connection(open(path)?, max_records, scope)
    }

    pub fn in_memory(max_records: usize, scope: HistoryCapScope) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, max_records, scope)
    }

    fn with_connection(
        conn: Connection,
        max_records: usize,
        scope: HistoryCapScope,
    ) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS job_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                executed_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                success INTEGER NOT NULL,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_job_executions_job ON job_executions(job_id, id);
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_records: max_records.max(1),
            scope,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ExecutionHistoryStore for SqliteHistoryStore {
    fn record_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO job_executions (job_id, executed_at, duration_ms, success, error)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.job_id,
                record.executed_at.to_rfc3339(),
                record.duration_ms as i64,
                record.success as i32,
                record.error,
            ],
        )?;

        let cap = self.max_records as i64;
        match self.scope {
            HistoryCapScope::PerJob => conn.execute(
                "DELETE FROM job_executions WHERE job_id = ?1 AND id NOT IN
                 (SELECT id FROM job_executions WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2)",
                params![record.job_id, cap],
            )?,
            HistoryCapScope::Global => conn.execute(
                "DELETE FROM job_executions WHERE id NOT IN
                 (SELECT id FROM job_executions ORDER BY id DESC LIMIT ?1)",
                params![cap],
            )?,
        };
        Ok(())
    }

    fn get_execution_history(
        &self,
        job_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let conn = self.conn();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<ExecutionRecord> {
            let executed_at: String = row.get(1)?;
            Ok(ExecutionRecord {
                job_id: row.get(0)?,
                executed_at: parse_time(&executed_at),
                duration_ms: row.get::<_, i64>(2)?.max(0) as u64,
                success: row.get::<_, i32>(3)? != 0,
                error: row.get(4)?,
            })
        };

        let records = match job_id {
            Some(id) => {
                let mut stmt = conn.prepare(
                    "SELECT job_id, executed_at, duration_ms, success, error FROM job_executions
                     WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![id, limit], map_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT job_id, executed_at, duration_ms, success, error FROM job_executions
                     ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], map_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(records)
    }

    fn clear_history(&self, job_id: Option<&str>) -> Result<usize, StoreError> {
        let conn = self.conn();
        let n = match job_id {
            Some(id) => conn.execute("DELETE FROM job_executions WHERE job_id = ?1", params![id])?,
            None => conn.execute("DELETE FROM job_executions", [])?,
        };
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, paused: bool) -> JobInfo {
        JobInfo {
            id: id.into(),
            name: format!("{id} job"),
            trigger: JobTrigger::cron("0 9 * * *"),
            paused,
            created_at: Utc::now(),
            next_run: None,
        }
    }

    #[test]
    fn test_job_store_survives_reopen() {
        let dir = std::env::temp_dir().join("larkbot-test-jobstore");
        let path = dir.join("jobs.db");
        std::fs::remove_dir_all(&dir).ok();
        {
            let store = SqliteJobStore::open(&path).unwrap();
            store.save_job(&job("daily", true)).unwrap();
            store.save_job(&job("other", false)).unwrap();
            assert!(store.delete_job("other").unwrap());
        }
        let store = SqliteJobStore::open(&path).unwrap();
        let loaded = store.load_job("daily").unwrap().unwrap();
        assert!(loaded.paused);
        assert_eq!(loaded.trigger, JobTrigger::cron("0 9 * * *"));
        assert_eq!(store.load_jobs().unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_history_per_job_cap() {
        let store = SqliteHistoryStore::in_memory(2, HistoryCapScope::PerJob).unwrap();
        for i in 0..3 {
            store
                .record_execution(&ExecutionRecord::success("a", Utc::now(), i))
                .unwrap();
        }
        store
            .record_execution(&ExecutionRecord::failure("b", Utc::now(), 1, "bad"))
            .unwrap();

        let a = store.get_execution_history(Some("a"), 10).unwrap();
        assert_eq!(a.iter().map(|r| r.duration_ms).collect::<Vec<_>>(), vec![2, 1]);
        let status = store.get_task_status("b").unwrap().unwrap();
        assert_eq!(status.failures, 1);
        assert_eq!(status.last_error.as_deref(), Some("bad"));
    }

    #[test]
    fn test_history_global_cap_and_clear() {
        let store = SqliteHistoryStore::in_memory(2, HistoryCapScope::Global).unwrap();
        for id in ["a", "b", "c"] {
            store
                .record_execution(&ExecutionRecord::success(id, Utc::now(), 1))
                .unwrap();
        }
        let all = store.get_execution_history(None, 10).unwrap();
        assert_eq!(all.iter().map(|r| r.job_id.as_str()).collect::<Vec<_>>(), vec!["c", "b"]);
        assert_eq!(store.clear_history(Some("b")).unwrap(), 1);
        assert_eq!(store.clear_history(None).unwrap(), 1);
    }
}
