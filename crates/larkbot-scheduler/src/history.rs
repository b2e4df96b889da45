//! Execution history: one append-only record per job firing.
//!
//! History is separate from job registration: removing a job keeps its
//! records until `clear_history` is called.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use larkbot_core::config::HistoryCapScope;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// One job execution, success or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub job_id: String,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn success(job_id: &str, executed_at: DateTime<Utc>, duration_ms: u64) -> Self {
        Self {
            job_id: job_id.to_string(),
            executed_at,
            duration_ms,
            success: true,
            error: None,
        }
    }

    pub fn failure(job_id: &str, executed_at: DateTime<Utc>, duration_ms: u64, error: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            executed_at,
            duration_ms,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Summary of a job's retained history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub job_id: String,
    pub total_runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<bool>,
    pub last_error: Option<String>,
    pub avg_duration_ms: f64,
}

impl TaskStatus {
    /// Summarize records given newest first.
    pub fn from_records(job_id: &str, records: &[ExecutionRecord]) -> Option<Self> {
        let latest = records.first()?;
        let successes = records.iter().filter(|r| r.success).count() as u64;
        let total = records.len() as u64;
        let total_ms: u64 = records.iter().map(|r| r.duration_ms).sum();
        Some(Self {
            job_id: job_id.to_string(),
            total_runs: total,
            successes,
            failures: total - successes,
            last_run: Some(latest.executed_at),
            last_success: Some(latest.success),
            last_error: records.iter().find_map(|r| r.error.clone()),
            avg_duration_ms: total_ms as f64 / total as f64,
        })
    }
}

/// Storage for execution records.
pub trait ExecutionHistoryStore: Send + Sync {
    fn record_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    /// Newest first. `job_id = None` returns records of every job.
    fn get_execution_history(
        &self,
        job_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    fn get_task_status(&self, job_id: &str) -> Result<Option<TaskStatus>, StoreError> {
        let records = self.get_execution_history(Some(job_id), usize::MAX)?;
        Ok(TaskStatus::from_records(job_id, &records))
    }

    /// Delete records for one job (or all). Returns how many were removed.
    fn clear_history(&self, job_id: Option<&str>) -> Result<usize, StoreError>;
}

/// In-memory history capped at `max_records`, oldest evicted first.
pub struct MemoryHistoryStore {
    max_records: usize,
    scope: HistoryCapScope,
    inner: Mutex<MemoryHistory>,
}

#[derive(Default)]
struct MemoryHistory {
    /// Global insertion order, used for the global cap and cross-job queries.
    seq: u64,
    per_job: HashMap<String, VecDeque<(u64, ExecutionRecord)>>,
}

impl MemoryHistory {
    fn len(&self) -> usize {
        self.per_job.values().map(VecDeque::len).sum()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .per_job
            .iter()
            .filter_map(|(id, q)| q.front().map(|(seq, _)| (*seq, id.clone())))
            .min();
        if let Some((_, id)) = oldest
            && let Some(q) = self.per_job.get_mut(&id)
        {
            q.pop_front();
            if q.is_empty() {
                self.per_job.remove(&id);
            }
        }
    }
}

impl MemoryHistoryStore {
    pub fn new(max_records: usize, scope: HistoryCapScope) -> Self {
        Self {
            max_records: max_records.max(1),
            scope,
            inner: Mutex::new(MemoryHistory::default()),
        }
    }
}

impl Default for MemoryHistoryStore {
    fn default() -> Self {
        Self::new(1000, HistoryCapScope::PerJob)
    }
}

impl ExecutionHistoryStore for MemoryHistoryStore {
    fn record_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut h = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        h.seq += 1;
        let seq = h.seq;
        let queue = h.per_job.entry(record.job_id.clone()).or_default();
        queue.push_back((seq, record.clone()));

        match self.scope {
            HistoryCapScope::PerJob => {
                while queue.len() > self.max_records {
                    queue.pop_front();
                }
            }
            HistoryCapScope::Global => {
                while h.len() > self.max_records {
                    h.evict_oldest();
                }
            }
        }
        Ok(())
    }

    fn get_execution_history(
        &self,
        job_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let h = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<&(u64, ExecutionRecord)> = match job_id {
            Some(id) => h.per_job.get(id).map(|q| q.iter().collect()).unwrap_or_default(),
            None => h.per_job.values().flat_map(|q| q.iter()).collect(),
        };
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries.into_iter().take(limit).map(|(_, r)| r.clone()).collect())
    }

    fn clear_history(&self, job_id: Option<&str>) -> Result<usize, StoreError> {
        let mut h = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let removed = match job_id {
            Some(id) => h.per_job.remove(id).map(|q| q.len()).unwrap_or(0),
            None => {
                let n = h.len();
                h.per_job.clear();
                n
            }
        };
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(job: &str, ok: bool) -> ExecutionRecord {
        if ok {
            ExecutionRecord::success(job, Utc::now(), 5)
        } else {
            ExecutionRecord::failure(job, Utc::now(), 7, "boom")
        }
    }

    #[test]
    fn test_per_job_cap_evicts_oldest() {
        let store = MemoryHistoryStore::new(2, HistoryCapScope::PerJob);
        store.record_execution(&rec("a", false)).unwrap();
        store.record_execution(&rec("a", true)).unwrap();
        store.record_execution(&rec("a", true)).unwrap();
        store.record_execution(&rec("b", true)).unwrap();

        let a = store.get_execution_history(Some("a"), 10).unwrap();
        assert_eq!(a.len(), 2);
        assert!(a.iter().all(|r| r.success));
        assert_eq!(store.get_execution_history(None, 10).unwrap().len(), 3);
    }

    #[test]
    fn test_global_cap_evicts_across_jobs() {
        let store = MemoryHistoryStore::new(2, HistoryCapScope::Global);
        store.record_execution(&rec("a", true)).unwrap();
        store.record_execution(&rec("b", true)).unwrap();
        store.record_execution(&rec("c", true)).unwrap();

        let all = store.get_execution_history(None, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].job_id, "c");
        assert_eq!(all[1].job_id, "b");
        assert!(store.get_execution_history(Some("a"), 10).unwrap().is_empty());
    }

    #[test]
    fn test_task_status_summary() {
        let store = MemoryHistoryStore::default();
        store.record_execution(&rec("job", false)).unwrap();
        store.record_execution(&rec("job", true)).unwrap();

        let status = store.get_task_status("job").unwrap().unwrap();
        assert_eq!(status.total_runs, 2);
        assert_eq!(status.successes, 1);
        assert_eq!(status.failures, 1);
        assert_eq!(status.last_success, Some(true));
        assert_eq!(status.last_error.as_deref(), Some("boom"));
        assert_eq!(status.avg_duration_ms, 6.0);
        assert!(store.get_task_status("missing").unwrap().is_none());
    }

    #[test]
    fn test_clear_history() {
        let store = MemoryHistoryStore::default();
        store.record_execution(&rec("a", true)).unwrap();
        store.record_execution(&rec("b", true)).unwrap();
        assert_eq!(store.clear_history(Some("a")).unwrap(), 1);
        assert_eq!(store.clear_history(None).unwrap(), 1);
        assert!(store.get_execution_history(None, 10).unwrap().is_empty());
    }
}
