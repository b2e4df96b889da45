//! Job store: persists job registrations (not their callables).
//!
//! A job re-registered under a stored id picks up the stored `paused` flag,
//! so pausing survives restarts when a persistent store is configured.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::StoreError;
use crate::jobs::JobInfo;

/// Storage for job metadata.
pub trait JobStore: Send + Sync {
    /// Insert or replace.
    fn save_job(&self, job: &JobInfo) -> Result<(), StoreError>;
    fn load_job(&self, id: &str) -> Result<Option<JobInfo>, StoreError>;
    /// All stored jobs ordered by creation time.
    fn load_jobs(&self) -> Result<Vec<JobInfo>, StoreError>;
    fn delete_job(&self, id: &str) -> Result<bool, StoreError>;
}

/// Process-local job store.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, JobInfo>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn save_job(&self, job: &JobInfo) -> Result<(), StoreError> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn load_job(&self, id: &str) -> Result<Option<JobInfo>, StoreError> {
        Ok(self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }

    fn load_jobs(&self) -> Result<Vec<JobInfo>, StoreError> {
        let mut jobs: Vec<JobInfo> = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn delete_job(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobTrigger;
    use chrono::Utc;

    #[test]
    fn test_memory_store_crud() {
        let store = MemoryJobStore::new();
        let mut job = JobInfo {
            id: "j1".into(),
            name: "Job".into(),
            trigger: JobTrigger::interval(10),
            paused: false,
            created_at: Utc::now(),
            next_run: None,
        };
        store.save_job(&job).unwrap();
        job.paused = true;
        store.save_job(&job).unwrap();

        assert!(store.load_job("j1").unwrap().unwrap().paused);
        assert_eq!(store.load_jobs().unwrap().len(), 1);
        assert!(store.delete_job("j1").unwrap());
        assert!(!store.delete_job("j1").unwrap());
        assert!(store.load_job("j1").unwrap().is_none());
    }
}
