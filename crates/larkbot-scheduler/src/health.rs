//! Per-job health counters.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifetime counters for one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobHealth {
    pub job_id: String,
    pub total_runs: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Reset to 0 by any success.
    pub consecutive_failures: u32,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_duration_ms: u64,
}

impl JobHealth {
    pub fn is_healthy(&self, failure_threshold: u32) -> bool {
        self.consecutive_failures < failure_threshold
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_runs == 0 {
            return 1.0;
        }
        self.total_successes as f64 / self.total_runs as f64
    }
}

/// Scheduler-wide health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub failure_threshold: u32,
    pub total_jobs: usize,
    pub unhealthy_jobs: Vec<String>,
    pub jobs: Vec<JobHealth>,
    pub checked_at: DateTime<Utc>,
}

/// Tracks [`JobHealth`] for every job that has run.
pub struct HealthMonitor {
    failure_threshold: u32,
    jobs: Mutex<HashMap<String, JobHealth>>,
}

impl HealthMonitor {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Fold one run into the job's counters and return the updated snapshot.
    pub fn record(
        &self,
        job_id: &str,
        success: bool,
        at: DateTime<Utc>,
        duration_ms: u64,
        error: Option<&str>,
    ) -> JobHealth {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let h = jobs.entry(job_id.to_string()).or_insert_with(|| JobHealth {
            job_id: job_id.to_string(),
            ..Default::default()
        });
        h.total_runs += 1;
        h.last_run = Some(at);
        h.last_duration_ms = duration_ms;
        if success {
            h.total_successes += 1;
            h.consecutive_failures = 0;
            h.last_success = Some(at);
        } else {
            h.total_failures += 1;
            h.consecutive_failures += 1;
            h.last_failure = Some(at);
            h.last_error = error.map(str::to_string);
        }
        h.clone()
    }

    pub fn get(&self, job_id: &str) -> Option<JobHealth> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
    }

    pub fn report(&self) -> HealthReport {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<JobHealth> = jobs.values().cloned().collect();
        all.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        let unhealthy_jobs: Vec<String> = all
            .iter()
            .filter(|h| !h.is_healthy(self.failure_threshold))
            .map(|h| h.job_id.clone())
            .collect();
        HealthReport {
            healthy: unhealthy_jobs.is_empty(),
            failure_threshold: self.failure_threshold,
            total_jobs: all.len(),
            unhealthy_jobs,
            jobs: all,
            checked_at: Utc::now(),
        }
    }
}
