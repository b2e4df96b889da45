//! Job hooks: observers invoked around every job execution.
//!
//! Hooks cannot abort a job: an `Err` or a panic from any hook method is
//! logged by the scheduler and otherwise ignored.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dispatch::{self, NotifyTarget};
use crate::health::JobHealth;
use crate::history::ExecutionRecord;
use crate::notify::{Notification, NotifyPriority, NotifyRouter};

/// What a hook knows about the run in progress.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobHook: Send + Sync {
    fn name(&self) -> &str;

    async fn before_execution(&self, _ctx: &JobContext) -> Result<(), String> {
        Ok(())
    }

    /// Called after every run, successful or not.
    async fn after_execution(
        &self,
        _ctx: &JobContext,
        _record: &ExecutionRecord,
        _health: &JobHealth,
    ) -> Result<(), String> {
        Ok(())
    }

    /// Called after a failed run, following `after_execution`.
    async fn on_error(&self, _ctx: &JobContext, _error: &str, _health: &JobHealth) -> Result<(), String> {
        Ok(())
    }
}

// ─── Logging ───────────────────────────────────────────────

/// Logs job start/finish through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingHook;

#[async_trait]
impl JobHook for LoggingHook {
    fn name(&self) -> &str {
        "logging"
    }

    async fn before_execution(&self, ctx: &JobContext) -> Result<(), String> {
        tracing::debug!("▶️ Job '{}' ({}) starting", ctx.job_name, ctx.job_id);
        Ok(())
    }

    async fn after_execution(
        &self,
        ctx: &JobContext,
        record: &ExecutionRecord,
        _health: &JobHealth,
    ) -> Result<(), String> {
        if record.success {
            tracing::info!("✅ Job '{}' finished in {}ms", ctx.job_name, record.duration_ms);
        }
        Ok(())
    }

    async fn on_error(&self, ctx: &JobContext, error: &str, health: &JobHealth) -> Result<(), String> {
        tracing::warn!(
            "❌ Job '{}' failed ({} in a row): {}",
            ctx.job_name,
            health.consecutive_failures,
            error
        );
        Ok(())
    }
}

// ─── Metrics ───────────────────────────────────────────────

/// Per-job run counters and durations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobMetrics {
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
    pub last_duration_ms: u64,
}

impl JobMetrics {
    pub fn avg_duration_ms(&self) -> f64 {
        if self.runs == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.runs as f64
        }
    }
}

/// Collects [`JobMetrics`] for every job.
#[derive(Debug, Default)]
pub struct MetricsHook {
    metrics: Mutex<HashMap<String, JobMetrics>>,
}

impl MetricsHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<String, JobMetrics> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get(&self, job_id: &str) -> Option<JobMetrics> {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
    }
}

#[async_trait]
impl JobHook for MetricsHook {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn after_execution(
        &self,
        ctx: &JobContext,
        record: &ExecutionRecord,
        _health: &JobHealth,
    ) -> Result<(), String> {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        let m = metrics.entry(ctx.job_id.clone()).or_default();
        m.runs += 1;
        if record.success {
            m.successes += 1;
        } else {
            m.failures += 1;
        }
        m.total_duration_ms += record.duration_ms;
        m.max_duration_ms = m.max_duration_ms.max(record.duration_ms);
        m.last_duration_ms = record.duration_ms;
        Ok(())
    }
}

// ─── Alerts ────────────────────────────────────────────────

/// Raises one alert per failure streak, when consecutive failures reach the threshold.
pub struct AlertHook {
    threshold: u32,
    target: NotifyTarget,
    client: reqwest::Client,
    router: Mutex<NotifyRouter>,
}

impl AlertHook {
    pub fn new(threshold: u32, target: NotifyTarget) -> Self {
        Self {
            threshold: threshold.max(1),
            target,
            client: reqwest::Client::new(),
            router: Mutex::new(NotifyRouter::new()),
        }
    }

    /// Alerts raised so far (most recent 100).
    pub fn alerts(&self) -> Vec<Notification> {
        self.router.lock().unwrap_or_else(|e| e.into_inner()).history()
    }
}

#[async_trait]
impl JobHook for AlertHook {
    fn name(&self) -> &str {
        "alert"
    }

    async fn on_error(&self, ctx: &JobContext, error: &str, health: &JobHealth) -> Result<(), String> {
        if health.consecutive_failures != self.threshold {
            return Ok(());
        }

        let notification = Notification::new(
            &format!("Job '{}' is failing", ctx.job_name),
            &format!(
                "{} consecutive failures (job id {}). Last error: {}",
                health.consecutive_failures, ctx.job_id, error
            ),
            &ctx.job_id,
            NotifyPriority::High,
        );
        tracing::info!("🚨 Alert raised for job '{}'", ctx.job_name);
        self.router
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(notification.clone());

        dispatch::dispatch(&self.client, &notification, &self.target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> JobContext {
        JobContext {
            job_id: "sync".into(),
            job_name: "Sync".into(),
            started_at: Utc::now(),
        }
    }

    fn health(consecutive: u32) -> JobHealth {
        JobHealth {
            job_id: "sync".into(),
            consecutive_failures: consecutive,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_metrics_accumulate() {
        let hook = MetricsHook::new();
        let now = Utc::now();
        hook.after_execution(&ctx(), &ExecutionRecord::success("sync", now, 10), &health(0))
            .await
            .unwrap();
        hook.after_execution(&ctx(), &ExecutionRecord::failure("sync", now, 30, "x"), &health(1))
            .await
            .unwrap();

        let m = hook.get("sync").unwrap();
        assert_eq!(m.runs, 2);
        assert_eq!(m.failures, 1);
        assert_eq!(m.max_duration_ms, 30);
        assert_eq!(m.avg_duration_ms(), 20.0);
    }

    #[tokio::test]
    async fn test_alert_fires_once_per_streak() {
        let hook = AlertHook::new(3, NotifyTarget::Log);
        for n in 1..=5 {
            hook.on_error(&ctx(), "boom", &health(n)).await.unwrap();
        }
        assert_eq!(hook.alerts().len(), 1);

        // A new streak after recovery alerts again
        hook.on_error(&ctx(), "boom", &health(3)).await.unwrap();
        assert_eq!(hook.alerts().len(), 2);
        assert_eq!(hook.alerts()[0].priority, NotifyPriority::High);
    }

    #[tokio::test]
    async fn test_logging_hook_never_errors() {
        let hook = LoggingHook;
        assert!(hook.before_execution(&ctx()).await.is_ok());
        assert!(hook.on_error(&ctx(), "e", &health(1)).await.is_ok());
    }
}
