//! Task scheduler: interval/cron dispatch with health, history and hooks.
//!
//! Every job runs in its own tokio task, so a slow job only delays its own
//! next firing. Each firing is spawned separately and awaited, which turns a
//! panicking job into an ordinary failed run. Pausing, removing or modifying a
//! job only stops its timer: a run already in flight still completes and is
//! recorded.
//!
//! ```text
//! TaskScheduler
//!   ├── job loop (interval_at / cron sleep) ──► execute(job_id)
//!   │      before hooks → spawn(func) → health + history → after/error hooks
//!   ├── JobStore        (memory | sqlite): registrations, paused flag
//!   ├── HistoryStore    (memory | sqlite): ExecutionRecord per run
//!   └── health sweep    (every health_check_interval_secs)
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use chrono::{FixedOffset, Utc};
use futures::FutureExt;
use larkbot_core::config::{SchedulerConfig, StoreType, expand_path};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::cron::CronSchedule;
use crate::dispatch::NotifyTarget;
use crate::error::SchedulerError;
use crate::health::{HealthMonitor, HealthReport, JobHealth};
use crate::history::{ExecutionHistoryStore, ExecutionRecord, MemoryHistoryStore, TaskStatus};
use crate::hooks::{AlertHook, JobContext, JobHook, JobMetrics, LoggingHook, MetricsHook};
use crate::jobs::{JobFn, JobInfo, JobSpec, JobTrigger};
use crate::persistence::{SqliteHistoryStore, SqliteJobStore};
use crate::store::{JobStore, MemoryJobStore};

struct JobEntry {
    info: JobInfo,
    func: JobFn,
    /// Dropping the sender stops the job's timer loop.
    timer: Option<watch::Sender<()>>,
}

/// Health-aware interval/cron scheduler.
pub struct TaskScheduler {
    config: SchedulerConfig,
    offset: FixedOffset,
    self_ref: Weak<TaskScheduler>,
    jobs: Mutex<HashMap<String, JobEntry>>,
    job_store: Arc<dyn JobStore>,
    history: Option<Arc<dyn ExecutionHistoryStore>>,
    health: HealthMonitor,
    hooks: RwLock<Vec<Arc<dyn JobHook>>>,
    metrics: Mutex<Option<Arc<MetricsHook>>>,
    running: AtomicBool,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Build a scheduler with explicit stores and no hooks.
    pub fn with_stores(
        config: SchedulerConfig,
        job_store: Arc<dyn JobStore>,
        history: Option<Arc<dyn ExecutionHistoryStore>>,
    ) -> Arc<Self> {
        let offset = config.utc_offset();
        let health = HealthMonitor::new(config.failure_threshold);
        Arc::new_cyclic(|weak| Self {
            config,
            offset,
            self_ref: weak.clone(),
            jobs: Mutex::new(HashMap::new()),
            job_store,
            history,
            health,
            hooks: RwLock::new(Vec::new()),
            metrics: Mutex::new(None),
            running: AtomicBool::new(false),
            health_task: Mutex::new(None),
        })
    }

    /// Build a scheduler from configuration: stores by `*_store_type`,
    /// hooks by the `enable_*_hook` flags.
    pub fn from_config(config: SchedulerConfig) -> Result<Arc<Self>, SchedulerError> {
        let job_store: Arc<dyn JobStore> = match config.job_store_type {
            StoreType::Memory => Arc::new(MemoryJobStore::new()),
            StoreType::Sqlite => Arc::new(SqliteJobStore::open(&expand_path(&config.job_store_path))?),
        };
        let history: Option<Arc<dyn ExecutionHistoryStore>> = match config.history_store_type {
            _ if !config.history_enabled => None,
            StoreType::Memory => Some(Arc::new(MemoryHistoryStore::new(
                config.history_max_records,
                config.history_cap_scope,
            ))),
            StoreType::Sqlite => Some(Arc::new(SqliteHistoryStore::open(
                &expand_path(&config.history_store_path),
                config.history_max_records,
                config.history_cap_scope,
            )?)),
        };

        let scheduler = Self::with_stores(config, job_store, history);
        if scheduler.config.enable_logging_hook {
            scheduler.add_hook(Arc::new(LoggingHook));
        }
        if scheduler.config.enable_metrics_hook {
            let metrics = Arc::new(MetricsHook::new());
            scheduler.add_hook(metrics.clone());
            *scheduler.lock_metrics() = Some(metrics);
        }
        if scheduler.config.enable_alert_hook {
            scheduler.add_hook(Arc::new(AlertHook::new(
                scheduler.config.failure_threshold,
                NotifyTarget::from_url(&scheduler.config.alert_webhook_url),
            )));
        }
        Ok(scheduler)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_metrics(&self) -> MutexGuard<'_, Option<Arc<MetricsHook>>> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Hooks ─────────────────────────────────────────────

    /// Append a hook; hooks run in registration order.
    pub fn add_hook(&self, hook: Arc<dyn JobHook>) {
        self.hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    pub fn hook_names(&self) -> Vec<String> {
        self.hooks_snapshot().iter().map(|h| h.name().to_string()).collect()
    }

    fn hooks_snapshot(&self) -> Vec<Arc<dyn JobHook>> {
        self.hooks.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Per-job metrics, when the metrics hook is enabled.
    pub fn metrics(&self) -> Option<HashMap<String, JobMetrics>> {
        self.lock_metrics().as_ref().map(|m| m.snapshot())
    }

    // ─── Lifecycle ─────────────────────────────────────────

    /// Start firing jobs. Fails when the scheduler is disabled in configuration.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if !self.config.enabled {
            return Err(SchedulerError::Disabled);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let count = {
            let mut jobs = self.lock_jobs();
            for entry in jobs.values_mut() {
                if !entry.info.paused && entry.timer.is_none() {
                    entry.timer = Some(self.spawn_job_loop(&entry.info));
                }
            }
            jobs.len()
        };

        if self.config.health_check_enabled {
            let handle = self.spawn_health_sweep();
            if let Some(old) = self
                .health_task
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .replace(handle)
            {
                old.abort();
            }
        }

        tracing::info!(
            "⏰ Scheduler started ({} job(s), timezone {})",
            count,
            self.config.timezone
        );
        Ok(())
    }

    /// Stop all job loops. In-flight runs are not interrupted.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for entry in self.lock_jobs().values_mut() {
            entry.timer = None;
        }
        if let Some(handle) = self
            .health_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        tracing::info!("🛑 Scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ─── Job management ────────────────────────────────────

    /// Add a job. Without `job_id` a fresh UUID is generated, so the same
    /// callable added twice gets two ids.
    pub fn add_job(
        &self,
        func: JobFn,
        trigger: JobTrigger,
        job_id: Option<&str>,
        replace_existing: bool,
    ) -> Result<String, SchedulerError> {
        self.register_job(JobSpec {
            id: job_id.map(str::to_string),
            name: None,
            trigger,
            replace_existing,
            func,
        })
    }

    /// Add a job from a `(trigger_type, trigger_args)` pair, see [`JobTrigger::from_args`].
    pub fn add_job_with_args(
        &self,
        func: JobFn,
        trigger_type: &str,
        trigger_args: &Value,
        job_id: Option<&str>,
        replace_existing: bool,
    ) -> Result<String, SchedulerError> {
        let trigger = JobTrigger::from_args(trigger_type, trigger_args)?;
        self.add_job(func, trigger, job_id, replace_existing)
    }

    /// Register a job built with [`crate::jobs::JobBuilder`].
    pub fn register_job(&self, spec: JobSpec) -> Result<String, SchedulerError> {
        spec.trigger.validate()?;
        let id = spec.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let name = spec.name.unwrap_or_else(|| id.clone());
        let stored = self.job_store.load_job(&id)?;

        let mut jobs = self.lock_jobs();
        if let Some(existing) = jobs.get_mut(&id) {
            if !spec.replace_existing {
                return Err(SchedulerError::JobExists(id));
            }
            existing.timer = None;
        }

        let info = JobInfo {
            id: id.clone(),
            name,
            trigger: spec.trigger,
            paused: stored.as_ref().is_some_and(|s| s.paused),
            created_at: stored.map(|s| s.created_at).unwrap_or_else(Utc::now),
            next_run: None,
        };
        self.job_store.save_job(&info)?;

        let timer = (self.is_running() && !info.paused).then(|| self.spawn_job_loop(&info));
        tracing::info!(
            "📅 Job added: '{}' ({}, {}{})",
            info.name,
            info.id,
            info.trigger,
            if info.paused { ", paused" } else { "" }
        );
        jobs.insert(
            id.clone(),
            JobEntry {
                info,
                func: spec.func,
                timer,
            },
        );
        Ok(id)
    }

    /// Remove a job. Its execution history is kept, and a run already in
    /// flight is still recorded.
    pub fn remove_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        let entry = self
            .lock_jobs()
            .remove(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        self.job_store.delete_job(job_id)?;
        tracing::info!("🗑️ Job removed: '{}' ({})", entry.info.name, job_id);
        Ok(())
    }

    pub fn pause_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        let mut jobs = self.lock_jobs();
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        entry.timer = None;
        entry.info.paused = true;
        entry.info.next_run = None;
        self.job_store.save_job(&entry.info)?;
        tracing::info!("⏸️ Job paused: '{}'", entry.info.name);
        Ok(())
    }

    pub fn resume_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        let mut jobs = self.lock_jobs();
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        entry.info.paused = false;
        if self.is_running() && entry.timer.is_none() {
            entry.timer = Some(self.spawn_job_loop(&entry.info));
        }
        self.job_store.save_job(&entry.info)?;
        tracing::info!("▶️ Job resumed: '{}'", entry.info.name);
        Ok(())
    }

    /// Change a job's trigger and/or name. The timer restarts from now.
    pub fn modify_job(
        &self,
        job_id: &str,
        trigger: Option<JobTrigger>,
        name: Option<String>,
    ) -> Result<JobInfo, SchedulerError> {
        if let Some(t) = &trigger {
            t.validate()?;
        }
        let mut jobs = self.lock_jobs();
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        if let Some(name) = name {
            entry.info.name = name;
        }
        if let Some(trigger) = trigger {
            entry.info.trigger = trigger;
            entry.timer = None;
            if self.is_running() && !entry.info.paused {
                entry.timer = Some(self.spawn_job_loop(&entry.info));
            }
        }
        self.job_store.save_job(&entry.info)?;
        tracing::info!("✏️ Job modified: '{}' ({})", entry.info.name, entry.info.trigger);
        Ok(entry.info.clone())
    }

    pub fn get_job(&self, job_id: &str) -> Option<JobInfo> {
        self.lock_jobs().get(job_id).map(|e| e.info.clone())
    }

    /// All registered jobs, oldest first.
    pub fn get_jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self.lock_jobs().values().map(|e| e.info.clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Jobs known to the job store, including ones not registered in this process.
    pub fn stored_jobs(&self) -> Result<Vec<JobInfo>, SchedulerError> {
        Ok(self.job_store.load_jobs()?)
    }

    /// Run a job immediately, outside its schedule, through the same
    /// hooks/health/history path as a timed firing.
    pub async fn run_job_now(&self, job_id: &str) -> Result<ExecutionRecord, SchedulerError> {
        self.execute(job_id).await
    }

    // ─── Health & history ──────────────────────────────────

    pub fn job_health(&self, job_id: &str) -> Option<JobHealth> {
        self.health.get(job_id)
    }

    pub fn health_status(&self) -> HealthReport {
        self.health.report()
    }

    /// Newest first. Empty when history is disabled.
    pub fn get_execution_history(
        &self,
        job_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, SchedulerError> {
        match &self.history {
            Some(h) => Ok(h.get_execution_history(job_id, limit)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn get_task_status(&self, job_id: &str) -> Result<Option<TaskStatus>, SchedulerError> {
        match &self.history {
            Some(h) => Ok(h.get_task_status(job_id)?),
            None => Ok(None),
        }
    }

    pub fn clear_history(&self, job_id: Option<&str>) -> Result<usize, SchedulerError> {
        match &self.history {
            Some(h) => Ok(h.clear_history(job_id)?),
            None => Ok(0),
        }
    }

    // ─── Execution ─────────────────────────────────────────

    async fn execute(&self, job_id: &str) -> Result<ExecutionRecord, SchedulerError> {
        let (func, job_name) = {
            let jobs = self.lock_jobs();
            let entry = jobs
                .get(job_id)
                .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
            (entry.func.clone(), entry.info.name.clone())
        };

        let ctx = JobContext {
            job_id: job_id.to_string(),
            job_name,
            started_at: Utc::now(),
        };
        let hooks = self.hooks_snapshot();
        for hook in &hooks {
            run_hook(hook.name(), "before_execution", hook.before_execution(&ctx)).await;
        }

        let started = Instant::now();
        let outcome = match tokio::spawn(func()).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(format!("job panicked: {}", panic_message(e.into_panic()))),
            Err(e) => Err(format!("job cancelled: {e}")),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let record = match &outcome {
            Ok(()) => ExecutionRecord::success(job_id, ctx.started_at, duration_ms),
            Err(e) => ExecutionRecord::failure(job_id, ctx.started_at, duration_ms, e),
        };
        let health = self.health.record(
            job_id,
            record.success,
            record.executed_at,
            duration_ms,
            record.error.as_deref(),
        );
        if let Some(history) = &self.history
            && let Err(e) = history.record_execution(&record)
        {
            tracing::warn!("⚠️ Failed to record execution of '{}': {e}", job_id);
        }

        if let Err(e) = &outcome
            && health.consecutive_failures == self.health.failure_threshold()
        {
            tracing::error!(
                "🩺 Job '{}' unhealthy after {} consecutive failures: {}",
                ctx.job_name,
                health.consecutive_failures,
                e
            );
        }

        for hook in &hooks {
            run_hook(
                hook.name(),
                "after_execution",
                hook.after_execution(&ctx, &record, &health),
            )
            .await;
        }
        if let Err(e) = &outcome {
            for hook in &hooks {
                run_hook(hook.name(), "on_error", hook.on_error(&ctx, e, &health)).await;
            }
        }

        Ok(record)
    }

    fn set_next_run(&self, job_id: &str, next: Option<chrono::DateTime<Utc>>) {
        if let Some(entry) = self.lock_jobs().get_mut(job_id) {
            entry.info.next_run = next;
        }
    }

    /// Spawn the timer loop for a job. The loop waits for the next firing or
    /// for the returned sender to drop, whichever comes first; a firing that
    /// has started is never interrupted.
    fn spawn_job_loop(&self, info: &JobInfo) -> watch::Sender<()> {
        let weak = self.self_ref.clone();
        let job_id = info.id.clone();
        let trigger = info.trigger.clone();
        let offset = self.offset;
        let (timer, mut stopped) = watch::channel(());

        tokio::spawn(async move {
            match trigger {
                JobTrigger::Interval { seconds } => {
                    let period = Duration::from_secs(seconds.max(1));
                    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        match weak.upgrade() {
                            Some(s) => s.set_next_run(
                                &job_id,
                                chrono::Duration::from_std(period).ok().map(|d| Utc::now() + d),
                            ),
                            None => break,
                        }
                        tokio::select! {
                            biased;
                            _ = stopped.changed() => break,
                            _ = ticker.tick() => {}
                        }
                        let Some(scheduler) = weak.upgrade() else { break };
                        if let Err(e) = scheduler.execute(&job_id).await {
                            tracing::debug!("Job loop for '{}' exiting: {e}", job_id);
                            break;
                        }
                    }
                }
                JobTrigger::Cron { expression } => {
                    let schedule = match CronSchedule::parse(&expression) {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!("⚠️ Job '{}' not scheduled: {e}", job_id);
                            return;
                        }
                    };
                    loop {
                        let Some(next) = schedule.next_after(Utc::now(), offset) else {
                            tracing::warn!("⚠️ Cron '{}' has no upcoming run for job '{}'", expression, job_id);
                            break;
                        };
                        match weak.upgrade() {
                            Some(s) => s.set_next_run(&job_id, Some(next)),
                            None => break,
                        }
                        let wait = (next - Utc::now()).to_std().unwrap_or_default();
                        tokio::select! {
                            biased;
                            _ = stopped.changed() => break,
                            _ = tokio::time::sleep(wait) => {}
                        }
                        let Some(scheduler) = weak.upgrade() else { break };
                        if let Err(e) = scheduler.execute(&job_id).await {
                            tracing::debug!("Job loop for '{}' exiting: {e}", job_id);
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Timer loop for '{}' stopped", job_id);
        });
        timer
    }

    fn spawn_health_sweep(&self) -> JoinHandle<()> {
        let weak = self.self_ref.clone();
        let period = Duration::from_secs(self.config.health_check_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(scheduler) = weak.upgrade() else { break };
                let report = scheduler.health_status();
                if report.healthy {
                    tracing::debug!("💚 Health check: {} job(s) healthy", report.total_jobs);
                    continue;
                }
                for job in report.jobs.iter().filter(|j| report.unhealthy_jobs.contains(&j.job_id)) {
                    tracing::error!(
                        "🩺 Job '{}' unhealthy: {} consecutive failures (last error: {})",
                        job.job_id,
                        job.consecutive_failures,
                        job.last_error.as_deref().unwrap_or("-")
                    );
                }
            }
        })
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self
            .health_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

/// Await one hook call; errors and panics are logged, never propagated.
async fn run_hook<F>(hook: &str, stage: &str, fut: F)
where
    F: Future<Output = Result<(), String>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("⚠️ Hook '{}' failed in {}: {}", hook, stage, e),
        Err(panic) => tracing::warn!(
            "⚠️ Hook '{}' panicked in {}: {}",
            hook,
            stage,
            panic_message(panic)
        ),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
