//! Job definitions: what the scheduler runs and when.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cron::CronSchedule;
use crate::error::SchedulerError;

/// Future returned by a job callable.
pub type JobFuture = BoxFuture<'static, Result<(), String>>;

/// A job callable. Invoked once per firing; `Err` marks the run failed.
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Wrap an async closure as a [`JobFn`].
pub fn job_fn<F, Fut>(f: F) -> JobFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as JobFuture)
}

/// Wrap a blocking closure as a [`JobFn`]. Runs on the blocking pool so it
/// never stalls other jobs' timers.
pub fn sync_job_fn<F>(f: F) -> JobFn
where
    F: Fn() -> Result<(), String> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move || {
        let f = f.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || (*f)())
                .await
                .map_err(|e| format!("blocking job aborted: {e}"))?
        }) as JobFuture
    })
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobTrigger {
    /// Every N seconds, first firing one period after scheduling.
    Interval { seconds: u64 },
    /// 5-field cron expression in the scheduler's timezone.
    Cron { expression: String },
}

impl JobTrigger {
    pub fn interval(seconds: u64) -> Self {
        Self::Interval { seconds }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
        }
    }

    /// Build from a `(trigger_type, trigger_args)` pair.
    ///
    /// - `interval`: any of `weeks`, `days`, `hours`, `minutes`, `seconds` (summed).
    /// - `cron`: either `expression`, or the fields `minute`, `hour`, `day`,
    ///   `month`, `day_of_week` (missing fields default to `*`).
    pub fn from_args(trigger_type: &str, args: &Value) -> Result<Self, SchedulerError> {
        let trigger = match trigger_type {
            "interval" => {
                const UNITS: [(&str, f64); 5] = [
                    ("weeks", 604_800.0),
                    ("days", 86_400.0),
                    ("hours", 3_600.0),
                    ("minutes", 60.0),
                    ("seconds", 1.0),
                ];
                let mut total = 0.0;
                for (key, factor) in UNITS {
                    if let Some(v) = args.get(key) {
                        let n = v.as_f64().ok_or_else(|| {
                            SchedulerError::InvalidTrigger(format!("interval '{key}' must be a number"))
                        })?;
                        total += n * factor;
                    }
                }
                if total < 1.0 {
                    return Err(SchedulerError::InvalidTrigger(
                        "interval must be at least 1 second".into(),
                    ));
                }
                Self::Interval {
                    seconds: total.round() as u64,
                }
            }
            "cron" => {
                let expression = match args.get("expression").and_then(Value::as_str) {
                    Some(expr) => expr.to_string(),
                    None => ["minute", "hour", "day", "month", "day_of_week"]
                        .iter()
                        .map(|k| match args.get(*k) {
                            Some(Value::String(s)) => s.clone(),
                            Some(Value::Number(n)) => n.to_string(),
                            _ => "*".to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join(" "),
                };
                Self::Cron { expression }
            }
            other => {
                return Err(SchedulerError::InvalidTrigger(format!(
                    "unknown trigger type '{other}' (expected interval or cron)"
                )));
            }
        };
        trigger.validate()?;
        Ok(trigger)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        match self {
            Self::Interval { seconds: 0 } => Err(SchedulerError::InvalidTrigger(
                "interval must be at least 1 second".into(),
            )),
            Self::Interval { .. } => Ok(()),
            Self::Cron { expression } => CronSchedule::parse(expression)
                .map(|_| ())
                .map_err(SchedulerError::InvalidTrigger),
        }
    }

    pub fn trigger_type(&self) -> &'static str {
        match self {
            Self::Interval { .. } => "interval",
            Self::Cron { .. } => "cron",
        }
    }

    /// Next firing strictly after `after`.
    pub fn next_fire(&self, after: DateTime<Utc>, offset: FixedOffset) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval { seconds } => {
                Some(after + chrono::Duration::seconds(i64::try_from(*seconds).ok()?))
            }
            Self::Cron { expression } => CronSchedule::parse(expression)
                .ok()?
                .next_after(after, offset),
        }
    }

    pub fn period(&self) -> Option<Duration> {
        match self {
            Self::Interval { seconds } => Some(Duration::from_secs(*seconds)),
            Self::Cron { .. } => None,
        }
    }
}

impl std::fmt::Display for JobTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interval { seconds } => write!(f, "every {seconds}s"),
            Self::Cron { expression } => write!(f, "cron '{expression}'"),
        }
    }
}

/// Registration metadata for one job. This is what the job store persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub name: String,
    pub trigger: JobTrigger,
    #[serde(default)]
    pub paused: bool,
    pub created_at: DateTime<Utc>,
    /// Next planned firing (not persisted meaningfully; recomputed on start).
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
}

/// A job ready for [`crate::engine::TaskScheduler::register_job`].
pub struct JobSpec {
    pub id: Option<String>,
    pub name: Option<String>,
    pub trigger: JobTrigger,
    pub replace_existing: bool,
    pub func: JobFn,
}

/// Builder pairing a trigger with a plain callable.
///
/// ```ignore
/// let spec = JobBuilder::interval(300).id("cleanup").build(job_fn(|| async { Ok(()) }));
/// scheduler.register_job(spec)?;
/// ```
#[derive(Debug, Clone)]
pub struct JobBuilder {
    trigger: JobTrigger,
    id: Option<String>,
    name: Option<String>,
    replace_existing: bool,
}

impl JobBuilder {
    pub fn new(trigger: JobTrigger) -> Self {
        Self {
            trigger,
            id: None,
            name: None,
            replace_existing: false,
        }
    }

    pub fn interval(seconds: u64) -> Self {
        Self::new(JobTrigger::interval(seconds))
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Self::new(JobTrigger::cron(expression))
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn replace_existing(mut self, replace: bool) -> Self {
        self.replace_existing = replace;
        self
    }

    pub fn build(self, func: JobFn) -> JobSpec {
        JobSpec {
            id: self.id,
            name: self.name,
            trigger: self.trigger,
            replace_existing: self.replace_existing,
            func,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_interval_args_sum_units() {
        let t = JobTrigger::from_args("interval", &json!({"minutes": 1, "seconds": 30})).unwrap();
        assert_eq!(t, JobTrigger::interval(90));
        let t = JobTrigger::from_args("interval", &json!({"hours": 0.5})).unwrap();
        assert_eq!(t, JobTrigger::interval(1800));
    }

    #[test]
    fn test_interval_rejects_zero() {
        assert!(JobTrigger::from_args("interval", &json!({})).is_err());
        assert!(JobTrigger::interval(0).validate().is_err());
    }

    #[test]
    fn test_cron_from_fields() {
        let t = JobTrigger::from_args("cron", &json!({"minute": 0, "hour": "9", "day_of_week": "mon-fri"}))
            .unwrap();
        assert_eq!(t, JobTrigger::cron("0 9 * * mon-fri"));
    }

    #[test]
    fn test_cron_expression_validated() {
        assert!(JobTrigger::from_args("cron", &json!({"expression": "0 9 * * *"})).is_ok());
        assert!(JobTrigger::from_args("cron", &json!({"expression": "99 * * * *"})).is_err());
        assert!(JobTrigger::from_args("date", &json!({})).is_err());
    }

    #[test]
    fn test_next_fire() {
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let utc = FixedOffset::east_opt(0).unwrap();
        assert_eq!(
            JobTrigger::interval(60).next_fire(after, utc),
            Some(after + chrono::Duration::seconds(60))
        );
        assert_eq!(
            JobTrigger::cron("30 8 * * *").next_fire(after, utc),
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_trigger_serde_shape() {
        let v = serde_json::to_value(JobTrigger::interval(5)).unwrap();
        assert_eq!(v, json!({"type": "interval", "seconds": 5}));
    }

    #[tokio::test]
    async fn test_sync_job_fn_runs_on_blocking_pool() {
        let f = sync_job_fn(|| Err("nope".to_string()));
        assert_eq!(f().await, Err("nope".to_string()));
    }

    #[test]
    fn test_builder() {
        let spec = JobBuilder::cron("0 * * * *")
            .id("hourly")
            .name("Hourly sync")
            .replace_existing(true)
            .build(job_fn(|| async { Ok(()) }));
        assert_eq!(spec.id.as_deref(), Some("hourly"));
        assert_eq!(spec.trigger.trigger_type(), "cron");
        assert!(spec.replace_existing);
    }
}
