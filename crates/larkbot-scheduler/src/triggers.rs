//! Trigger registry: decides when automation rules fire.
//!
//! ```text
//! cron/interval tick ──► TaskScheduler job ──┐
//! inbound event ───────► handle_event ───────┤
//! webhook request ─────► handle_webhook ─────┼──► Trigger::fire ──► callback
//! CLI / API ───────────► trigger_manual ─────┤
//! rule completed ──────► handle_chain ───────┘
//! ```
//!
//! Config shape: `{"type": <variant>, <variant>: {...}, "enabled": bool}`.
//! A disabled trigger never invokes its callback; firing it is a no-op.
//! Callback errors and panics are logged and never stop other triggers
//! matched by the same signal.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::engine::TaskScheduler;
use crate::error::{SchedulerError, TriggerError};
use crate::expression::lookup;
use crate::jobs::{JobFn, JobSpec, JobTrigger, job_fn};

/// Invoked when a trigger fires.
pub type TriggerCallback =
    Arc<dyn Fn(Option<TriggerContext>) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Wrap an async closure as a [`TriggerCallback`].
pub fn trigger_callback<F, Fut>(f: F) -> TriggerCallback
where
    F: Fn(Option<TriggerContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)) as BoxFuture<'static, Result<(), String>>)
}

/// What a fired trigger passes to its callback.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TriggerContext {
    pub trigger_type: String,
    pub trigger_id: String,
    pub payload: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

impl TriggerContext {
    pub fn new(trigger_type: &str) -> Self {
        Self {
            trigger_type: trigger_type.to_string(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.trigger_id = id.into();
        self
    }

    /// Use `payload` as the context payload; non-object payloads land under `"value"`.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// The firing condition of a trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerKind {
    /// Timed by the scheduler.
    Schedule { trigger: JobTrigger },
    /// Inbound event with this `event_type`; `filter` maps dotted payload
    /// paths to values that must be equal.
    Event {
        event_type: String,
        filter: Map<String, Value>,
    },
    Webhook { path: String },
    Manual,
    /// Fires when the rule `from_rule` completes.
    Chain { from_rule: String },
}

impl TriggerKind {
    /// Parse the variant from a trigger config.
    pub fn from_config(config: &Value) -> Result<Self, TriggerError> {
        let trigger_type = config
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| TriggerError::config("missing 'type' in trigger config"))?;
        let empty = Value::Object(Map::new());
        let body = config.get(trigger_type).unwrap_or(&empty);

        let required = |key: &str| -> Result<String, TriggerError> {
            body.get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| TriggerError::config(format!("{trigger_type} trigger needs '{key}'")))
        };

        let kind = match trigger_type {
            "schedule" => {
                let args = body.get("arguments").unwrap_or(body);
                let mode = body.get("mode").and_then(Value::as_str).unwrap_or(
                    if args.get("expression").is_some() { "cron" } else { "interval" },
                );
                let trigger = JobTrigger::from_args(mode, args)
                    .map_err(|e| TriggerError::config(e.to_string()))?;
                Self::Schedule { trigger }
            }
            "event" => Self::Event {
                event_type: required("event_type")?,
                filter: body
                    .get("filter")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
            },
            "webhook" => Self::Webhook {
                path: normalize_path(&required("path")?),
            },
            "manual" => Self::Manual,
            "chain" => Self::Chain {
                from_rule: required("from_rule")?,
            },
            other => return Err(TriggerError::UnknownType(other.to_string())),
        };
        Ok(kind)
    }

    pub fn trigger_type(&self) -> &'static str {
        match self {
            Self::Schedule { .. } => "schedule",
            Self::Event { .. } => "event",
            Self::Webhook { .. } => "webhook",
            Self::Manual => "manual",
            Self::Chain { .. } => "chain",
        }
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Event type of an inbound payload: top-level `event_type`, else the
/// Feishu v2 envelope's `header.event_type`.
pub fn event_type_of(payload: &Value) -> Option<&str> {
    payload
        .get("event_type")
        .and_then(Value::as_str)
        .or_else(|| payload.pointer("/header/event_type").and_then(Value::as_str))
}

/// One registered trigger.
pub struct Trigger {
    rule_name: String,
    kind: TriggerKind,
    config: Value,
    callback: TriggerCallback,
    enabled: AtomicBool,
    job_id: Option<String>,
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("rule_name", &self.rule_name)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("job_id", &self.job_id)
            .finish()
    }
}

impl Trigger {
    pub fn new(rule_name: &str, config: &Value, callback: TriggerCallback) -> Result<Self, TriggerError> {
        let kind = TriggerKind::from_config(config)?;
        if let TriggerKind::Chain { from_rule } = &kind
            && from_rule == rule_name
        {
            return Err(TriggerError::config(format!(
                "rule '{rule_name}' cannot chain from itself"
            )));
        }
        Ok(Self {
            rule_name: rule_name.to_string(),
            kind,
            config: config.clone(),
            callback,
            enabled: AtomicBool::new(config.get("enabled").and_then(Value::as_bool).unwrap_or(true)),
            job_id: None,
        })
    }

    pub fn rule_name(&self) -> &str {
        &self.rule_name
    }

    pub fn kind(&self) -> &TriggerKind {
        &self.kind
    }

    pub fn trigger_type(&self) -> &'static str {
        self.kind.trigger_type()
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Scheduler job backing a schedule trigger.
    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Invoke the callback unless disabled. `Ok(false)` means the trigger
    /// was disabled and nothing ran.
    pub async fn invoke(&self, ctx: Option<TriggerContext>) -> Result<bool, String> {
        if !self.is_enabled() {
            tracing::debug!("⏭️ Trigger '{}' is disabled, skipping", self.rule_name);
            return Ok(false);
        }
        match AssertUnwindSafe((self.callback)(ctx)).catch_unwind().await {
            Ok(result) => result.map(|_| true),
            Err(_) => Err(format!("callback for rule '{}' panicked", self.rule_name)),
        }
    }

    /// Fire the trigger, logging a callback failure. Returns whether the
    /// callback was invoked.
    pub async fn fire(&self, ctx: Option<TriggerContext>) -> bool {
        match self.invoke(ctx).await {
            Ok(fired) => {
                if fired {
                    tracing::info!("⚡ Trigger fired: '{}' ({})", self.rule_name, self.trigger_type());
                }
                fired
            }
            Err(e) => {
                tracing::warn!("❌ Trigger '{}' callback failed: {}", self.rule_name, e);
                true
            }
        }
    }

    fn matches_event(&self, event_type: &str, payload: &Map<String, Value>) -> bool {
        match &self.kind {
            TriggerKind::Event {
                event_type: expected,
                filter,
            } => {
                expected == event_type
                    && filter
                        .iter()
                        .all(|(path, want)| lookup(payload, path).unwrap_or(&Value::Null) == want)
            }
            _ => false,
        }
    }
}

/// Owns `rule_name -> Trigger` and dispatches inbound signals.
pub struct TriggerRegistry {
    triggers: RwLock<BTreeMap<String, Arc<Trigger>>>,
    scheduler: Option<Arc<TaskScheduler>>,
}

impl Default for TriggerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerRegistry {
    /// Registry without a scheduler; schedule triggers then only fire on demand.
    pub fn new() -> Self {
        Self {
            triggers: RwLock::new(BTreeMap::new()),
            scheduler: None,
        }
    }

    pub fn with_scheduler(scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            triggers: RwLock::new(BTreeMap::new()),
            scheduler: Some(scheduler),
        }
    }

    pub fn scheduler(&self) -> Option<&Arc<TaskScheduler>> {
        self.scheduler.as_ref()
    }

    /// Job id used for the schedule trigger of `rule_name`.
    pub fn job_id_for(rule_name: &str) -> String {
        format!("trigger:{rule_name}")
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<Trigger>>> {
        self.triggers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<Trigger>>> {
        self.triggers.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Build and store a trigger. Re-registering a name replaces the old
    /// trigger (and its scheduler job).
    pub fn register(
        &self,
        rule_name: &str,
        config: &Value,
        callback: TriggerCallback,
    ) -> Result<Arc<Trigger>, TriggerError> {
        let mut trigger = Trigger::new(rule_name, config, callback)?;
        let scheduled = match (&trigger.kind, &self.scheduler) {
            (TriggerKind::Schedule { trigger: t }, Some(s)) => Some((t.clone(), s.clone())),
            _ => None,
        };

        if let Some((job_trigger, scheduler)) = scheduled {
            let job_id = Self::job_id_for(rule_name);
            let enabled = trigger.is_enabled();
            trigger.job_id = Some(job_id.clone());
            let trigger = Arc::new(trigger);

            scheduler.register_job(JobSpec {
                id: Some(job_id.clone()),
                name: Some(rule_name.to_string()),
                trigger: job_trigger,
                replace_existing: true,
                func: schedule_job(&trigger),
            })?;
            let paused = scheduler.get_job(&job_id).is_some_and(|j| j.paused);
            if !enabled && !paused {
                scheduler.pause_job(&job_id)?;
            } else if enabled && paused {
                scheduler.resume_job(&job_id)?;
            }

            self.write().insert(rule_name.to_string(), trigger.clone());
            tracing::info!("📌 Trigger registered: '{}' (schedule)", rule_name);
            return Ok(trigger);
        }

        if matches!(trigger.kind, TriggerKind::Schedule { .. }) {
            tracing::warn!(
                "⚠️ Schedule trigger '{}' registered without a scheduler; it will not fire on time",
                rule_name
            );
        }

        let trigger = Arc::new(trigger);
        let previous = self.write().insert(rule_name.to_string(), trigger.clone());
        if let Some(old) = previous {
            self.drop_job(&old);
        }
        tracing::info!("📌 Trigger registered: '{}' ({})", rule_name, trigger.trigger_type());
        Ok(trigger)
    }

    fn drop_job(&self, trigger: &Trigger) {
        if let (Some(job_id), Some(scheduler)) = (trigger.job_id(), &self.scheduler) {
            match scheduler.remove_job(job_id) {
                Ok(()) | Err(SchedulerError::JobNotFound(_)) => {}
                Err(e) => tracing::warn!("⚠️ Failed to remove job '{}': {}", job_id, e),
            }
        }
    }

    /// Remove a trigger and its scheduler job. Returns whether it existed.
    pub fn unregister(&self, rule_name: &str) -> bool {
        let removed = self.write().remove(rule_name);
        match removed {
            Some(trigger) => {
                self.drop_job(&trigger);
                tracing::info!("🗑️ Trigger unregistered: '{}'", rule_name);
                true
            }
            None => false,
        }
    }

    pub fn get_trigger(&self, rule_name: &str) -> Option<Arc<Trigger>> {
        self.read().get(rule_name).cloned()
    }

    /// Registered rule names, sorted.
    pub fn list_rules(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn triggers(&self) -> Vec<Arc<Trigger>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn enable(&self, rule_name: &str) -> bool {
        self.set_enabled(rule_name, true)
    }

    pub fn disable(&self, rule_name: &str) -> bool {
        self.set_enabled(rule_name, false)
    }

    fn set_enabled(&self, rule_name: &str, enabled: bool) -> bool {
        let Some(trigger) = self.get_trigger(rule_name) else {
            return false;
        };
        trigger.set_enabled(enabled);
        if let (Some(job_id), Some(scheduler)) = (trigger.job_id(), &self.scheduler) {
            let result = if enabled {
                scheduler.resume_job(job_id)
            } else {
                scheduler.pause_job(job_id)
            };
            if let Err(e) = result {
                tracing::warn!("⚠️ Failed to toggle job '{}': {}", job_id, e);
            }
        }
        tracing::info!(
            "{} Trigger '{}' {}",
            if enabled { "🟢" } else { "⚪" },
            rule_name,
            if enabled { "enabled" } else { "disabled" }
        );
        true
    }

    /// Fire every event trigger matching `payload`. Returns the rules whose
    /// callbacks ran.
    pub async fn handle_event(&self, payload: &Value) -> Vec<String> {
        let Some(event_type) = event_type_of(payload) else {
            tracing::debug!("📭 Event without event_type ignored");
            return Vec::new();
        };
        let fields = payload.as_object().cloned().unwrap_or_default();
        let matching: Vec<Arc<Trigger>> = self
            .read()
            .values()
            .filter(|t| t.matches_event(event_type, &fields))
            .cloned()
            .collect();

        let event_id = payload
            .get("event_id")
            .or_else(|| payload.pointer("/header/event_id"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let mut ctx = TriggerContext::new("event")
            .with_id(event_id)
            .with_payload(payload.clone())
            .with_meta("event_type", event_type);
        if let Some(provider) = payload.get("_provider").and_then(Value::as_str) {
            ctx = ctx.with_meta("provider", provider);
        }
        fire_all(matching, ctx).await
    }

    /// Fire webhook triggers registered for `path`.
    pub async fn handle_webhook(&self, path: &str, payload: &Value) -> Vec<String> {
        let path = normalize_path(path);
        let matching: Vec<Arc<Trigger>> = self
            .read()
            .values()
            .filter(|t| matches!(&t.kind, TriggerKind::Webhook { path: p } if *p == path))
            .cloned()
            .collect();
        let ctx = TriggerContext::new("webhook")
            .with_id(path.clone())
            .with_payload(payload.clone())
            .with_meta("path", path);
        fire_all(matching, ctx).await
    }

    /// Fire the manual trigger `rule_name`.
    pub async fn trigger_manual(&self, rule_name: &str, payload: Option<Value>) -> Vec<String> {
        let matching: Vec<Arc<Trigger>> = self
            .get_trigger(rule_name)
            .filter(|t| t.kind == TriggerKind::Manual)
            .into_iter()
            .collect();
        let ctx = TriggerContext::new("manual")
            .with_id(rule_name)
            .with_payload(payload.unwrap_or(Value::Null))
            .with_meta("fired_at", Utc::now().to_rfc3339());
        fire_all(matching, ctx).await
    }

    /// Fire every chain trigger waiting on `from_rule`.
    pub async fn handle_chain(&self, from_rule: &str, payload: Option<Value>) -> Vec<String> {
        let matching: Vec<Arc<Trigger>> = self
            .read()
            .values()
            .filter(|t| matches!(&t.kind, TriggerKind::Chain { from_rule: f } if f == from_rule))
            .cloned()
            .collect();
        let ctx = TriggerContext::new("chain")
            .with_id(from_rule)
            .with_payload(payload.unwrap_or(Value::Null))
            .with_meta("source_rule", from_rule);
        fire_all(matching, ctx).await
    }
}

async fn fire_all(triggers: Vec<Arc<Trigger>>, ctx: TriggerContext) -> Vec<String> {
    let mut fired = Vec::new();
    for trigger in triggers {
        if trigger.fire(Some(ctx.clone())).await {
            fired.push(trigger.rule_name.clone());
        }
    }
    fired
}

/// Scheduler job that fires a schedule trigger. Callback errors fail the
/// run so they show up in job health and history.
fn schedule_job(trigger: &Arc<Trigger>) -> JobFn {
    let trigger = trigger.clone();
    job_fn(move || {
        let trigger = trigger.clone();
        async move {
            let ctx = TriggerContext::new("schedule")
                .with_id(trigger.job_id().unwrap_or_default())
                .with_meta("fired_at", Utc::now().to_rfc3339());
            trigger.invoke(Some(ctx)).await.map(|_| ())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryJobStore;
    use larkbot_core::config::SchedulerConfig;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting(counter: Arc<AtomicUsize>) -> TriggerCallback {
        trigger_callback(move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn recording(seen: Arc<Mutex<Vec<TriggerContext>>>) -> TriggerCallback {
        trigger_callback(move |ctx| {
            let seen = seen.clone();
            async move {
                if let Some(ctx) = ctx {
                    seen.lock().unwrap().push(ctx);
                }
                Ok(())
            }
        })
    }

    fn scheduler() -> Arc<TaskScheduler> {
        let config = SchedulerConfig {
            health_check_enabled: false,
            ..Default::default()
        };
        TaskScheduler::with_stores(config, Arc::new(MemoryJobStore::new()), None)
    }

    #[test]
    fn test_parse_variants() {
        let kind = TriggerKind::from_config(&json!({
            "type": "schedule",
            "schedule": {"mode": "interval", "arguments": {"minutes": 5}}
        }))
        .unwrap();
        assert_eq!(kind, TriggerKind::Schedule { trigger: JobTrigger::interval(300) });

        let kind = TriggerKind::from_config(&json!({
            "type": "schedule",
            "schedule": {"mode": "cron", "arguments": {"hour": 9, "minute": 0}}
        }))
        .unwrap();
        assert_eq!(kind, TriggerKind::Schedule { trigger: JobTrigger::cron("0 9 * * *") });

        let kind = TriggerKind::from_config(&json!({"type": "webhook", "webhook": {"path": "hooks/x/"}}))
            .unwrap();
        assert_eq!(kind, TriggerKind::Webhook { path: "/hooks/x".into() });

        assert_eq!(
            TriggerKind::from_config(&json!({"type": "manual"})).unwrap(),
            TriggerKind::Manual
        );
    }

    #[test]
    fn test_config_errors() {
        let registry = TriggerRegistry::new();
        let cb = counting(Arc::new(AtomicUsize::new(0)));
        assert!(matches!(
            registry.register("r", &json!({"type": "telepathy"}), cb.clone()),
            Err(TriggerError::UnknownType(_))
        ));
        assert!(registry.register("r", &json!({}), cb.clone()).is_err());
        assert!(registry.register("r", &json!({"type": "event", "event": {}}), cb.clone()).is_err());
        assert!(
            registry
                .register("r", &json!({"type": "chain", "chain": {"from_rule": "r"}}), cb.clone())
                .is_err()
        );
        assert!(
            registry
                .register(
                    "r",
                    &json!({"type": "schedule", "schedule": {"mode": "cron", "arguments": {"expression": "bad"}}}),
                    cb
                )
                .is_err()
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_unregister_manual() {
        let registry = TriggerRegistry::new();
        let cb = counting(Arc::new(AtomicUsize::new(0)));
        registry.register("r1", &json!({"type": "manual", "manual": {}}), cb).unwrap();
        assert!(registry.get_trigger("r1").is_some());
        assert!(registry.unregister("r1"));
        assert!(registry.get_trigger("r1").is_none());
        assert!(!registry.unregister("r1"));
    }

    #[tokio::test]
    async fn test_reregister_replaces() {
        let registry = TriggerRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        registry.register("r", &json!({"type": "manual"}), counting(first.clone())).unwrap();
        registry.register("r", &json!({"type": "manual"}), counting(second.clone())).unwrap();
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.trigger_manual("r", None).await, vec!["r"]);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_event_matching_and_filter() {
        let registry = TriggerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let other = Arc::new(AtomicUsize::new(0));
        registry
            .register(
                "on-message",
                &json!({"type": "event", "event": {"event_type": "im.message.receive_v1"}}),
                recording(seen.clone()),
            )
            .unwrap();
        registry
            .register(
                "vip-only",
                &json!({"type": "event", "event": {
                    "event_type": "im.message.receive_v1",
                    "filter": {"event.sender.id": "vip"}
                }}),
                counting(other.clone()),
            )
            .unwrap();

        let payload = json!({
            "_provider": "feishu",
            "header": {"event_type": "im.message.receive_v1", "event_id": "ev-1"},
            "event": {"sender": {"id": "someone"}}
        });
        assert_eq!(registry.handle_event(&payload).await, vec!["on-message"]);
        assert_eq!(other.load(Ordering::SeqCst), 0);

        let ctx = seen.lock().unwrap()[0].clone();
        assert_eq!(ctx.trigger_type, "event");
        assert_eq!(ctx.trigger_id, "ev-1");
        assert_eq!(ctx.metadata["provider"], "feishu");

        let vip = json!({"event_type": "im.message.receive_v1", "event": {"sender": {"id": "vip"}}});
        assert_eq!(registry.handle_event(&vip).await, vec!["on-message", "vip-only"]);

        assert!(registry.handle_event(&json!({"event_type": "other"})).await.is_empty());
        assert!(registry.handle_event(&json!({"no": "type"})).await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_callback_does_not_block_others() {
        let registry = TriggerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry
            .register(
                "a-fails",
                &json!({"type": "webhook", "webhook": {"path": "/hooks/deploy"}}),
                trigger_callback(|_| async { Err("downstream unavailable".to_string()) }),
            )
            .unwrap();
        registry
            .register(
                "b-panics",
                &json!({"type": "webhook", "webhook": {"path": "/hooks/deploy"}}),
                trigger_callback(|_| async { panic!("boom") }),
            )
            .unwrap();
        registry
            .register(
                "c-counts",
                &json!({"type": "webhook", "webhook": {"path": "/hooks/deploy"}}),
                counting(count.clone()),
            )
            .unwrap();

        let fired = registry.handle_webhook("/hooks/deploy/", &json!({"ref": "main"})).await;
        assert_eq!(fired, vec!["a-fails", "b-panics", "c-counts"]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(registry.handle_webhook("/hooks/unknown", &json!({})).await.is_empty());
    }

    #[tokio::test]
    async fn test_chain_carries_source_rule() {
        let registry = TriggerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(
                "after-report",
                &json!({"type": "chain", "chain": {"from_rule": "daily-report"}}),
                recording(seen.clone()),
            )
            .unwrap();

        assert!(registry.handle_chain("something-else", None).await.is_empty());
        assert_eq!(
            registry.handle_chain("daily-report", Some(json!({"ok": true}))).await,
            vec!["after-report"]
        );
        let ctx = seen.lock().unwrap()[0].clone();
        assert_eq!(ctx.metadata["source_rule"], "daily-report");
        assert_eq!(ctx.payload["ok"], true);
    }

    #[tokio::test]
    async fn test_manual_only_fires_manual_triggers() {
        let registry = TriggerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry
            .register("hook", &json!({"type": "webhook", "webhook": {"path": "/x"}}), counting(count.clone()))
            .unwrap();
        assert!(registry.trigger_manual("hook", None).await.is_empty());
        assert!(registry.trigger_manual("missing", None).await.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_triggers_never_fire() {
        let registry = TriggerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let configs = [
            ("ev", json!({"type": "event", "event": {"event_type": "ping"}, "enabled": false})),
            ("wh", json!({"type": "webhook", "webhook": {"path": "/p"}, "enabled": false})),
            ("man", json!({"type": "manual", "enabled": false})),
            ("ch", json!({"type": "chain", "chain": {"from_rule": "up"}, "enabled": false})),
            ("sch", json!({"type": "schedule", "schedule": {"arguments": {"seconds": 1}}, "enabled": false})),
        ];
        for (name, config) in &configs {
            registry.register(name, config, counting(count.clone())).unwrap();
        }

        assert!(registry.handle_event(&json!({"event_type": "ping"})).await.is_empty());
        assert!(registry.handle_webhook("/p", &json!({})).await.is_empty());
        assert!(registry.trigger_manual("man", None).await.is_empty());
        assert!(registry.handle_chain("up", None).await.is_empty());
        for trigger in registry.triggers() {
            assert!(!trigger.fire(None).await);
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Re-enabling restores firing
        assert!(registry.enable("man"));
        assert_eq!(registry.trigger_manual("man", None).await, vec!["man"]);
        assert!(registry.disable("man"));
        assert!(registry.trigger_manual("man", None).await.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!registry.enable("missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_trigger_fires_on_interval() {
        let scheduler = scheduler();
        let registry = TriggerRegistry::with_scheduler(scheduler.clone());
        let count = Arc::new(AtomicUsize::new(0));
        let trigger = registry
            .register(
                "tick",
                &json!({"type": "schedule", "schedule": {"mode": "interval", "arguments": {"seconds": 1}}}),
                counting(count.clone()),
            )
            .unwrap();
        assert_eq!(trigger.job_id(), Some("trigger:tick"));
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);
        assert!(scheduler.job_health("trigger:tick").unwrap().total_runs >= 2);

        assert!(registry.unregister("tick"));
        assert!(scheduler.get_job("trigger:tick").is_none());
        let fired = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(count.load(Ordering::SeqCst), fired);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_schedule_trigger_pauses_job() {
        let scheduler = scheduler();
        let registry = TriggerRegistry::with_scheduler(scheduler.clone());
        let count = Arc::new(AtomicUsize::new(0));
        registry
            .register(
                "quiet",
                &json!({"type": "schedule", "schedule": {"arguments": {"seconds": 1}}, "enabled": false}),
                counting(count.clone()),
            )
            .unwrap();
        assert!(scheduler.get_job("trigger:quiet").unwrap().paused);
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        registry.enable("quiet");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }

    #[test]
    fn test_replacing_schedule_with_manual_drops_job() {
        let scheduler = scheduler();
        let registry = TriggerRegistry::with_scheduler(scheduler.clone());
        let cb = counting(Arc::new(AtomicUsize::new(0)));
        registry
            .register("r", &json!({"type": "schedule", "schedule": {"arguments": {"hours": 1}}}), cb.clone())
            .unwrap();
        assert!(scheduler.get_job("trigger:r").is_some());
        registry.register("r", &json!({"type": "manual"}), cb).unwrap();
        assert!(scheduler.get_job("trigger:r").is_none());
    }
}
