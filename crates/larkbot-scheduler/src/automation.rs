//! Automation engine: turns configuration into running rules.
//!
//! An automation rule pairs a trigger with either a task or a workflow
//! template:
//!
//! ```toml
//! [[automations]]
//! name = "morning-report"
//! workflow = "daily_report"
//! params = { report_url = "https://status.example.com/daily", target = "oc_ops" }
//! [automations.trigger]
//! type = "schedule"
//! schedule = { mode = "cron", arguments = { expression = "0 9 * * 1-5" } }
//! ```
//!
//! When a rule finishes, chain triggers waiting on it fire with
//! `{source_rule, success, error, result}` as payload. Chains are cut off
//! after [`MAX_CHAIN_DEPTH`] hops.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use larkbot_core::{CircuitBreakerRegistry, LarkbotConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::dispatch::{LogMessageSender, MessageSender, WebhookMessageSender};
use crate::engine::TaskScheduler;
use crate::error::AutomationError;
use crate::executor::{TaskExecutor, TaskRunResult};
use crate::tasks::TaskDefinition;
use crate::templates::{WorkflowTemplate, WorkflowTemplateRegistry, create_default_template_registry};
use crate::triggers::{TriggerCallback, TriggerContext, TriggerKind, TriggerRegistry, trigger_callback};
use crate::workflow::{
    ActionExecutor, ActionResult, CircuitBreakerExecutor, WorkflowExecution, WorkflowOrchestrator,
    WorkflowStatus,
};

/// Chain hops allowed after the rule that started a run.
pub const MAX_CHAIN_DEPTH: usize = 8;

/// Workflow step action that runs a registered task.
pub const RUN_TASK_ACTION: &str = "run_task";

const CHAIN_DEPTH_KEY: &str = "_chain_depth";

/// Trigger plus what to run when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Trigger config, `{"type": ..., <type>: {...}, "enabled": bool}`.
    pub trigger: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    /// Workflow template name.
    #[serde(default, alias = "template", skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    /// Seed values for the task or workflow context.
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTarget<'a> {
    Task(&'a str),
    Workflow(&'a str),
}

impl AutomationRule {
    pub fn task(name: &str, trigger: Value, task: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            trigger,
            task: Some(task.to_string()),
            workflow: None,
            params: Map::new(),
        }
    }

    pub fn workflow(name: &str, trigger: Value, template: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            trigger,
            task: None,
            workflow: Some(template.to_string()),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Exactly one of `task` / `workflow` must be set.
    pub fn target(&self) -> Result<RuleTarget<'_>, AutomationError> {
        match (&self.task, &self.workflow) {
            (Some(task), None) => Ok(RuleTarget::Task(task)),
            (None, Some(workflow)) => Ok(RuleTarget::Workflow(workflow)),
            (Some(_), Some(_)) => Err(self.invalid("set either 'task' or 'workflow', not both")),
            (None, None) => Err(self.invalid("needs a 'task' or a 'workflow'")),
        }
    }

    fn invalid(&self, message: &str) -> AutomationError {
        AutomationError::InvalidRule {
            name: self.name.clone(),
            message: message.to_string(),
        }
    }
}

/// Result of one rule run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Task(TaskRunResult),
    Workflow(WorkflowExecution),
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        match self {
            Self::Task(r) => r.success,
            Self::Workflow(e) => e.status == WorkflowStatus::Completed,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Task(r) => r.error.as_deref(),
            Self::Workflow(e) => e.error.as_deref(),
        }
    }

    /// Final context of the run.
    pub fn context(&self) -> &Map<String, Value> {
        match self {
            Self::Task(r) => &r.context,
            Self::Workflow(e) => &e.context,
        }
    }

    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        match self {
            Self::Task(r) => format!(
                "task '{}': {} ({} actions, {}ms)",
                r.task_name,
                if r.success { "ok" } else { "failed" },
                r.actions.len(),
                r.duration_ms
            ),
            Self::Workflow(e) => format!(
                "workflow '{}': {} (steps run: {})",
                e.workflow_id,
                e.status,
                e.execution_order.join(" → ")
            ),
        }
    }
}

type TaskTable = Arc<RwLock<BTreeMap<String, TaskDefinition>>>;

fn read_tasks(tasks: &TaskTable) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, TaskDefinition>> {
    tasks.read().unwrap_or_else(|e| e.into_inner())
}

/// Task actions plus `run_task`.
struct RuleActions {
    executor: Arc<TaskExecutor>,
    tasks: TaskTable,
}

#[async_trait]
impl ActionExecutor for RuleActions {
    async fn execute(
        &self,
        action_type: &str,
        config: &Value,
        context: &mut Map<String, Value>,
    ) -> Result<ActionResult, String> {
        if action_type != RUN_TASK_ACTION {
            return self.executor.execute(action_type, config, context).await;
        }
        let name = config
            .get("task")
            .and_then(Value::as_str)
            .ok_or("run_task needs 'task'")?;
        let task = read_tasks(&self.tasks)
            .get(name)
            .cloned()
            .ok_or_else(|| format!("task '{name}' not found"))?;

        let result = self.executor.execute_task(&task, Some(context.clone())).await;
        if !result.success {
            return Ok(ActionResult::failed(
                result.error.unwrap_or_else(|| format!("task '{name}' failed")),
            ));
        }
        let mut output = Map::new();
        output.insert("task".into(), json!(name));
        output.insert("actions".into(), json!(result.actions.len()));
        output.insert(
            "result".into(),
            result.context.get("last_result").cloned().unwrap_or(Value::Null),
        );
        Ok(ActionResult::with_output(output))
    }
}

struct EngineInner {
    scheduler: Option<Arc<TaskScheduler>>,
    triggers: TriggerRegistry,
    orchestrator: WorkflowOrchestrator,
    executor: Arc<TaskExecutor>,
    templates: WorkflowTemplateRegistry,
    tasks: TaskTable,
    rules: RwLock<BTreeMap<String, AutomationRule>>,
    problems: RwLock<Vec<String>>,
}

/// Tasks, templates and rules wired onto triggers, the orchestrator and
/// the scheduler.
pub struct AutomationEngine {
    inner: Arc<EngineInner>,
}

impl AutomationEngine {
    /// Engine with built-in templates, default retry and no preset breakers.
    pub fn new(scheduler: Option<Arc<TaskScheduler>>, executor: TaskExecutor) -> Self {
        Self::assemble(
            scheduler,
            executor,
            RetryPolicy::default(),
            Arc::new(CircuitBreakerRegistry::new()),
        )
    }

    /// Build everything from configuration. Malformed task, template or
    /// automation entries are skipped and listed in [`Self::problems`].
    pub fn from_config(config: &LarkbotConfig) -> Result<Self, AutomationError> {
        let scheduler = if config.scheduler.enabled {
            Some(TaskScheduler::from_config(config.scheduler.clone())?)
        } else {
            tracing::info!("⏸️ Scheduler disabled in configuration; schedule triggers will not fire");
            None
        };
        let sender: Arc<dyn MessageSender> = if config.messaging.webhook_url.is_empty() {
            Arc::new(LogMessageSender)
        } else {
            Arc::new(WebhookMessageSender::new(config.messaging.webhook_url.clone()))
        };
        let engine = Self::assemble(
            scheduler,
            TaskExecutor::new(sender),
            RetryPolicy::from(&config.workflow),
            Arc::new(CircuitBreakerRegistry::from_settings(&config.circuit_breakers)),
        );
        engine.load(config);
        Ok(engine)
    }

    fn assemble(
        scheduler: Option<Arc<TaskScheduler>>,
        executor: TaskExecutor,
        retry: RetryPolicy,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        let executor = Arc::new(executor);
        let tasks: TaskTable = Arc::new(RwLock::new(BTreeMap::new()));
        let actions = Arc::new(RuleActions {
            executor: executor.clone(),
            tasks: tasks.clone(),
        });
        let guarded = Arc::new(CircuitBreakerExecutor::new(actions, breakers));
        let triggers = match &scheduler {
            Some(s) => TriggerRegistry::with_scheduler(s.clone()),
            None => TriggerRegistry::new(),
        };
        Self {
            inner: Arc::new(EngineInner {
                scheduler,
                triggers,
                orchestrator: WorkflowOrchestrator::with_retry(guarded, retry),
                executor,
                templates: create_default_template_registry(),
                tasks,
                rules: RwLock::new(BTreeMap::new()),
                problems: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Register config entries in dependency order: tasks, templates, rules.
    fn load(&self, config: &LarkbotConfig) {
        let mut problems = Vec::new();

        for (i, raw) in config.tasks.iter().enumerate() {
            let result = TaskDefinition::from_value(raw.clone())
                .map_err(|e| format!("tasks[{i}]: {e}"))
                .and_then(|task| self.register_task(task).map_err(|e| e.to_string()));
            if let Err(e) = result {
                problems.push(e);
            }
        }
        for (i, raw) in config.task_templates.iter().enumerate() {
            let result = WorkflowTemplate::from_value(raw.clone())
                .map_err(|e| format!("task_templates[{i}]: {e}"))
                .and_then(|t| {
                    let name = t.name.clone();
                    self.register_template(t).map_err(|e| format!("template '{name}': {e}"))
                });
            if let Err(e) = result {
                problems.push(e);
            }
        }
        for (i, raw) in config.automations.iter().enumerate() {
            let result = AutomationRule::from_value(raw.clone())
                .map_err(|e| format!("automations[{i}]: {e}"))
                .and_then(|rule| self.add_rule(rule).map_err(|e| e.to_string()));
            if let Err(e) = result {
                problems.push(e);
            }
        }

        for p in &problems {
            tracing::warn!("⚠️ Config entry skipped: {}", p);
        }
        tracing::info!(
            "🤖 Automation engine loaded: {} tasks, {} templates, {} rules",
            read_tasks(&self.inner.tasks).len(),
            self.inner.templates.len(),
            self.inner.rules.read().unwrap_or_else(|e| e.into_inner()).len()
        );
        *self.inner.problems.write().unwrap_or_else(|e| e.into_inner()) = problems;
    }

    /// Config entries rejected by [`Self::from_config`].
    pub fn problems(&self) -> Vec<String> {
        self.inner.problems.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn register_task(&self, task: TaskDefinition) -> Result<(), AutomationError> {
        task.validate().map_err(|problems| AutomationError::InvalidTask {
            name: task.name.clone(),
            problems,
        })?;
        tracing::debug!("📋 Task registered: '{}'", task.name);
        self.inner
            .tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.name.clone(), task);
        Ok(())
    }

    pub fn register_template(&self, template: WorkflowTemplate) -> Result<(), crate::error::WorkflowError> {
        self.inner.templates.register(template)
    }

    /// Register a rule and its trigger. A rule with the same name is replaced.
    pub fn add_rule(&self, rule: AutomationRule) -> Result<(), AutomationError> {
        match rule.target()? {
            RuleTarget::Task(task) if !read_tasks(&self.inner.tasks).contains_key(task) => {
                return Err(AutomationError::UnknownTask(task.to_string()));
            }
            RuleTarget::Workflow(template) if self.inner.templates.get(template).is_none() => {
                return Err(AutomationError::UnknownTemplate(template.to_string()));
            }
            _ => {}
        }

        let callback = rule_callback(Arc::downgrade(&self.inner), rule.name.clone());
        self.inner.triggers.register(&rule.name, &rule.trigger, callback)?;
        tracing::info!("🤖 Automation '{}' ready", rule.name);
        self.inner
            .rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(rule.name.clone(), rule);
        Ok(())
    }

    /// Remove a rule and its trigger.
    pub fn remove_rule(&self, name: &str) -> bool {
        let removed = self
            .inner
            .rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some();
        self.inner.triggers.unregister(name);
        removed
    }

    pub fn rule(&self, name: &str) -> Option<AutomationRule> {
        self.inner.rule(name)
    }

    pub fn rules(&self) -> Vec<AutomationRule> {
        self.inner
            .rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn tasks(&self) -> Vec<TaskDefinition> {
        read_tasks(&self.inner.tasks).values().cloned().collect()
    }

    pub fn triggers(&self) -> &TriggerRegistry {
        &self.inner.triggers
    }

    pub fn templates(&self) -> &WorkflowTemplateRegistry {
        &self.inner.templates
    }

    pub fn orchestrator(&self) -> &WorkflowOrchestrator {
        &self.inner.orchestrator
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.inner.executor
    }

    pub fn scheduler(&self) -> Option<&Arc<TaskScheduler>> {
        self.inner.scheduler.as_ref()
    }

    /// Start the scheduler, if there is one.
    pub fn start(&self) -> Result<(), AutomationError> {
        if let Some(scheduler) = &self.inner.scheduler {
            scheduler.start()?;
        }
        tracing::info!("🚀 Automation engine started ({} rules)", self.inner.triggers.len());
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Some(scheduler) = &self.inner.scheduler {
            scheduler.shutdown();
        }
        tracing::info!("🛑 Automation engine stopped");
    }

    /// Run a rule now, whatever its trigger type. Chain triggers fire
    /// afterwards as for any other run.
    pub async fn run_rule(&self, name: &str, payload: Option<Value>) -> Result<RunOutcome, AutomationError> {
        let ctx = TriggerContext::new("manual")
            .with_id(name)
            .with_payload(payload.unwrap_or(Value::Null));
        self.inner.execute_rule(name, ctx, 0).await
    }

    /// Route an inbound event to event triggers.
    pub async fn handle_event(&self, payload: &Value) -> Vec<String> {
        self.inner.triggers.handle_event(payload).await
    }

    /// Route an inbound webhook request to webhook triggers.
    pub async fn handle_webhook(&self, path: &str, payload: &Value) -> Vec<String> {
        self.inner.triggers.handle_webhook(path, payload).await
    }
}

fn rule_callback(engine: Weak<EngineInner>, rule_name: String) -> TriggerCallback {
    trigger_callback(move |ctx| {
        let engine = engine.clone();
        let rule_name = rule_name.clone();
        async move {
            let Some(engine) = engine.upgrade() else {
                return Ok(());
            };
            let ctx = ctx.unwrap_or_else(|| TriggerContext::new("manual").with_id(rule_name.as_str()));
            let depth = match ctx.trigger_type.as_str() {
                "chain" => ctx
                    .payload
                    .get(CHAIN_DEPTH_KEY)
                    .and_then(Value::as_u64)
                    .unwrap_or(1) as usize,
                _ => 0,
            };
            let outcome = engine
                .execute_rule(&rule_name, ctx, depth)
                .await
                .map_err(|e| e.to_string())?;
            if outcome.success() {
                Ok(())
            } else {
                Err(outcome.error().unwrap_or("run failed").to_string())
            }
        }
    })
}

impl EngineInner {
    fn rule(&self, name: &str) -> Option<AutomationRule> {
        self.rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    async fn execute_rule(
        &self,
        name: &str,
        ctx: TriggerContext,
        depth: usize,
    ) -> Result<RunOutcome, AutomationError> {
        let rule = self
            .rule(name)
            .ok_or_else(|| AutomationError::RuleNotFound(name.to_string()))?;
        tracing::info!("⚡ Automation '{}' fired ({})", name, ctx.trigger_type);

        let mut initial = rule.params.clone();
        initial.insert("rule_name".into(), json!(name));
        initial
            .entry("payload")
            .or_insert_with(|| Value::Object(ctx.payload.clone()));
        initial.insert(
            "trigger".into(),
            serde_json::to_value(&ctx).unwrap_or(Value::Null),
        );

        let outcome = match rule.target()? {
            RuleTarget::Task(task_name) => {
                let task = read_tasks(&self.tasks)
                    .get(task_name)
                    .cloned()
                    .ok_or_else(|| AutomationError::UnknownTask(task_name.to_string()))?;
                RunOutcome::Task(self.executor.execute_task(&task, Some(initial)).await)
            }
            RuleTarget::Workflow(template) => {
                let (steps, context) = self
                    .templates
                    .instantiate_with(template, initial)
                    .ok_or_else(|| AutomationError::UnknownTemplate(template.to_string()))?;
                let workflow_id = WorkflowOrchestrator::new_workflow_id();
                let handle = self
                    .orchestrator
                    .execute_workflow(&workflow_id, name, steps, Some(context))
                    .await;
                let execution = handle.read().unwrap_or_else(|e| e.into_inner()).clone();
                // The outcome carries the full record; the table only tracks live runs
                self.orchestrator.evict_execution(&workflow_id);
                RunOutcome::Workflow(execution)
            }
        };

        if outcome.success() {
            tracing::info!("✅ Automation '{}' done: {}", name, outcome.summary());
        } else {
            tracing::warn!(
                "❌ Automation '{}' failed: {}",
                name,
                outcome.error().unwrap_or("see step results")
            );
        }
        self.dispatch_chain(name, &outcome, depth).await;
        Ok(outcome)
    }

    async fn dispatch_chain(&self, name: &str, outcome: &RunOutcome, depth: usize) {
        if depth >= MAX_CHAIN_DEPTH {
            let waiting = self
                .triggers
                .triggers()
                .iter()
                .any(|t| matches!(t.kind(), TriggerKind::Chain { from_rule } if from_rule == name));
            if waiting {
                tracing::warn!(
                    "⛓️ Chain depth {} reached at '{}'; downstream rules not fired",
                    MAX_CHAIN_DEPTH,
                    name
                );
            }
            return;
        }

        let mut payload = Map::new();
        payload.insert("source_rule".into(), json!(name));
        payload.insert("success".into(), json!(outcome.success()));
        payload.insert("error".into(), json!(outcome.error()));
        payload.insert(
            "result".into(),
            outcome.context().get("last_result").cloned().unwrap_or(Value::Null),
        );
        payload.insert(CHAIN_DEPTH_KEY.into(), json!(depth + 1));

        let fired = self.triggers.handle_chain(name, Some(Value::Object(payload))).await;
        if !fired.is_empty() {
            tracing::debug!("⛓️ '{}' chained into {:?}", name, fired);
        }
    }
}
