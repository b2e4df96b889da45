//! Workflow orchestrator: runs a step graph as one [`WorkflowExecution`].
//!
//! ## Step loop
//! ```text
//! order steps topologically (declaration order breaks ties)
//!   for each step:
//!     cancel requested?          → CANCELLED, stop
//!     condition false?           → skipped
//!     dependency unmet?          → skipped, or FAILED when a success
//!                                  dependency failed and on_error = fail
//!     substitute ${vars} → action_executor(action_type, config, context)
//!       ok    → merge output into context
//!       error → fail: FAILED, stop | continue: record, go on | retry: backoff, then fail
//! all steps done → COMPLETED
//! ```
//!
//! Steps run sequentially. Actions never raise out of `execute_workflow`:
//! every outcome, including a panic, ends up on the execution record.

use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use larkbot_core::reliability::{CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry};
use larkbot_core::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ActionError, ActionErrorKind, WorkflowError};
use crate::expression;
use crate::vars;

// ─── Step definitions ──────────────────────────────────────

/// How a dependency edge must be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// Predecessor completed without error.
    #[default]
    Success,
    /// Predecessor ran to the end, successfully or not.
    Completion,
    /// Predecessor failed.
    Failure,
    /// Predecessor finished in any way, including skipped.
    Any,
}

impl DependencyType {
    fn is_satisfied_by(self, status: StepStatus) -> bool {
        match self {
            Self::Success => status == StepStatus::Completed,
            Self::Completion => matches!(status, StepStatus::Completed | StepStatus::Failed),
            Self::Failure => status == StepStatus::Failed,
            Self::Any => status.is_finished(),
        }
    }
}

/// A dependency edge. Deserializes from `"fetch"` or `{"step": "fetch", "type": "completion"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DependencyRepr", into = "DependencyRepr")]
pub struct Dependency {
    pub step: String,
    pub dep_type: DependencyType,
}

impl Dependency {
    pub fn on(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            dep_type: DependencyType::Success,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum DependencyRepr {
    Name(String),
    Edge {
        step: String,
        #[serde(default, rename = "type")]
        dep_type: DependencyType,
    },
}

impl From<DependencyRepr> for Dependency {
    fn from(repr: DependencyRepr) -> Self {
        match repr {
            DependencyRepr::Name(step) => Self::on(step),
            DependencyRepr::Edge { step, dep_type } => Self { step, dep_type },
        }
    }
}

impl From<Dependency> for DependencyRepr {
    fn from(dep: Dependency) -> Self {
        match dep.dep_type {
            DependencyType::Success => Self::Name(dep.step),
            dep_type => Self::Edge {
                step: dep.step,
                dep_type,
            },
        }
    }
}

/// What a failing step does to the rest of the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Fail,
    Continue,
    Retry,
}

/// One node of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    #[serde(alias = "action")]
    pub action_type: String,
    #[serde(default = "empty_object")]
    pub config: Value,
    #[serde(default)]
    pub depends_on: Vec<Dependency>,
    /// Evaluated against the context; absent means unconditional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub on_error: OnError,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl WorkflowStep {
    pub fn new(name: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action_type: action_type.into(),
            config: empty_object(),
            depends_on: Vec::new(),
            condition: None,
            on_error: OnError::Fail,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(Dependency::on(step));
        self
    }

    pub fn depends_on_with(mut self, step: impl Into<String>, dep_type: DependencyType) -> Self {
        self.depends_on.push(Dependency {
            step: step.into(),
            dep_type,
        });
        self
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }
}

/// Topological order of `steps` (indices), ties broken by declaration order.
pub fn resolve_order(steps: &[WorkflowStep]) -> Result<Vec<usize>, WorkflowError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        if index.insert(step.name.as_str(), i).is_some() {
            return Err(WorkflowError::DuplicateStep(step.name.clone()));
        }
    }

    let mut in_degree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let &j = index
                .get(dep.step.as_str())
                .ok_or_else(|| WorkflowError::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dep.step.clone(),
                })?;
            in_degree[i] += 1;
            dependents[j].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() < steps.len() {
        let stuck = (0..steps.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| steps[i].name.clone())
            .collect();
        return Err(WorkflowError::Cycle(stuck));
    }
    Ok(order)
}

// ─── Execution state ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
    Waiting,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Paused => "PAUSED",
            Self::Waiting => "WAITING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Outcome of one step within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub error: Option<String>,
    /// Why the step was skipped.
    pub skip_reason: Option<String>,
    pub output: Map<String, Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Pending,
            attempts: 0,
            error: None,
            skip_reason: None,
            output: Map::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// One run of a step graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub rule_name: String,
    pub status: WorkflowStatus,
    /// Per-step records, in declaration order.
    pub steps: Vec<StepRecord>,
    /// Steps whose action was invoked, in invocation order.
    pub execution_order: Vec<String>,
    pub context: Map<String, Value>,
    pub error: Option<String>,
    /// Steps that failed, including `continue` failures.
    pub failed_steps: Vec<String>,
    /// Set by `cancel_execution` on a running execution; honoured before the next step.
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(workflow_id: &str, rule_name: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            rule_name: rule_name.to_string(),
            status: WorkflowStatus::Pending,
            steps: Vec::new(),
            execution_order: Vec::new(),
            context: Map::new(),
            error: None,
            failed_steps: Vec::new(),
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    fn step_mut(&mut self, name: &str) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        Some((self.finished_at? - self.started_at?).num_milliseconds())
    }

    fn finish(&mut self, status: WorkflowStatus, error: Option<String>) {
        self.status = status;
        if error.is_some() {
            self.error = error;
        }
        self.finished_at = Some(Utc::now());
    }
}

/// Shared handle to an execution; `get_execution` returns the same `Arc`.
pub type ExecutionHandle = Arc<RwLock<WorkflowExecution>>;

// ─── Actions ───────────────────────────────────────────────

/// Result of one action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ActionErrorKind>,
}

impl ActionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn with_output(output: Map<String, Value>) -> Self {
        Self {
            success: true,
            output,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn from_error(error: ActionError) -> Self {
        Self {
            success: false,
            error: Some(error.message),
            error_kind: Some(error.kind),
            ..Default::default()
        }
    }

    /// Collapse into `Ok(output)` / `Err(reason)`.
    pub fn into_result(self) -> Result<Map<String, Value>, String> {
        if self.success {
            Ok(self.output)
        } else {
            Err(self.error.unwrap_or_else(|| "action reported failure".into()))
        }
    }
}

/// Performs the side effect of a step. The orchestrator has no
/// action-specific logic of its own.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        action_type: &str,
        config: &Value,
        context: &mut Map<String, Value>,
    ) -> Result<ActionResult, String>;
}

/// Wraps an [`ActionExecutor`] with one circuit breaker per action type.
///
/// Breakers see failures as [`ActionError`]s, so `excluded_errors` names
/// [`ActionErrorKind`]s (`"Timeout"`, `"HttpStatus"`, ...). Executor errors
/// and failures without a kind count as `"Failed"`.
pub struct CircuitBreakerExecutor {
    inner: Arc<dyn ActionExecutor>,
    breakers: Arc<CircuitBreakerRegistry>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerExecutor {
    pub fn new(inner: Arc<dyn ActionExecutor>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            inner,
            breakers,
            config: CircuitBreakerConfig::default(),
        }
    }

    /// Config for breakers this executor creates; pre-created ones keep theirs.
    pub fn with_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }
}

#[async_trait]
impl ActionExecutor for CircuitBreakerExecutor {
    async fn execute(
        &self,
        action_type: &str,
        config: &Value,
        context: &mut Map<String, Value>,
    ) -> Result<ActionResult, String> {
        let inner = &self.inner;
        let result = self
            .breakers
            .call_classified(
                action_type,
                self.config.clone(),
                || async move {
                    let outcome: Result<Map<String, Value>, ActionError> =
                        match inner.execute(action_type, config, context).await {
                            Ok(ActionResult { success: true, output, .. }) => Ok(output),
                            Ok(ActionResult { error, error_kind, .. }) => Err(ActionError::new(
                                error_kind.unwrap_or(ActionErrorKind::Failed),
                                error.unwrap_or_else(|| "action reported failure".into()),
                            )),
                            Err(e) => Err(ActionError::from(e)),
                        };
                    outcome
                },
                ActionError::kind_name,
            )
            .await;
        match result {
            Ok(output) => Ok(ActionResult::with_output(output)),
            Err(CircuitBreakerError::Open { name }) => Err(format!("circuit '{name}' is open")),
            Err(CircuitBreakerError::Inner(e)) => Err(e.message),
        }
    }
}

// ─── Orchestrator ──────────────────────────────────────────

enum StepOutcome {
    Done,
    Stop,
}

/// Runs workflows and keeps the `workflow_id -> execution` table.
pub struct WorkflowOrchestrator {
    executor: Arc<dyn ActionExecutor>,
    retry: RetryPolicy,
    executions: Mutex<HashMap<String, ExecutionHandle>>,
}

impl WorkflowOrchestrator {
    pub fn new(executor: Arc<dyn ActionExecutor>) -> Self {
        Self::with_retry(executor, RetryPolicy::default())
    }

    /// `retry` governs steps with `on_error = "retry"`.
    pub fn with_retry(executor: Arc<dyn ActionExecutor>, retry: RetryPolicy) -> Self {
        Self {
            executor,
            retry,
            executions: Mutex::new(HashMap::new()),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// A fresh, unique workflow id.
    pub fn new_workflow_id() -> String {
        format!("wf-{}", Uuid::new_v4())
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, ExecutionHandle>> {
        self.executions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a PENDING execution that a later `execute_workflow` with the
    /// same id adopts. Returns the existing handle if one is registered.
    pub fn prepare_execution(&self, workflow_id: &str, rule_name: &str) -> ExecutionHandle {
        self.table()
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(WorkflowExecution::new(workflow_id, rule_name))))
            .clone()
    }

    pub fn get_execution(&self, workflow_id: &str) -> Option<ExecutionHandle> {
        self.table().get(workflow_id).cloned()
    }

    /// Cloned state of an execution.
    pub fn snapshot(&self, workflow_id: &str) -> Option<WorkflowExecution> {
        self.get_execution(workflow_id).map(|h| read(&h).clone())
    }

    /// Cancel a PENDING or RUNNING execution. A pending one never starts; a
    /// running one finishes its in-flight step and then becomes CANCELLED.
    pub fn cancel_execution(&self, workflow_id: &str) -> bool {
        let Some(handle) = self.get_execution(workflow_id) else {
            return false;
        };
        let mut exec = write(&handle);
        match exec.status {
            WorkflowStatus::Pending => {
                exec.finish(WorkflowStatus::Cancelled, None);
                tracing::info!("🚫 Workflow '{}' cancelled before start", workflow_id);
                true
            }
            WorkflowStatus::Running if !exec.cancel_requested => {
                exec.cancel_requested = true;
                tracing::info!("🚫 Workflow '{}' cancellation requested", workflow_id);
                true
            }
            _ => false,
        }
    }

    /// Snapshots of all known executions, oldest first.
    pub fn list_executions(&self) -> Vec<WorkflowExecution> {
        let mut all: Vec<WorkflowExecution> = self.table().values().map(|h| read(h).clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Drop a finished execution from the table.
    pub fn evict_execution(&self, workflow_id: &str) -> bool {
        let mut table = self.table();
        let finished = table
            .get(workflow_id)
            .is_some_and(|h| read(h).status.is_terminal());
        finished && table.remove(workflow_id).is_some()
    }

    /// Drop every finished execution. Returns how many were evicted.
    pub fn evict_finished(&self) -> usize {
        let mut table = self.table();
        let before = table.len();
        table.retain(|_, h| !read(h).status.is_terminal());
        before - table.len()
    }

    /// Run `steps` as execution `workflow_id`. Never fails: configuration
    /// and action errors end up on the returned execution.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        rule_name: &str,
        steps: Vec<WorkflowStep>,
        initial_context: Option<Map<String, Value>>,
    ) -> ExecutionHandle {
        let handle = self.adopt_or_create(workflow_id, rule_name);
        let mut context = initial_context.unwrap_or_default();

        {
            let mut exec = write(&handle);
            if exec.status != WorkflowStatus::Pending {
                // Cancelled before start
                return handle.clone();
            }
            exec.steps = steps.iter().map(|s| StepRecord::pending(&s.name)).collect();
            exec.context = context.clone();
            exec.status = WorkflowStatus::Running;
            exec.started_at = Some(Utc::now());
        }
        tracing::info!(
            "🚀 Workflow '{}' started for rule '{}' ({} steps)",
            workflow_id,
            rule_name,
            steps.len()
        );

        let order = match resolve_order(&steps) {
            Ok(order) => order,
            Err(e) => {
                tracing::warn!("❌ Workflow '{}' rejected: {}", workflow_id, e);
                write(&handle).finish(WorkflowStatus::Failed, Some(e.to_string()));
                return handle;
            }
        };

        for i in order {
            if let StepOutcome::Stop = self.run_step(&handle, &steps[i], &mut context).await {
                break;
            }
        }

        let mut exec = write(&handle);
        if exec.status == WorkflowStatus::Running {
            // A cancel accepted during the last step still wins once it resolves
            let status = if exec.cancel_requested {
                WorkflowStatus::Cancelled
            } else {
                WorkflowStatus::Completed
            };
            exec.finish(status, None);
        }
        match exec.status {
            WorkflowStatus::Completed if exec.failed_steps.is_empty() => {
                tracing::info!("✅ Workflow '{}' completed", workflow_id);
            }
            WorkflowStatus::Completed => tracing::info!(
                "✅ Workflow '{}' completed with failed steps: {}",
                workflow_id,
                exec.failed_steps.join(", ")
            ),
            status => tracing::warn!(
                "⚠️ Workflow '{}' ended {}: {}",
                workflow_id,
                status,
                exec.error.as_deref().unwrap_or("-")
            ),
        }
        drop(exec);
        handle
    }

    fn adopt_or_create(&self, workflow_id: &str, rule_name: &str) -> ExecutionHandle {
        let mut table = self.table();
        if let Some(existing) = table.get(workflow_id) {
            let status = read(existing).status;
            if matches!(status, WorkflowStatus::Pending | WorkflowStatus::Cancelled) {
                return existing.clone();
            }
            tracing::warn!(
                "⚠️ Workflow id '{}' reused ({}), replacing the old execution",
                workflow_id,
                status
            );
        }
        let handle = Arc::new(RwLock::new(WorkflowExecution::new(workflow_id, rule_name)));
        table.insert(workflow_id.to_string(), handle.clone());
        handle
    }

    async fn run_step(
        &self,
        handle: &ExecutionHandle,
        step: &WorkflowStep,
        context: &mut Map<String, Value>,
    ) -> StepOutcome {
        {
            let mut exec = write(handle);
            if exec.cancel_requested {
                exec.finish(WorkflowStatus::Cancelled, None);
                tracing::info!("🚫 Workflow '{}' cancelled before step '{}'", exec.workflow_id, step.name);
                return StepOutcome::Stop;
            }
        }

        if let Some(condition) = &step.condition {
            match expression::evaluate(condition, context) {
                Ok(true) => {}
                Ok(false) => {
                    skip(handle, &step.name, format!("condition `{condition}` is false"));
                    return StepOutcome::Done;
                }
                Err(e) => {
                    return self.step_failed(handle, step, 0, e.to_string());
                }
            }
        }

        let unmet = {
            let exec = read(handle);
            step.depends_on
                .iter()
                .filter_map(|dep| {
                    let status = exec.step(&dep.step).map_or(StepStatus::Pending, |s| s.status);
                    (!dep.dep_type.is_satisfied_by(status)).then_some((dep, status))
                })
                .collect::<Vec<_>>()
        };
        if let Some((dep, status)) = unmet.first() {
            let failed_success_dep = unmet
                .iter()
                .find(|(d, s)| d.dep_type == DependencyType::Success && *s == StepStatus::Failed);
            if let Some((failed, _)) = failed_success_dep
                && step.on_error == OnError::Fail
            {
                let reason = format!("dependency '{}' failed", failed.step);
                skip(handle, &step.name, reason.clone());
                let mut exec = write(handle);
                exec.finish(
                    WorkflowStatus::Failed,
                    Some(format!("step '{}' cannot run: {reason}", step.name)),
                );
                return StepOutcome::Stop;
            }
            let reason = format!(
                "dependency '{}' not satisfied ({:?} required, was {:?})",
                dep.step, dep.dep_type, status
            );
            skip(handle, &step.name, reason);
            return StepOutcome::Done;
        }

        let config = vars::substitute(&step.config, context);
        {
            let mut exec = write(handle);
            if exec.cancel_requested {
                exec.finish(WorkflowStatus::Cancelled, None);
                return StepOutcome::Stop;
            }
            exec.execution_order.push(step.name.clone());
            if let Some(rec) = exec.step_mut(&step.name) {
                rec.status = StepStatus::Running;
                rec.started_at = Some(Utc::now());
            }
        }
        tracing::debug!("▶️ Step '{}' ({})", step.name, step.action_type);

        let max_retries = match step.on_error {
            OnError::Retry => self.retry.max_retries,
            _ => 0,
        };
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.invoke(step, &config, context).await {
                Ok(output) => {
                    for (k, v) in &output {
                        context.insert(k.clone(), v.clone());
                    }
                    context.insert(step.name.clone(), Value::Object(output.clone()));

                    let mut exec = write(handle);
                    exec.context = context.clone();
                    if let Some(rec) = exec.step_mut(&step.name) {
                        rec.status = StepStatus::Completed;
                        rec.attempts = attempts;
                        rec.output = output;
                        rec.finished_at = Some(Utc::now());
                    }
                    return StepOutcome::Done;
                }
                Err(e) if attempts <= max_retries => {
                    let delay = self.retry.delay_for_retry(attempts - 1);
                    tracing::warn!(
                        "🔁 Step '{}' failed (attempt {}/{}), retrying in {:?}: {}",
                        step.name,
                        attempts,
                        max_retries + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    write(handle).context = context.clone();
                    return self.step_failed(handle, step, attempts, e);
                }
            }
        }
    }

    async fn invoke(
        &self,
        step: &WorkflowStep,
        config: &Value,
        context: &mut Map<String, Value>,
    ) -> Result<Map<String, Value>, String> {
        let fut = self.executor.execute(&step.action_type, config, context);
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result.and_then(ActionResult::into_result),
            Err(_) => Err(format!("action '{}' panicked", step.action_type)),
        }
    }

    fn step_failed(
        &self,
        handle: &ExecutionHandle,
        step: &WorkflowStep,
        attempts: u32,
        error: String,
    ) -> StepOutcome {
        let mut exec = write(handle);
        if let Some(rec) = exec.step_mut(&step.name) {
            rec.status = StepStatus::Failed;
            rec.attempts = attempts;
            rec.error = Some(error.clone());
            rec.finished_at = Some(Utc::now());
        }
        exec.failed_steps.push(step.name.clone());

        match step.on_error {
            OnError::Continue => {
                tracing::warn!("⚠️ Step '{}' failed, continuing: {}", step.name, error);
                StepOutcome::Done
            }
            OnError::Fail | OnError::Retry => {
                tracing::warn!("❌ Step '{}' failed: {}", step.name, error);
                exec.finish(
                    WorkflowStatus::Failed,
                    Some(format!("step '{}' failed: {error}", step.name)),
                );
                StepOutcome::Stop
            }
        }
    }
}

fn skip(handle: &ExecutionHandle, step: &str, reason: String) {
    tracing::debug!("⏭️ Step '{}' skipped: {}", step, reason);
    if let Some(rec) = write(handle).step_mut(step) {
        rec.status = StepStatus::Skipped;
        rec.skip_reason = Some(reason);
        rec.finished_at = Some(Utc::now());
    }
}

fn read(handle: &ExecutionHandle) -> std::sync::RwLockReadGuard<'_, WorkflowExecution> {
    handle.read().unwrap_or_else(|e| e.into_inner())
}

fn write(handle: &ExecutionHandle) -> RwLockWriteGuard<'_, WorkflowExecution> {
    handle.write().unwrap_or_else(|e| e.into_inner())
}
