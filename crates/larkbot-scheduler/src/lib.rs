//! # Larkbot Scheduler
//!
//! Automation runtime for chat bots: triggers decide when a rule fires,
//! the workflow orchestrator runs step graphs, and the task scheduler keeps
//! interval/cron jobs running with health tracking and execution history.
//!
//! ## Architecture
//! ```text
//! AutomationEngine
//!   ├── TriggerRegistry ── schedule | event | webhook | manual | chain
//!   │      └── schedule triggers → TaskScheduler jobs
//!   ├── WorkflowOrchestrator ── topo order, conditions, retries, cancel
//!   │      └── CircuitBreakerExecutor → TaskExecutor actions
//!   ├── WorkflowTemplateRegistry ── reusable step graphs
//!   └── TaskExecutor ── send_message, http_request, python_code, ai_*
//!
//! TaskScheduler
//!   ├── JobStore (memory | sqlite)
//!   ├── ExecutionHistoryStore (memory | sqlite)
//!   ├── HealthMonitor
//!   └── hooks: logging, metrics, alert → NotifyRouter → dispatch
//! ```

pub mod automation;
pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expression;
pub mod health;
pub mod history;
pub mod hooks;
pub mod jobs;
pub mod notify;
pub mod persistence;
pub mod store;
pub mod tasks;
pub mod templates;
pub mod triggers;
pub mod vars;
pub mod workflow;

pub use automation::{AutomationEngine, AutomationRule, RunOutcome};
pub use engine::TaskScheduler;
pub use error::{
    ActionError, ActionErrorKind, AutomationError, SchedulerError, StoreError, TriggerError, WorkflowError,
};
pub use executor::{AiClient, CodeRunner, TaskExecutor, TaskRunResult};
pub use health::{HealthReport, JobHealth};
pub use history::{ExecutionHistoryStore, ExecutionRecord, TaskStatus};
pub use hooks::{AlertHook, JobHook, LoggingHook, MetricsHook};
pub use jobs::{JobBuilder, JobInfo, JobSpec, JobTrigger, job_fn};
pub use notify::{Notification, NotifyPriority, NotifyRouter};
pub use store::JobStore;
pub use tasks::{TaskAction, TaskDefinition};
pub use templates::{WorkflowTemplate, WorkflowTemplateRegistry, create_default_template_registry};
pub use triggers::{Trigger, TriggerContext, TriggerKind, TriggerRegistry, trigger_callback};
pub use workflow::{
    ActionExecutor, ActionResult, WorkflowExecution, WorkflowOrchestrator, WorkflowStatus, WorkflowStep,
};
