//! Error types for the scheduler, trigger and workflow layers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by [`crate::engine::TaskScheduler`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is disabled in configuration")]
    Disabled,

    #[error("job '{0}' already exists (use replace_existing to overwrite)")]
    JobExists(String),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from trigger construction and registration.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("trigger config error: {message}")]
    Config { message: String },

    #[error("unknown trigger type '{0}'")]
    UnknownType(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl TriggerError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Step-graph errors. Reported on the failed execution, never raised out of
/// `execute_workflow`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle among steps: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// Failure class of an action. Action circuit breakers match its name
/// against `excluded_errors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionErrorKind {
    /// Missing or malformed action config; retrying will not help.
    InvalidConfig,
    /// The request or subprocess ran out of time.
    Timeout,
    /// Connection-level HTTP failure, or a body that could not be read.
    Transport,
    /// The server answered with a non-success status.
    HttpStatus,
    Failed,
}

impl ActionErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidConfig => "InvalidConfig",
            Self::Timeout => "Timeout",
            Self::Transport => "Transport",
            Self::HttpStatus => "HttpStatus",
            Self::Failed => "Failed",
        }
    }
}

/// A failed action and its class.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ActionError {
    pub kind: ActionErrorKind,
    pub message: String,
}

impl ActionError {
    pub fn new(kind: ActionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ActionErrorKind::InvalidConfig, message)
    }

    pub fn kind_name(&self) -> &str {
        self.kind.as_str()
    }
}

impl From<String> for ActionError {
    fn from(message: String) -> Self {
        Self::new(ActionErrorKind::Failed, message)
    }
}

impl From<&str> for ActionError {
    fn from(message: &str) -> Self {
        Self::new(ActionErrorKind::Failed, message)
    }
}

/// Job store and history store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from wiring automation rules.
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("automation '{name}': {message}")]
    InvalidRule { name: String, message: String },

    #[error("automation '{0}' not found")]
    RuleNotFound(String),

    #[error("task '{name}': {}", .problems.join("; "))]
    InvalidTask { name: String, problems: Vec<String> },

    #[error("task '{0}' not found")]
    UnknownTask(String),

    #[error("workflow template '{0}' not found")]
    UnknownTemplate(String),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}
