//! Task definitions: ordered action lists run by the task executor.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::workflow::OnError;

/// Action types the task executor understands.
pub const ACTION_TYPES: &[&str] = &[
    "send_message",
    "http_request",
    "python_code",
    "ai_query",
    "ai_chat",
    "log",
    "set_variable",
];

/// A named list of actions sharing one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Initial context values.
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub actions: Vec<TaskAction>,
    #[serde(default)]
    pub error_handling: ErrorHandling,
}

fn bool_true() -> bool {
    true
}

/// Task-wide failure policy; an action's own `on_error` overrides it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default)]
    pub retry_on_failure: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default)]
    pub continue_on_error: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

impl Default for ErrorHandling {
    fn default() -> Self {
        Self {
            retry_on_failure: false,
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            continue_on_error: false,
        }
    }
}

/// One action. Everything besides the named keys is the action's config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAction {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,
    /// Context key receiving the action output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_var: Option<String>,
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

/// Resolved failure handling for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionPolicy {
    pub retries: u32,
    /// Keep going with the next action once retries are exhausted.
    pub continue_after_failure: bool,
}

impl TaskAction {
    pub fn new(action_type: &str) -> Self {
        Self {
            name: String::new(),
            action_type: action_type.to_string(),
            on_error: None,
            output_var: None,
            config: Map::new(),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }

    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = Some(on_error);
        self
    }

    pub fn output_var(mut self, var: &str) -> Self {
        self.output_var = Some(var.to_string());
        self
    }

    /// `name`, or the action type when unnamed.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.action_type
        } else {
            &self.name
        }
    }

    pub fn policy(&self, eh: &ErrorHandling) -> ActionPolicy {
        match self.on_error {
            Some(OnError::Fail) => ActionPolicy {
                retries: 0,
                continue_after_failure: false,
            },
            Some(OnError::Continue) => ActionPolicy {
                retries: 0,
                continue_after_failure: true,
            },
            Some(OnError::Retry) => ActionPolicy {
                retries: eh.max_retries,
                continue_after_failure: eh.continue_on_error,
            },
            None => ActionPolicy {
                retries: if eh.retry_on_failure { eh.max_retries } else { 0 },
                continue_after_failure: eh.continue_on_error,
            },
        }
    }
}

impl TaskDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            enabled: true,
            variables: Map::new(),
            actions: Vec::new(),
            error_handling: ErrorHandling::default(),
        }
    }

    pub fn with_action(mut self, action: TaskAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_variable(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.variables.insert(key.to_string(), value.into());
        self
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Problems that would make the task fail on every run.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("task name is empty".to_string());
        }
        if self.actions.is_empty() {
            problems.push(format!("task '{}' has no actions", self.name));
        }
        for (i, action) in self.actions.iter().enumerate() {
            if !ACTION_TYPES.contains(&action.action_type.as_str()) {
                problems.push(format!(
                    "task '{}' action #{} has unknown type '{}'",
                    self.name,
                    i + 1,
                    action.action_type
                ));
            }
        }
        if problems.is_empty() { Ok(()) } else { Err(problems) }
    }
}
