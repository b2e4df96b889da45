//! Reusable workflow templates.
//!
//! `instantiate` hands out deep copies, so an orchestrator run can never
//! change a stored template.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::WorkflowError;
use crate::vars;
use crate::workflow::{DependencyType, OnError, WorkflowStep, resolve_order};

/// A named, reusable step graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Seeded into the context by `instantiate_with`.
    #[serde(default)]
    pub default_params: Map<String, Value>,
}

impl WorkflowTemplate {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            steps: Vec::new(),
            tags: BTreeSet::new(),
            default_params: Map::new(),
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.default_params.insert(key.to_string(), value);
        self
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Check the step graph (duplicate names, unknown dependencies, cycles).
    pub fn validate(&self) -> Result<(), WorkflowError> {
        resolve_order(&self.steps).map(|_| ())
    }

    /// `${...}` references that are not outputs of the template's own steps.
    pub fn parameters(&self) -> BTreeSet<String> {
        let step_names: BTreeSet<&str> = self.steps.iter().map(|s| s.name.as_str()).collect();
        let mut params = BTreeSet::new();
        for step in &self.steps {
            let mut texts = Vec::new();
            collect_strings(&step.config, &mut texts);
            if let Some(c) = &step.condition {
                texts.push(c.clone());
            }
            for text in texts {
                for r in vars::references(&text) {
                    let root = r.split('.').next().unwrap_or_default();
                    if !step_names.contains(root) {
                        params.insert(root.to_string());
                    }
                }
            }
        }
        params
    }
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Templates by name.
#[derive(Debug, Default)]
pub struct WorkflowTemplateRegistry {
    templates: RwLock<BTreeMap<String, WorkflowTemplate>>,
}

impl WorkflowTemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, WorkflowTemplate>> {
        self.templates.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, WorkflowTemplate>> {
        self.templates.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a template, replacing any with the same name. Templates whose
    /// step graph cannot run are rejected.
    pub fn register(&self, template: WorkflowTemplate) -> Result<(), WorkflowError> {
        template.validate()?;
        tracing::debug!("🧩 Template registered: '{}'", template.name);
        self.write().insert(template.name.clone(), template);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<WorkflowTemplate> {
        self.read().get(name).cloned()
    }

    /// Templates sorted by name. With `tags`, only templates carrying at
    /// least one of them.
    pub fn list_templates(&self, tags: Option<&[&str]>) -> Vec<WorkflowTemplate> {
        self.read()
            .values()
            .filter(|t| match tags {
                Some(wanted) => wanted.iter().any(|tag| t.tags.contains(*tag)),
                None => true,
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Fresh copy of the template's steps plus an empty context.
    pub fn instantiate(&self, name: &str) -> Option<(Vec<WorkflowStep>, Map<String, Value>)> {
        self.read().get(name).map(|t| (t.steps.clone(), Map::new()))
    }

    /// Like `instantiate`, with the context seeded from `default_params`
    /// and then `overrides`.
    pub fn instantiate_with(
        &self,
        name: &str,
        overrides: Map<String, Value>,
    ) -> Option<(Vec<WorkflowStep>, Map<String, Value>)> {
        let templates = self.read();
        let template = templates.get(name)?;
        let mut context = template.default_params.clone();
        context.extend(overrides);
        Some((template.steps.clone(), context))
    }
}

/// Registry pre-loaded with the built-in templates.
pub fn create_default_template_registry() -> WorkflowTemplateRegistry {
    let registry = WorkflowTemplateRegistry::new();
    for template in builtin_templates() {
        if let Err(e) = registry.register(template) {
            tracing::warn!("⚠️ Built-in template rejected: {e}");
        }
    }
    registry
}

fn builtin_templates() -> Vec<WorkflowTemplate> {
    vec![
        WorkflowTemplate::new("notification", "Send a single chat message to a target")
            .with_tag("notification")
            .with_param("target", json!(""))
            .with_param("message", json!(""))
            .with_step(
                WorkflowStep::new("send", "send_message")
                    .with_config(json!({"target": "${target}", "message": "${message}"}))
                    .on_error(OnError::Retry),
            ),
        WorkflowTemplate::new(
            "alert_escalation",
            "Alert the on-call target, then escalate when the alert is not acknowledged",
        )
        .with_tag("alert")
        .with_tag("notification")
        .with_param("severity", json!("high"))
        .with_step(
            WorkflowStep::new("notify_primary", "send_message")
                .with_config(json!({
                    "target": "${primary}",
                    "message": "🚨 [${severity}] ${message}"
                }))
                .on_error(OnError::Continue),
        )
        .with_step(
            WorkflowStep::new("check_ack", "http_request")
                .with_config(json!({"method": "GET", "url": "${ack_url}"}))
                .depends_on_with("notify_primary", DependencyType::Completion)
                .on_error(OnError::Continue),
        )
        .with_step(
            WorkflowStep::new("escalate", "send_message")
                .with_config(json!({
                    "target": "${escalation}",
                    "message": "⏫ Escalated (no ack): ${message}"
                }))
                .depends_on_with("check_ack", DependencyType::Any)
                .when("not check_ack.body.acknowledged"),
        ),
        WorkflowTemplate::new("daily_report", "Collect data, summarize it with AI and post the summary")
            .with_tag("report")
            .with_tag("scheduled")
            .with_step(
                WorkflowStep::new("collect", "http_request")
                    .with_config(json!({"method": "GET", "url": "${report_url}"}))
                    .on_error(OnError::Retry),
            )
            .with_step(
                WorkflowStep::new("summarize", "ai_query")
                    .with_config(json!({"prompt": "Summarize this report for the team:\n${collect.body}"}))
                    .depends_on("collect"),
            )
            .with_step(
                WorkflowStep::new("deliver", "send_message")
                    .with_config(json!({"target": "${target}", "message": "${summarize.response}"}))
                    .depends_on("summarize"),
            ),
        WorkflowTemplate::new("webhook_relay", "Forward an inbound payload to another HTTP endpoint")
            .with_tag("webhook")
            .with_tag("integration")
            .with_step(
                WorkflowStep::new("forward", "http_request")
                    .with_config(json!({"method": "POST", "url": "${target_url}", "body": "${payload}"}))
                    .on_error(OnError::Continue),
            )
            .with_step(
                WorkflowStep::new("report_failure", "send_message")
                    .with_config(json!({
                        "target": "${target}",
                        "message": "Relay to ${target_url} failed: ${error}"
                    }))
                    .depends_on_with("forward", DependencyType::Failure),
            ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_have_name_and_description() {
        let registry = create_default_template_registry();
        let all = registry.list_templates(None);
        assert_eq!(all.len(), 4);
        for t in &all {
            assert!(!t.name.is_empty());
            assert!(!t.description.is_empty());
            assert!(!t.steps.is_empty());
            assert!(t.validate().is_ok(), "{} has an invalid graph", t.name);
        }
        for name in ["notification", "alert_escalation", "daily_report", "webhook_relay"] {
            assert!(registry.get(name).is_some(), "missing {name}");
        }
    }

    #[test]
    fn test_list_by_tags_is_or() {
        let registry = WorkflowTemplateRegistry::new();
        registry
            .register(WorkflowTemplate::new("notify", "n").with_tag("notification"))
            .unwrap();
        registry
            .register(WorkflowTemplate::new("page", "p").with_tag("alert"))
            .unwrap();
        registry
            .register(WorkflowTemplate::new("report", "r").with_tag("report"))
            .unwrap();

        let names = |tags: &[&str]| -> Vec<String> {
            registry.list_templates(Some(tags)).into_iter().map(|t| t.name).collect()
        };
        assert_eq!(names(&["notification"]), vec!["notify"]);
        assert_eq!(names(&["notification", "alert"]), vec!["notify", "page"]);
        assert!(names(&["nothing"]).is_empty());
        assert_eq!(registry.list_templates(None).len(), 3);
    }

    #[test]
    fn test_instantiate_is_isolated() {
        let registry = create_default_template_registry();
        let (mut steps, mut ctx) = registry.instantiate("daily_report").unwrap();
        assert!(ctx.is_empty());
        steps[0].name = "mutated".into();
        steps[0].config["url"] = Value::from("https://evil.example");
        steps.pop();
        ctx.insert("x".into(), Value::from(1));

        let (again, ctx2) = registry.instantiate("daily_report").unwrap();
        assert_eq!(again.len(), 3);
        assert_eq!(again[0].name, "collect");
        assert_eq!(again[0].config["url"], "${report_url}");
        assert!(ctx2.is_empty());
        assert!(registry.instantiate("missing").is_none());
    }

    #[test]
    fn test_instantiate_with_defaults_and_overrides() {
        let registry = create_default_template_registry();
        let mut overrides = Map::new();
        overrides.insert("message".into(), json!("disk full"));
        overrides.insert("severity".into(), json!("critical"));
        let (_, ctx) = registry.instantiate_with("alert_escalation", overrides).unwrap();
        assert_eq!(ctx["severity"], "critical");
        assert_eq!(ctx["message"], "disk full");

        let (_, ctx) = registry.instantiate_with("notification", Map::new()).unwrap();
        assert_eq!(ctx["target"], "");
    }

    #[test]
    fn test_value_round_trip_and_parameters() {
        let registry = create_default_template_registry();
        let original = registry.get("alert_escalation").unwrap();
        let restored = WorkflowTemplate::from_value(original.to_value().unwrap()).unwrap();
        assert_eq!(restored, original);

        let params: Vec<String> = original.parameters().into_iter().collect();
        assert_eq!(params, vec!["ack_url", "escalation", "message", "primary", "severity"]);
    }

    #[test]
    fn test_register_rejects_invalid_graph_and_unregister() {
        let registry = WorkflowTemplateRegistry::new();
        let cyclic = WorkflowTemplate::new("loop", "bad")
            .with_step(WorkflowStep::new("a", "x").depends_on("b"))
            .with_step(WorkflowStep::new("b", "x").depends_on("a"));
        assert!(registry.register(cyclic).is_err());
        assert!(registry.is_empty());

        registry.register(WorkflowTemplate::new("ok", "fine")).unwrap();
        assert!(registry.unregister("ok"));
        assert!(!registry.unregister("ok"));
    }
}
