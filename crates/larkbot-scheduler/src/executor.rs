//! Task executor: runs a task's actions in order against one context.
//!
//! Each action's config is `${var}`-substituted right before it runs, so it
//! can use values written by earlier actions. Failures follow the action's
//! [`ActionPolicy`](crate::tasks::ActionPolicy): bounded retries with a fixed delay, then either stop
//! the task or continue with the next action.
//!
//! Action types:
//! - `send_message`: `target`, `message` through a [`MessageSender`]
//! - `http_request`: `method`, `url`, `headers`, `body`, `timeout_secs`
//! - `python_code`: `code` through a [`CodeRunner`]
//! - `ai_query` / `ai_chat`: `prompt` / `message` through an [`AiClient`]
//! - `log`: `message`
//! - `set_variable`: `name` + `value`, or a `variables` map

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use larkbot_core::RetryPolicy;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::io::AsyncWriteExt;

use crate::dispatch::{LogMessageSender, MessageSender};
use crate::error::{ActionError, ActionErrorKind};
use crate::tasks::TaskDefinition;
use crate::vars;
use crate::workflow::{ActionExecutor, ActionResult};

/// Language model behind `ai_query` and `ai_chat`.
#[async_trait]
pub trait AiClient: Send + Sync {
    /// One-shot completion.
    async fn query(&self, prompt: &str, system: Option<&str>) -> Result<String, String>;

    /// Message within a conversation. Defaults to a stateless query.
    async fn chat(&self, _session_id: &str, message: &str) -> Result<String, String> {
        self.query(message, None).await
    }
}

/// Runs `python_code` snippets.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    /// Run `code` with `context` available; returns the snippet's `result`
    /// and the context as the snippet left it.
    async fn run(&self, code: &str, context: &Map<String, Value>) -> Result<CodeOutput, String>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodeOutput {
    pub result: Value,
    pub context: Map<String, Value>,
}

/// Reads the JSON context from stdin, runs the snippet, prints `result` and
/// the context back as one JSON line.
const PYTHON_HARNESS: &str = r#"
import json, sys
context = json.load(sys.stdin)
result = None
exec(compile(sys.argv[1], "<python_code>", "exec"))
print(json.dumps({"result": result, "context": context}, default=str))
"#;

/// [`CodeRunner`] using a local `python3` interpreter.
#[derive(Debug, Clone)]
pub struct Python3CodeRunner {
    interpreter: String,
    timeout: Duration,
}

impl Default for Python3CodeRunner {
    fn default() -> Self {
        Self {
            interpreter: "python3".into(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl Python3CodeRunner {
    pub fn new(interpreter: impl Into<String>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CodeRunner for Python3CodeRunner {
    async fn run(&self, code: &str, context: &Map<String, Value>) -> Result<CodeOutput, String> {
        let input = serde_json::to_vec(context).map_err(|e| format!("context not serializable: {e}"))?;
        let mut child = tokio::process::Command::new(&self.interpreter)
            .arg("-c")
            .arg(PYTHON_HARNESS)
            .arg(code)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("'{}' not found or not executable: {e}", self.interpreter))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|e| format!("failed to pass context: {e}"))?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| format!("⏰ python_code timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| format!("python_code failed: {e}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            return Err(format!(
                "python_code exited with {}: {}",
                output.status.code().unwrap_or(-1),
                tail.into_iter().rev().collect::<Vec<_>>().join("\n")
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let last = stdout.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("{}");
        let parsed: Value =
            serde_json::from_str(last).map_err(|e| format!("python_code output is not JSON: {e}"))?;
        Ok(CodeOutput {
            result: parsed.get("result").cloned().unwrap_or(Value::Null),
            context: parsed
                .get("context")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

/// Outcome of one action within a task run.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub name: String,
    pub action_type: String,
    pub success: bool,
    pub attempts: u32,
    pub error: Option<String>,
    pub output: Map<String, Value>,
    pub duration_ms: u64,
}

/// Outcome of a whole task run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRunResult {
    pub task_name: String,
    /// False when an action failed without a continue policy.
    pub success: bool,
    pub actions: Vec<ActionOutcome>,
    pub context: Map<String, Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl TaskRunResult {
    pub fn failed_actions(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter(|a| !a.success)
            .map(|a| a.name.as_str())
            .collect()
    }
}

/// Runs task definitions and single actions.
pub struct TaskExecutor {
    client: reqwest::Client,
    sender: Arc<dyn MessageSender>,
    ai: Option<Arc<dyn AiClient>>,
    code_runner: Arc<dyn CodeRunner>,
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new(Arc::new(LogMessageSender))
    }
}

impl TaskExecutor {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self {
            client: reqwest::Client::new(),
            sender,
            ai: None,
            code_runner: Arc::new(Python3CodeRunner::default()),
        }
    }

    pub fn with_ai(mut self, ai: Arc<dyn AiClient>) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn with_code_runner(mut self, runner: Arc<dyn CodeRunner>) -> Self {
        self.code_runner = runner;
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Run every action of `task`. `initial` values override the task's
    /// `variables`.
    pub async fn execute_task(
        &self,
        task: &TaskDefinition,
        initial: Option<Map<String, Value>>,
    ) -> TaskRunResult {
        let started = Instant::now();
        let mut context = task.variables.clone();
        context.extend(initial.unwrap_or_default());
        context.insert("task_name".into(), Value::String(task.name.clone()));

        if !task.enabled {
            tracing::info!("⏭️ Task '{}' is disabled, skipping", task.name);
            return TaskRunResult {
                task_name: task.name.clone(),
                success: false,
                actions: Vec::new(),
                context,
                error: Some(format!("task '{}' is disabled", task.name)),
                duration_ms: 0,
            };
        }

        tracing::info!("📋 Task '{}' started ({} actions)", task.name, task.actions.len());
        let mut outcomes = Vec::with_capacity(task.actions.len());
        let mut error = None;

        for action in &task.actions {
            let policy = action.policy(&task.error_handling);
            let retry = RetryPolicy::fixed(
                Duration::from_secs(task.error_handling.retry_delay_secs),
                policy.retries,
            );
            let action_started = Instant::now();
            let mut attempts = 0;

            let result = loop {
                attempts += 1;
                let config = vars::substitute(&Value::Object(action.config.clone()), &context);
                match self.run_action(&action.action_type, &config, &mut context).await {
                    Ok(output) => break Ok(output),
                    Err(e) if retry.has_retries_remaining(attempts - 1) => {
                        let delay = retry.delay_for_retry(attempts - 1);
                        tracing::warn!(
                            "🔁 Action '{}' of task '{}' failed (attempt {}), retrying in {:?}: {}",
                            action.display_name(),
                            task.name,
                            attempts,
                            delay,
                            e
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => break Err(e),
                }
            };
            let duration_ms = action_started.elapsed().as_millis() as u64;

            match result {
                Ok(output) => {
                    let key = action
                        .output_var
                        .clone()
                        .or_else(|| (!action.name.is_empty()).then(|| action.name.clone()));
                    if let Some(key) = key {
                        context.insert(key, Value::Object(output.clone()));
                    }
                    context.insert("last_result".into(), Value::Object(output.clone()));
                    outcomes.push(ActionOutcome {
                        name: action.display_name().to_string(),
                        action_type: action.action_type.clone(),
                        success: true,
                        attempts,
                        error: None,
                        output,
                        duration_ms,
                    });
                }
                Err(e) => {
                    outcomes.push(ActionOutcome {
                        name: action.display_name().to_string(),
                        action_type: action.action_type.clone(),
                        success: false,
                        attempts,
                        error: Some(e.to_string()),
                        output: Map::new(),
                        duration_ms,
                    });
                    if policy.continue_after_failure {
                        tracing::warn!(
                            "⚠️ Action '{}' of task '{}' failed, continuing: {}",
                            action.display_name(),
                            task.name,
                            e
                        );
                        continue;
                    }
                    error = Some(format!("action '{}' failed: {e}", action.display_name()));
                    break;
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        match &error {
            None => tracing::info!("✅ Task '{}' finished in {}ms", task.name, duration_ms),
            Some(e) => tracing::warn!("❌ Task '{}' failed: {}", task.name, e),
        }
        TaskRunResult {
            task_name: task.name.clone(),
            success: error.is_none(),
            actions: outcomes,
            context,
            error,
            duration_ms,
        }
    }

    /// Run a single action with an already-substituted config.
    pub async fn run_action(
        &self,
        action_type: &str,
        config: &Value,
        context: &mut Map<String, Value>,
    ) -> Result<Map<String, Value>, ActionError> {
        match action_type {
            "send_message" => self.send_message(config).await,
            "http_request" => self.http_request(config).await,
            "python_code" => self.python_code(config, context).await,
            "ai_query" => {
                let prompt = required_str(config, "prompt", action_type)?;
                let system = config.get("system").and_then(Value::as_str);
                let response = self.ai()?.query(prompt, system).await?;
                Ok(object(json!({ "response": response })))
            }
            "ai_chat" => {
                let message = config
                    .get("message")
                    .or_else(|| config.get("prompt"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| ActionError::invalid_config("ai_chat needs 'message'"))?;
                let session = config.get("session_id").and_then(Value::as_str).unwrap_or("default");
                let response = self.ai()?.chat(session, message).await?;
                Ok(object(json!({ "response": response })))
            }
            "log" => {
                let message = match config.get("message") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                tracing::info!("📝 {}", message);
                Ok(object(json!({ "message": message })))
            }
            "set_variable" => {
                let mut vars = config
                    .get("variables")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                if let Some(name) = config.get("name").and_then(Value::as_str) {
                    vars.insert(name.to_string(), config.get("value").cloned().unwrap_or(Value::Null));
                }
                if vars.is_empty() {
                    return Err(ActionError::invalid_config("set_variable needs 'name' or 'variables'"));
                }
                for (k, v) in &vars {
                    context.insert(k.clone(), v.clone());
                }
                Ok(vars)
            }
            other => Err(ActionError::invalid_config(format!("unknown action type '{other}'"))),
        }
    }

    fn ai(&self) -> Result<&Arc<dyn AiClient>, ActionError> {
        self.ai
            .as_ref()
            .ok_or_else(|| ActionError::invalid_config("no AI client configured"))
    }

    async fn send_message(&self, config: &Value) -> Result<Map<String, Value>, ActionError> {
        let target = config
            .get("target")
            .or_else(|| config.get("chat_id"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let message = match config.get("message").or_else(|| config.get("text")) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => return Err(ActionError::invalid_config("send_message needs 'message'")),
        };
        self.sender.send_message(target, &message).await?;
        Ok(object(json!({ "sent": true, "target": target })))
    }

    async fn http_request(&self, config: &Value) -> Result<Map<String, Value>, ActionError> {
        let url = required_str(config, "url", "http_request")?;
        let method = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| ActionError::invalid_config(format!("invalid HTTP method '{method}'")))?;
        let timeout = config.get("timeout_secs").and_then(Value::as_u64).unwrap_or(30);

        let mut req = self
            .client
            .request(method.clone(), url)
            .timeout(Duration::from_secs(timeout));
        if let Some(headers) = config.get("headers").and_then(Value::as_object) {
            for (k, v) in headers {
                let v = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                req = req.header(k.as_str(), v);
            }
        }
        match config.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => req = req.body(s.clone()),
            Some(body) => req = req.json(body),
        }

        tracing::debug!("🌐 {} {}", method, url);
        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(format!("HTTP request to {url} failed"), e))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| transport_error(format!("reading HTTP {status} response from {url} failed"), e))?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        let allow_errors = config
            .get("allow_error_status")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !status.is_success() && !allow_errors {
            return Err(ActionError::new(ActionErrorKind::HttpStatus, format!("HTTP {status} from {url}")));
        }
        Ok(object(json!({
            "status": status.as_u16(),
            "ok": status.is_success(),
            "body": body,
        })))
    }

    async fn python_code(
        &self,
        config: &Value,
        context: &mut Map<String, Value>,
    ) -> Result<Map<String, Value>, ActionError> {
        let code = required_str(config, "code", "python_code")?;
        let out = self.code_runner.run(code, context).await?;
        for (k, v) in out.context {
            context.insert(k, v);
        }
        Ok(object(json!({ "result": out.result })))
    }
}

fn required_str<'a>(config: &'a Value, key: &str, action: &str) -> Result<&'a str, ActionError> {
    config
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ActionError::invalid_config(format!("{action} needs '{key}'")))
}

fn transport_error(what: String, e: reqwest::Error) -> ActionError {
    let kind = if e.is_timeout() {
        ActionErrorKind::Timeout
    } else {
        ActionErrorKind::Transport
    };
    ActionError::new(kind, format!("{what}: {e}"))
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[async_trait]
impl ActionExecutor for TaskExecutor {
    async fn execute(
        &self,
        action_type: &str,
        config: &Value,
        context: &mut Map<String, Value>,
    ) -> Result<ActionResult, String> {
        Ok(match self.run_action(action_type, config, context).await {
            Ok(output) => ActionResult::with_output(output),
            Err(e) => ActionResult::from_error(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{ErrorHandling, TaskAction};
    use crate::workflow::OnError;
    use std::sync::Mutex;

    /// Records messages; fails the first `fail_first` sends.
    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, String)>>,
        fail_first: Mutex<u32>,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send_message(&self, target: &str, text: &str) -> Result<(), String> {
            let mut fail = self.fail_first.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err("chat API unavailable".into());
            }
            self.sent.lock().unwrap().push((target.to_string(), text.to_string()));
            Ok(())
        }
    }

    struct EchoAi;

    #[async_trait]
    impl AiClient for EchoAi {
        async fn query(&self, prompt: &str, _system: Option<&str>) -> Result<String, String> {
            Ok(format!("summary of: {prompt}"))
        }
    }

    struct FakeRunner;

    #[async_trait]
    impl CodeRunner for FakeRunner {
        async fn run(&self, code: &str, context: &Map<String, Value>) -> Result<CodeOutput, String> {
            let mut ctx = context.clone();
            ctx.insert("ran".into(), json!(code));
            Ok(CodeOutput {
                result: json!(42),
                context: ctx,
            })
        }
    }

    fn executor(sender: Arc<RecordingSender>) -> TaskExecutor {
        TaskExecutor::new(sender)
            .with_ai(Arc::new(EchoAi))
            .with_code_runner(Arc::new(FakeRunner))
    }

    fn no_delay() -> ErrorHandling {
        ErrorHandling {
            retry_delay_secs: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_actions_share_context() {
        let sender = Arc::new(RecordingSender::default());
        let mut task = TaskDefinition::new("digest")
            .with_variable("team", "ops")
            .with_action(TaskAction::new("set_variable").with("name", "count").with("value", 3))
            .with_action(
                TaskAction::new("ai_query")
                    .named("summary")
                    .with("prompt", "${count} alerts for ${team}"),
            )
            .with_action(
                TaskAction::new("send_message")
                    .with("target", "oc_ops")
                    .with("message", "${summary.response}"),
            );
        task.error_handling = no_delay();

        let result = executor(sender.clone()).execute_task(&task, None).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.actions.len(), 3);
        assert_eq!(result.context["count"], 3);
        assert_eq!(
            sender.sent.lock().unwrap()[0],
            ("oc_ops".to_string(), "summary of: 3 alerts for ops".to_string())
        );
    }

    #[tokio::test]
    async fn test_initial_context_overrides_variables() {
        let sender = Arc::new(RecordingSender::default());
        let task = TaskDefinition::new("greet")
            .with_variable("who", "world")
            .with_action(TaskAction::new("send_message").with("message", "hi ${who}"));
        let mut initial = Map::new();
        initial.insert("who".into(), json!("Lan"));

        let result = executor(sender.clone()).execute_task(&task, Some(initial)).await;
        assert!(result.success);
        assert_eq!(sender.sent.lock().unwrap()[0].1, "hi Lan");
        assert_eq!(result.context["task_name"], "greet");
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let sender = Arc::new(RecordingSender {
            fail_first: Mutex::new(2),
            ..Default::default()
        });
        let mut task = TaskDefinition::new("flaky")
            .with_action(TaskAction::new("send_message").with("message", "ping"));
        task.error_handling = ErrorHandling {
            retry_on_failure: true,
            max_retries: 2,
            ..no_delay()
        };

        let result = executor(sender.clone()).execute_task(&task, None).await;
        assert!(result.success);
        assert_eq!(result.actions[0].attempts, 3);
        assert_eq!(sender.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stops_at_first_unrecovered_failure() {
        let sender = Arc::new(RecordingSender {
            fail_first: Mutex::new(10),
            ..Default::default()
        });
        let mut task = TaskDefinition::new("strict")
            .with_action(TaskAction::new("send_message").named("notify").with("message", "x"))
            .with_action(TaskAction::new("log").with("message", "never"));
        task.error_handling = no_delay();

        let result = executor(sender).execute_task(&task, None).await;
        assert!(!result.success);
        assert_eq!(result.actions.len(), 1);
        assert_eq!(result.actions[0].attempts, 1);
        assert!(result.error.unwrap().contains("notify"));
    }

    #[tokio::test]
    async fn test_continue_policies() {
        let sender = Arc::new(RecordingSender {
            fail_first: Mutex::new(10),
            ..Default::default()
        });
        let mut task = TaskDefinition::new("lenient")
            .with_action(
                TaskAction::new("send_message")
                    .named("notify")
                    .with("message", "x")
                    .on_error(OnError::Continue),
            )
            .with_action(TaskAction::new("log").named("after").with("message", "still here"));
        task.error_handling = no_delay();

        let result = executor(sender).execute_task(&task, None).await;
        assert!(result.success);
        assert_eq!(result.failed_actions(), vec!["notify"]);
        assert_eq!(result.context["after"]["message"], "still here");
    }

    #[tokio::test]
    async fn test_output_var_and_python_code() {
        let sender = Arc::new(RecordingSender::default());
        let task = TaskDefinition::new("code")
            .with_action(
                TaskAction::new("python_code")
                    .with("code", "result = 42")
                    .output_var("calc"),
            )
            .with_action(TaskAction::new("log").with("message", "answer=${calc.result}"));
        let result = executor(sender).execute_task(&task, None).await;
        assert!(result.success);
        assert_eq!(result.context["calc"]["result"], 42);
        assert_eq!(result.context["ran"], "result = 42");
        assert_eq!(result.context["last_result"]["message"], "answer=42");
    }

    #[tokio::test]
    async fn test_disabled_task_does_nothing() {
        let sender = Arc::new(RecordingSender::default());
        let mut task = TaskDefinition::new("off").with_action(TaskAction::new("send_message").with("message", "x"));
        task.enabled = false;
        let result = executor(sender.clone()).execute_task(&task, None).await;
        assert!(!result.success);
        assert!(result.actions.is_empty());
        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_action_errors() {
        let exec = TaskExecutor::default();
        let mut ctx = Map::new();
        let err = exec.run_action("teleport", &json!({}), &mut ctx).await.unwrap_err();
        assert!(err.message.contains("unknown"));
        assert_eq!(err.kind, ActionErrorKind::InvalidConfig);
        let err = exec.run_action("ai_query", &json!({"prompt": "x"}), &mut ctx).await.unwrap_err();
        assert!(err.message.contains("no AI"));
        let err = exec.run_action("http_request", &json!({}), &mut ctx).await.unwrap_err();
        assert!(err.message.contains("url"));
        assert!(
            exec.run_action("http_request", &json!({"url": "http://x", "method": "NOT A METHOD"}), &mut ctx)
                .await
                .is_err()
        );
        assert!(exec.run_action("set_variable", &json!({}), &mut ctx).await.is_err());
    }

    /// Serves one canned HTTP response to the first connection, then closes it.
    async fn serve_once(response: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}/report")
    }

    #[tokio::test]
    async fn test_http_request_parses_json_body() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 11\r\nConnection: close\r\n\r\n{\"count\":3}",
        )
        .await;
        let out = TaskExecutor::default()
            .run_action("http_request", &json!({"url": url}), &mut Map::new())
            .await
            .unwrap();
        assert_eq!(out["status"], 200);
        assert_eq!(out["body"]["count"], 3);
    }

    #[tokio::test]
    async fn test_http_error_status_is_classified() {
        let url = serve_once("HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let err = TaskExecutor::default()
            .run_action("http_request", &json!({"url": url}), &mut Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ActionErrorKind::HttpStatus);
        assert!(err.message.contains("503"));
    }

    #[tokio::test]
    async fn test_truncated_http_body_fails_the_action() {
        let url = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\n{\"partial\"").await;
        let err = TaskExecutor::default()
            .run_action("http_request", &json!({"url": url}), &mut Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ActionErrorKind::Transport);
        assert!(err.message.contains("reading HTTP 200 OK response"));
    }

    #[tokio::test]
    async fn test_as_action_executor() {
        let sender = Arc::new(RecordingSender::default());
        let exec: Arc<dyn ActionExecutor> = Arc::new(executor(sender.clone()));
        let mut ctx = Map::new();
        let ok = exec
            .execute("send_message", &json!({"target": "t", "message": "m"}), &mut ctx)
            .await
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.output["sent"], true);

        let failed = exec.execute("teleport", &json!({}), &mut ctx).await.unwrap();
        assert!(!failed.success);
        assert_eq!(failed.error_kind, Some(ActionErrorKind::InvalidConfig));
    }

    #[tokio::test]
    async fn test_python3_runner_round_trip() {
        let available = std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success());
        if !available {
            return;
        }
        let runner = Python3CodeRunner::default();
        let mut ctx = Map::new();
        ctx.insert("n".into(), json!(20));
        let out = runner
            .run("context['doubled'] = context['n'] * 2\nresult = 'ok'", &ctx)
            .await
            .unwrap();
        assert_eq!(out.result, "ok");
        assert_eq!(out.context["doubled"], 40);

        let err = runner.run("raise ValueError('bad input')", &ctx).await.unwrap_err();
        assert!(err.contains("bad input"));
    }
}
