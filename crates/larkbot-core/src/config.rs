//! Larkbot configuration system.
//!
//! Scheduler, workflow and reliability settings are typed here. Task,
//! automation and template definitions are kept as raw JSON values and
//! parsed entry-by-entry by the scheduler crate, so one malformed entry is
//! reported without rejecting the whole file.

use chrono::Offset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LarkbotError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LarkbotConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub circuit_breakers: Vec<CircuitBreakerSettings>,
    #[serde(default)]
    pub tasks: Vec<serde_json::Value>,
    #[serde(default)]
    pub automations: Vec<serde_json::Value>,
    #[serde(default)]
    pub task_templates: Vec<serde_json::Value>,
}

impl LarkbotConfig {
    /// Load config from the default path (~/.larkbot/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LarkbotError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| LarkbotError::Config(format!("Failed to parse config: {e}")))
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| LarkbotError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Larkbot home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".larkbot")
    }
}

/// Expand `~` in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// Where the scheduler keeps job registrations and execution history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    #[default]
    Memory,
    Sqlite,
}

/// Whether `history_max_records` caps each job separately or all jobs together.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HistoryCapScope {
    #[default]
    PerJob,
    Global,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub job_store_type: StoreType,
    #[serde(default = "default_job_store_path")]
    pub job_store_path: String,
    #[serde(default = "bool_true")]
    pub health_check_enabled: bool,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    /// Consecutive failures after which a job is reported unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "bool_true")]
    pub history_enabled: bool,
    #[serde(default)]
    pub history_store_type: StoreType,
    #[serde(default = "default_history_store_path")]
    pub history_store_path: String,
    #[serde(default = "default_history_max_records")]
    pub history_max_records: usize,
    #[serde(default)]
    pub history_cap_scope: HistoryCapScope,
    #[serde(default = "bool_true")]
    pub enable_logging_hook: bool,
    #[serde(default = "bool_true")]
    pub enable_metrics_hook: bool,
    #[serde(default = "bool_true")]
    pub enable_alert_hook: bool,
    #[serde(default)]
    pub alert_webhook_url: String,
}

fn bool_true() -> bool { true }
fn default_timezone() -> String { "UTC".into() }
fn default_job_store_path() -> String { "~/.larkbot/jobs.db".into() }
fn default_health_check_interval() -> u64 { 60 }
fn default_failure_threshold() -> u32 { 3 }
fn default_history_store_path() -> String { "~/.larkbot/history.db".into() }
fn default_history_max_records() -> usize { 1000 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timezone: default_timezone(),
            job_store_type: StoreType::Memory,
            job_store_path: default_job_store_path(),
            health_check_enabled: true,
            health_check_interval_secs: default_health_check_interval(),
            failure_threshold: default_failure_threshold(),
            history_enabled: true,
            history_store_type: StoreType::Memory,
            history_store_path: default_history_store_path(),
            history_max_records: default_history_max_records(),
            history_cap_scope: HistoryCapScope::PerJob,
            enable_logging_hook: true,
            enable_metrics_hook: true,
            enable_alert_hook: true,
            alert_webhook_url: String::new(),
        }
    }
}

impl SchedulerConfig {
    /// Resolve the configured timezone to a fixed UTC offset.
    ///
    /// Accepts "UTC"/"Z" and "+HH:MM"/"-HH:MM". Named zones are not resolved
    /// and fall back to UTC with a warning.
    pub fn utc_offset(&self) -> chrono::FixedOffset {
        let utc = chrono::Utc.fix();
        let tz = self.timezone.trim();
        if tz.is_empty() || tz.eq_ignore_ascii_case("utc") || tz == "Z" {
            return utc;
        }
        match parse_offset(tz) {
            Some(offset) => offset,
            None => {
                tracing::warn!("⚠️ Unsupported timezone '{}', using UTC", tz);
                utc
            }
        }
    }
}

fn parse_offset(tz: &str) -> Option<chrono::FixedOffset> {
    let (sign, rest) = match tz.as_bytes().first()? {
        b'+' => (1, &tz[1..]),
        b'-' => (-1, &tz[1..]),
        _ => return None,
    };
    let (h, m) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = h.parse().ok()?;
    let minutes: i32 = m.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    chrono::FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Workflow orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Retries for steps with `on_error = "retry"`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay; retry n waits `retry_base_secs * 2^n`.
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
}

fn default_max_retries() -> u32 { 3 }
fn default_retry_base_secs() -> u64 { 1 }

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_secs: default_retry_base_secs(),
        }
    }
}

/// Outbound messaging used by `send_message` actions and alerts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MessagingConfig {
    /// Feishu/Lark custom-bot style webhook URL.
    #[serde(default)]
    pub webhook_url: String,
}

/// A named circuit breaker created at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    pub name: String,
    #[serde(default = "default_cb_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cb_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_cb_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub excluded_errors: Vec<String>,
}

fn default_cb_failure_threshold() -> u32 { 5 }
fn default_cb_success_threshold() -> u32 { 2 }
fn default_cb_timeout_secs() -> u64 { 60 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = LarkbotConfig::from_toml("").unwrap();
        assert!(config.scheduler.enabled);
        assert_eq!(config.scheduler.job_store_type, StoreType::Memory);
        assert_eq!(config.scheduler.failure_threshold, 3);
        assert_eq!(config.workflow.max_retries, 3);
        assert!(config.tasks.is_empty());
    }

    #[test]
    fn test_parse_full_tree() {
        let config = LarkbotConfig::from_toml(
            r#"
            [scheduler]
            enabled = false
            job_store_type = "sqlite"
            history_cap_scope = "global"
            history_max_records = 50

            [[circuit_breakers]]
            name = "http_request"
            failure_threshold = 2

            [[automations]]
            name = "morning"
            task = "daily"
            [automations.trigger]
            type = "schedule"
            [automations.trigger.schedule]
            mode = "cron"
            arguments = { expression = "0 9 * * *" }
            "#,
        )
        .unwrap();
        assert!(!config.scheduler.enabled);
        assert_eq!(config.scheduler.job_store_type, StoreType::Sqlite);
        assert_eq!(config.scheduler.history_cap_scope, HistoryCapScope::Global);
        assert_eq!(config.scheduler.history_max_records, 50);
        assert_eq!(config.circuit_breakers[0].failure_threshold, 2);
        assert_eq!(config.circuit_breakers[0].success_threshold, 2);
        assert_eq!(config.automations[0]["trigger"]["schedule"]["mode"], "cron");
    }

    #[test]
    fn test_timezone_offsets() {
        let mut cfg = SchedulerConfig::default();
        assert_eq!(cfg.utc_offset().local_minus_utc(), 0);
        cfg.timezone = "+08:00".into();
        assert_eq!(cfg.utc_offset().local_minus_utc(), 8 * 3600);
        cfg.timezone = "-05:30".into();
        assert_eq!(cfg.utc_offset().local_minus_utc(), -(5 * 3600 + 30 * 60));
        cfg.timezone = "Asia/Shanghai".into();
        assert_eq!(cfg.utc_offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join("larkbot-config-test");
        let path = dir.join("config.toml");
        let mut config = LarkbotConfig::default();
        config.scheduler.timezone = "+08:00".into();
        config.save_to(&path).unwrap();
        let loaded = LarkbotConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.timezone, "+08:00");
        std::fs::remove_dir_all(&dir).ok();
    }
}
