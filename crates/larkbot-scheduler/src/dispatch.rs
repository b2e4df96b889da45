//! Outbound delivery: alerts and `send_message` actions.
//! Supports: Feishu/Lark custom-bot webhook, generic HTTP webhook, log-only.

use std::time::Duration;

use async_trait::async_trait;

use crate::notify::Notification;

/// Where a notification goes.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyTarget {
    /// Feishu/Lark custom bot: `{"msg_type": "text", "content": {"text": ..}}`.
    Feishu { webhook_url: String },
    /// Generic HTTP webhook: POST the notification as JSON.
    Webhook {
        url: String,
        headers: Vec<(String, String)>,
    },
    /// Log only.
    Log,
}

impl NotifyTarget {
    /// Pick a target for a configured URL: Feishu/Lark bot hooks get the bot
    /// payload, anything else the generic JSON body. Empty → log only.
    pub fn from_url(url: &str) -> Self {
        if url.is_empty() {
            Self::Log
        } else if url.contains("/open-apis/bot/") {
            Self::Feishu {
                webhook_url: url.to_string(),
            }
        } else {
            Self::Webhook {
                url: url.to_string(),
                headers: Vec::new(),
            }
        }
    }
}

/// Dispatch a notification to a target.
/// Returns Ok(()) on success, Err(reason) on failure.
pub async fn dispatch(
    client: &reqwest::Client,
    notification: &Notification,
    target: &NotifyTarget,
) -> Result<(), String> {
    match target {
        NotifyTarget::Feishu { webhook_url } => {
            post_json(client, webhook_url, &[], &feishu_text_payload(&notification.to_text())).await
        }
        NotifyTarget::Webhook { url, headers } => {
            let body = serde_json::json!({
                "title": notification.title,
                "body": notification.body,
                "priority": notification.priority,
                "source": notification.source,
                "timestamp": notification.timestamp.to_rfc3339(),
            });
            post_json(client, url, headers, &body).await
        }
        NotifyTarget::Log => {
            tracing::info!("📢 [{}] {}: {}", notification.source, notification.title, notification.body);
            Ok(())
        }
    }
}

/// Feishu/Lark custom-bot text message body.
pub fn feishu_text_payload(text: &str) -> serde_json::Value {
    serde_json::json!({
        "msg_type": "text",
        "content": { "text": text }
    })
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
    body: &serde_json::Value,
) -> Result<(), String> {
    let mut req = client.post(url).json(body).timeout(Duration::from_secs(10));
    for (key, value) in headers {
        req = req.header(key.as_str(), value.as_str());
    }

    let resp = req
        .send()
        .await
        .map_err(|e| format!("Webhook send failed: {e}"))?;

    if resp.status().is_success() {
        tracing::debug!("✅ Webhook delivered to {}", url);
        Ok(())
    } else {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        Err(format!("Webhook error {status}: {text}"))
    }
}

/// Sends chat messages for `send_message` actions.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Deliver `text` to `target` (chat/user id; provider-specific, may be empty).
    async fn send_message(&self, target: &str, text: &str) -> Result<(), String>;
}

/// [`MessageSender`] posting to a single Feishu/Lark bot webhook.
pub struct WebhookMessageSender {
    client: reqwest::Client,
    webhook_url: String,
}

impl WebhookMessageSender {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl MessageSender for WebhookMessageSender {
    async fn send_message(&self, target: &str, text: &str) -> Result<(), String> {
        if self.webhook_url.is_empty() {
            return Err("messaging.webhook_url is not configured".into());
        }
        tracing::debug!("💬 Sending message to '{}' via webhook", target);
        post_json(&self.client, &self.webhook_url, &[], &feishu_text_payload(text)).await
    }
}

/// [`MessageSender`] that only logs. Used when no webhook is configured.
#[derive(Debug, Default)]
pub struct LogMessageSender;

#[async_trait]
impl MessageSender for LogMessageSender {
    async fn send_message(&self, target: &str, text: &str) -> Result<(), String> {
        tracing::info!("💬 [{}] {}", if target.is_empty() { "-" } else { target }, text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyPriority;

    #[test]
    fn test_target_from_url() {
        assert_eq!(NotifyTarget::from_url(""), NotifyTarget::Log);
        assert!(matches!(
            NotifyTarget::from_url("https://open.feishu.cn/open-apis/bot/v2/hook/abc"),
            NotifyTarget::Feishu { .. }
        ));
        assert!(matches!(
            NotifyTarget::from_url("https://example.com/alerts"),
            NotifyTarget::Webhook { .. }
        ));
    }

    #[test]
    fn test_feishu_payload_shape() {
        let p = feishu_text_payload("hi");
        assert_eq!(p["msg_type"], "text");
        assert_eq!(p["content"]["text"], "hi");
    }

    #[tokio::test]
    async fn test_log_target_always_succeeds() {
        let n = Notification::new("t", "b", "s", NotifyPriority::Low);
        let client = reqwest::Client::new();
        assert!(dispatch(&client, &n, &NotifyTarget::Log).await.is_ok());
        assert!(LogMessageSender.send_message("", "hello").await.is_ok());
    }

    #[tokio::test]
    async fn test_unconfigured_webhook_sender_errors() {
        let sender = WebhookMessageSender::new("");
        assert!(sender.send_message("chat", "hi").await.is_err());
    }
}
