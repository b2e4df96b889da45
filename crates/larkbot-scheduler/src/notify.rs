//! Notifications raised by the scheduler (alerts, task summaries).
//! Kept in an in-memory ring buffer; delivery happens in `dispatch`.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Ring buffer size for notification history.
const HISTORY_LIMIT: usize = 100;

/// A notification to deliver to an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub priority: NotifyPriority,
    /// Which job/rule raised it.
    pub source: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Notification {
    pub fn new(title: &str, body: &str, source: &str, priority: NotifyPriority) -> Self {
        Self {
            title: title.to_string(),
            body: body.to_string(),
            priority,
            source: source.to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Single-line text rendering used by chat webhooks.
    pub fn to_text(&self) -> String {
        format!(
            "{} {}\n{}\n(source: {} • {})",
            self.priority.emoji(),
            self.title,
            self.body,
            self.source,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NotifyPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl NotifyPriority {
    pub fn emoji(self) -> &'static str {
        match self {
            Self::Urgent => "🚨",
            Self::High => "⚠️",
            Self::Normal => "📢",
            Self::Low => "ℹ️",
        }
    }
}

/// Records raised notifications.
#[derive(Debug, Default)]
pub struct NotifyRouter {
    history: VecDeque<Notification>,
}

impl NotifyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a notification, dropping the oldest beyond the history limit.
    pub fn record(&mut self, notification: Notification) {
        self.history.push_back(notification);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<Notification> {
        self.history.iter().cloned().collect()
    }

    pub fn from_source(&self, source: &str) -> Vec<Notification> {
        self.history
            .iter()
            .filter(|n| n.source == source)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_keeps_last_100() {
        let mut router = NotifyRouter::new();
        for i in 0..120 {
            router.record(Notification::new(&format!("n{i}"), "", "job", NotifyPriority::Low));
        }
        assert_eq!(router.len(), 100);
        assert_eq!(router.history()[0].title, "n20");
    }

    #[test]
    fn test_filter_by_source() {
        let mut router = NotifyRouter::new();
        router.record(Notification::new("a", "", "job-a", NotifyPriority::High));
        router.record(Notification::new("b", "", "job-b", NotifyPriority::High));
        assert_eq!(router.from_source("job-a").len(), 1);
    }

    #[test]
    fn test_text_rendering() {
        let n = Notification::new("Job failing", "3 failures", "sync", NotifyPriority::Urgent);
        let text = n.to_text();
        assert!(text.starts_with("🚨 Job failing"));
        assert!(text.contains("source: sync"));
    }
}
