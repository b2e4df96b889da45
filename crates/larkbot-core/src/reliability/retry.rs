//! Retry policy shared by workflow steps and task actions.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::WorkflowConfig;

/// Bounded retry with exponential backoff.
///
/// ```
/// use larkbot_core::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_retries(3)
///     .with_initial_interval(Duration::from_secs(1));
///
/// assert_eq!(policy.delay_for_retry(0), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_retry(2), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound for any single delay
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means ±10%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// 3 retries, 1s initial, 2x backoff, 5 minute cap, no jitter.
    pub fn exponential() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(300),
            backoff_coefficient: 2.0,
            jitter: 0.0,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn fixed(interval: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (0-based): `initial * coefficient^retry`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry).unwrap_or(i32::MAX);
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exp);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        if jittered.is_finite() {
            Duration::from_secs_f64(jittered)
        } else {
            self.max_interval
        }
    }

    pub fn has_retries_remaining(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}

impl From<&WorkflowConfig> for RetryPolicy {
    fn from(cfg: &WorkflowConfig) -> Self {
        Self::exponential()
            .with_max_retries(cfg.max_retries)
            .with_initial_interval(Duration::from_secs(cfg.retry_base_secs))
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.delay_for_retry(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(8));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::exponential().with_max_interval(Duration::from_secs(5));
        assert_eq!(policy.delay_for_retry(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for_retry(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_no_retry_and_fixed() {
        assert!(!RetryPolicy::no_retry().has_retries_remaining(0));
        let fixed = RetryPolicy::fixed(Duration::from_millis(250), 2);
        assert_eq!(fixed.delay_for_retry(0), Duration::from_millis(250));
        assert_eq!(fixed.delay_for_retry(1), Duration::from_millis(250));
        assert!(fixed.has_retries_remaining(1));
        assert!(!fixed.has_retries_remaining(2));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::fixed(Duration::from_secs(10), 1).with_jitter(0.1);
        for _ in 0..50 {
            let d = policy.delay_for_retry(0).as_secs_f64();
            assert!((9.0..=11.0).contains(&d));
        }
    }

    #[test]
    fn test_from_workflow_config() {
        let cfg = WorkflowConfig { max_retries: 2, retry_base_secs: 3 };
        let policy = RetryPolicy::from(&cfg);
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(6));
    }
}
