//! Circuit breaker for unreliable calls (provider APIs, webhooks, AI queries).
//!
//! ```text
//! ┌─────────┐  failure_threshold  ┌─────────┐  timeout elapsed  ┌──────────┐
//! │ Closed  │ ──────────────────► │  Open   │ ────────────────► │ HalfOpen │
//! └─────────┘                     └─────────┘                   └──────────┘
//!      ▲                               ▲          any failure        │
//!      │                               └─────────────────────────────┤
//!      │               success_threshold successes                   │
//!      └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! In `Closed`, a success decays the failure count by one instead of zeroing it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::CircuitBreakerSettings;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation: calls pass through.
    Closed,
    /// Rejecting calls until the timeout elapses.
    Open,
    /// Probing whether the protected operation recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures (while closed) that open the circuit. At least 1.
    pub failure_threshold: u32,
    /// Successes (while half-open) that close the circuit. At least 1.
    pub success_threshold: u32,
    /// How long the circuit stays open before a trial call is let through.
    pub timeout: Duration,
    /// Error names that never count as failures: the error's type name for
    /// [`CircuitBreaker::call`], the classifier's output for
    /// [`CircuitBreaker::call_classified`].
    pub excluded_errors: Vec<String>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            excluded_errors: Vec::new(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Exclude an error type (matched against the last path segment of its type name).
    pub fn with_excluded_error(mut self, type_name: impl Into<String>) -> Self {
        self.excluded_errors.push(type_name.into());
        self
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(s: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: s.failure_threshold.max(1),
            success_threshold: s.success_threshold.max(1),
            timeout: Duration::from_secs(s.timeout_secs),
            excluded_errors: s.excluded_errors.clone(),
        }
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open; the wrapped function was not invoked.
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },
    /// The wrapped function ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Seconds since the circuit last opened (None unless open/half-open).
    pub open_for_secs: Option<f64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

/// A named circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state, without applying the open → half-open timeout.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.lock().success_count
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let st = self.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: st.state,
            failure_count: st.failure_count,
            success_count: st.success_count,
            open_for_secs: st.opened_at.map(|t| t.elapsed().as_secs_f64()),
        }
    }

    /// Ask permission for one call. Moves Open → HalfOpen once the timeout
    /// has elapsed; returns false while the circuit is still open.
    pub fn try_acquire(&self) -> bool {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = st
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.timeout {
                    st.state = CircuitState::HalfOpen;
                    st.success_count = 0;
                    tracing::info!("🔌 Circuit '{}' half-open, probing", self.name);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => {
                st.failure_count = st.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                st.success_count += 1;
                if st.success_count >= self.config.success_threshold {
                    st.state = CircuitState::Closed;
                    st.failure_count = 0;
                    st.success_count = 0;
                    st.opened_at = None;
                    tracing::info!("✅ Circuit '{}' closed", self.name);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => {
                st.failure_count += 1;
                if st.failure_count >= self.config.failure_threshold {
                    self.open(&mut st);
                }
            }
            CircuitState::HalfOpen => self.open(&mut st),
            CircuitState::Open => {}
        }
    }

    fn open(&self, st: &mut BreakerState) {
        st.state = CircuitState::Open;
        st.success_count = 0;
        st.opened_at = Some(Instant::now());
        tracing::warn!(
            "⚡ Circuit '{}' opened after {} failure(s)",
            self.name,
            st.failure_count
        );
    }

    /// Whether an error of type `E` is excluded from failure counting.
    pub fn is_excluded<E>(&self) -> bool {
        self.excludes(short_type_name::<E>())
    }

    /// Whether errors named `kind` are excluded from failure counting.
    pub fn excludes(&self, kind: &str) -> bool {
        self.config.excluded_errors.iter().any(|e| e == kind)
    }

    /// Run `f` under the breaker. Errors are matched against
    /// `excluded_errors` by type name.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(f, |_| short_type_name::<E>()).await
    }

    /// Run `f` under the breaker. `classify` names each error for matching
    /// against `excluded_errors`, for error types that carry their own kind.
    pub async fn call_classified<F, Fut, T, E, C>(&self, f: F, classify: C) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> &str,
    {
        if !self.try_acquire() {
            return Err(CircuitBreakerError::Open {
                name: self.name.clone(),
            });
        }
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if !self.excludes(classify(&e)) {
                    self.record_failure();
                }
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    /// Force the circuit closed with zeroed counters.
    pub fn reset(&self) {
        let mut st = self.lock();
        st.state = CircuitState::Closed;
        st.failure_count = 0;
        st.success_count = 0;
        st.opened_at = None;
    }
}

/// `my_crate::errors::Timeout<Foo>` → `Timeout`.
fn short_type_name<E>() -> &'static str {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Name → breaker map shared by everything that wraps unreliable calls.
///
/// Constructed explicitly and passed down; there is no global instance.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry pre-populated from config.
    pub fn from_settings(settings: &[CircuitBreakerSettings]) -> Self {
        let registry = Self::new();
        for s in settings {
            registry.get_or_create(&s.name, CircuitBreakerConfig::from(s));
        }
        registry
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Existing breaker for `name`, or a new one with `config`.
    /// `config` is ignored when the breaker already exists.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    /// Run `f` under the named breaker, creating it if needed.
    pub async fn call<F, Fut, T, E>(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
        f: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.get_or_create(name, config);
        breaker.call(f).await
    }

    /// [`CircuitBreaker::call_classified`] under the named breaker, creating it if needed.
    pub async fn call_classified<F, Fut, T, E, C>(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
        f: F,
        classify: C,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> &str,
    {
        let breaker = self.get_or_create(name, config);
        breaker.call_classified(f, classify).await
    }

    /// Snapshot of every breaker, sorted by name.
    pub fn states(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.lock().values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn reset_all(&self) {
        for breaker in self.lock().values() {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct RateLimited;

    impl std::fmt::Display for RateLimited {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "rate limited")
        }
    }

    async fn fail(calls: &AtomicU32) -> Result<(), String> {
        calls.fetch_add(1, Ordering::SeqCst);
        Err("boom".into())
    }

    async fn succeed(calls: &AtomicU32) -> Result<(), String> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn breaker(failures: u32, successes: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::new()
                .with_failure_threshold(failures)
                .with_success_threshold(successes)
                .with_timeout(timeout),
        )
    }

    #[tokio::test]
    async fn test_opens_and_rejects_without_calling() {
        let cb = breaker(2, 1, Duration::from_secs(60));
        let calls = AtomicU32::new(0);

        assert!(cb.call(|| fail(&calls)).await.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.call(|| fail(&calls)).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.call(|| fail(&calls)).await.unwrap_err();
        assert!(err.is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_success_decays_failures() {
        let cb = breaker(5, 1, Duration::from_secs(60));
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = cb.call(|| fail(&calls)).await;
        }
        assert_eq!(cb.failure_count(), 3);
        cb.call(|| succeed(&calls)).await.unwrap();
        assert_eq!(cb.failure_count(), 2);

        cb.reset();
        cb.call(|| succeed(&calls)).await.unwrap();
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_single_failure_reopens() {
        let cb = breaker(3, 2, Duration::ZERO);
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = cb.call(|| fail(&calls)).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Zero timeout: the next call is a half-open trial and fails once.
        let err = cb.call(|| fail(&calls)).await.unwrap_err();
        assert!(!err.is_open());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_half_open_closes_after_success_threshold() {
        let cb = breaker(1, 2, Duration::ZERO);
        let calls = AtomicU32::new(0);
        let _ = cb.call(|| fail(&calls)).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.call(|| succeed(&calls)).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.success_count(), 1);
        cb.call(|| succeed(&calls)).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.success_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_until_timeout_elapses() {
        let cb = breaker(1, 1, Duration::from_secs(30));
        let calls = AtomicU32::new(0);
        let _ = cb.call(|| fail(&calls)).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.call(|| succeed(&calls)).await.unwrap_err().is_open());

        tokio::time::advance(Duration::from_secs(25)).await;
        cb.call(|| succeed(&calls)).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reset_forces_closed() {
        let cb = breaker(1, 1, Duration::from_secs(3600));
        let calls = AtomicU32::new(0);
        let _ = cb.call(|| fail(&calls)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.call(|| succeed(&calls)).await.unwrap();
    }

    #[tokio::test]
    async fn test_excluded_errors_do_not_count() {
        let cb = CircuitBreaker::new(
            "excluded",
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_excluded_error("RateLimited"),
        );
        for _ in 0..5 {
            let res: Result<(), _> = cb.call(|| async { Err(RateLimited) }).await;
            assert!(!res.unwrap_err().is_open());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_classified_errors_excluded_by_kind() {
        let cb = CircuitBreaker::new(
            "classified",
            CircuitBreakerConfig::new()
                .with_failure_threshold(2)
                .with_excluded_error("Timeout"),
        );
        fn kind(e: &String) -> &str {
            if e.starts_with("timed out") { "Timeout" } else { "Failed" }
        }

        for _ in 0..3 {
            let res: Result<(), _> = cb
                .call_classified(|| async { Err("timed out after 5s".to_string()) }, kind)
                .await;
            assert!(!res.unwrap_err().is_open());
        }
        assert_eq!(cb.failure_count(), 0);

        for _ in 0..2 {
            let _: Result<(), _> = cb.call_classified(|| async { Err("refused".to_string()) }, kind).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_registry_reuses_existing_breaker() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.get_or_create("feishu", CircuitBreakerConfig::new().with_failure_threshold(1));
        let b = registry.get_or_create("feishu", CircuitBreakerConfig::new().with_failure_threshold(9));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config().failure_threshold, 1);

        let calls = AtomicU32::new(0);
        let _ = registry
            .call("feishu", CircuitBreakerConfig::default(), || fail(&calls))
            .await;
        assert_eq!(registry.states()[0].state, CircuitState::Open);
        registry.reset_all();
        assert_eq!(a.state(), CircuitState::Closed);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_from_settings() {
        let settings = vec![CircuitBreakerSettings {
            name: "qq".into(),
            failure_threshold: 0,
            success_threshold: 3,
            timeout_secs: 5,
            excluded_errors: vec![],
        }];
        let registry = CircuitBreakerRegistry::from_settings(&settings);
        let cb = registry.get("qq").unwrap();
        assert_eq!(cb.config().failure_threshold, 1);
        assert_eq!(cb.config().timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<RateLimited>(), "RateLimited");
        assert_eq!(short_type_name::<String>(), "String");
    }
}
