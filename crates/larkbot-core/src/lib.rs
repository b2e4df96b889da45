//! # Larkbot Core
//!
//! Shared configuration, error taxonomy and reliability primitives used by
//! the scheduler, trigger and workflow layers.

pub mod config;
pub mod error;
pub mod reliability;

pub use config::LarkbotConfig;
pub use error::{LarkbotError, Result};
pub use reliability::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitBreakerStats, CircuitState, RetryPolicy,
};
