//! Larkbot error types.

use thiserror::Error;

/// Top-level error for configuration loading and shared plumbing.
#[derive(Debug, Error)]
pub enum LarkbotError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, LarkbotError>;
