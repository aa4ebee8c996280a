//! Error types for Turnstile.

use thiserror::Error;

use crate::ratelimit::RateLimitResult;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule failed validation when it was registered
    #[error("Invalid rule '{rule_id}': {reason}")]
    InvalidRule { rule_id: String, reason: String },

    /// The budget for `key` is exhausted and the request could not be queued
    #[error("Rate limit exceeded for key '{key}'")]
    RateLimitExceeded {
        key: String,
        result: Box<RateLimitResult>,
    },

    /// A limiter with this name is already registered
    #[error("Limiter '{0}' already exists")]
    LimiterExists(String),

    /// State store backend errors
    #[error("State store error: {0}")]
    Store(String),

    /// JSON encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

impl TurnstileError {
    /// The decision carried by a [`TurnstileError::RateLimitExceeded`].
    pub fn rate_limit_result(&self) -> Option<&RateLimitResult> {
        match self {
            TurnstileError::RateLimitExceeded { result, .. } => Some(result),
            _ => None,
        }
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
