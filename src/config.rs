//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{QueueConfig, RateLimitRule};

/// Prefix for environment variable overrides, e.g. `TURNSTILE__LOGGING__LEVEL`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What a limiter does when its state store fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Allow the request
    #[default]
    Open,
    /// Deny the request
    Closed,
}

/// Configuration for a single limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Rules, in any order; they are sorted by priority on load
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,

    /// Rule applied when no other rule matches
    #[serde(default)]
    pub default_rule: Option<RateLimitRule>,

    /// Queue limits; without them `on_limit: queue` rejects
    #[serde(default)]
    pub queue: Option<QueueConfig>,

    /// Background sweep interval in milliseconds, 0 disables it
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_ms: u64,

    /// How long stats survive without new requests, in milliseconds
    #[serde(default = "default_stats_retention")]
    pub stats_retention_ms: u64,

    #[serde(default)]
    pub store_failure: FailurePolicy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_rule: None,
            queue: None,
            cleanup_interval_ms: default_cleanup_interval(),
            stats_retention_ms: default_stats_retention(),
            store_failure: FailurePolicy::default(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    60_000
}

fn default_stats_retention() -> u64 {
    3_600_000
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `TURNSTILE__LIMITER__CLEANUP_INTERVAL_MS=5000` sets `limiter.cleanup_interval_ms`.
fn env_overrides() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

impl TurnstileConfig {
    /// Load configuration from a file, with `TURNSTILE__*` environment overrides.
    ///
    /// The format is inferred from the file extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        if !path.exists() {
            return Err(TurnstileError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        Self::load(path, env_overrides())
    }

    fn load(path: &Path, environment: config::Environment) -> Result<Self> {
        let config: TurnstileConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(environment)
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }
}
