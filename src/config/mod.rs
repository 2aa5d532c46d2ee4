pub mod validation;

use serde::{Deserialize, Serialize};
use std::fmt;

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// What the driver hands back when a stream is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// Return the partial transcript with the cancellation error.
    #[default]
    DeliverPartial,
    /// Drop the partial transcript.
    Discard,
}

/// How a failing tool-call handler affects the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorPolicy {
    /// Abort the stream with a handler error.
    #[default]
    Abort,
    /// Record the failure as the invocation's result and keep consuming.
    MarkFailed,
}

impl fmt::Display for CancelPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelPolicy::DeliverPartial => write!(f, "deliver_partial"),
            CancelPolicy::Discard => write!(f, "discard"),
        }
    }
}

impl fmt::Display for HandlerErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerErrorPolicy::Abort => write!(f, "abort"),
            HandlerErrorPolicy::MarkFailed => write!(f, "mark_failed"),
        }
    }
}

/// Per-stream behavior of the driver and assembler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_message_id_prefix")]
    pub message_id_prefix: String,
    /// Seconds without an event before the stream is cancelled. `None` waits forever.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub cancel_policy: CancelPolicy,
    #[serde(default)]
    pub handler_error_policy: HandlerErrorPolicy,
}

fn default_message_id_prefix() -> String {
    "msg".to_string()
}
#[allow(clippy::unnecessary_wraps)]
fn default_idle_timeout_secs() -> Option<u64> {
    Some(120)
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            message_id_prefix: default_message_id_prefix(),
            idle_timeout_secs: default_idle_timeout_secs(),
            cancel_policy: CancelPolicy::default(),
            handler_error_policy: HandlerErrorPolicy::default(),
        }
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] when parsing fails or
/// [`ConfigError::Validation`] when semantic validation fails.
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}
