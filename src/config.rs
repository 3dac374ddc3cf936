//! Configuration module for the log forwarder.
//!
//! The host hands the forwarder a configuration map at startup. This module
//! deserializes that map into a [`Config`], fills in defaults for every
//! optional setting, and validates the result. Configuration can also be read
//! from `LOG_FORWARDER_*` environment variables.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::record::Severity;

/// Default ingestion endpoint.
const DEFAULT_API_URL: &str = "http://localhost:8000/logs";

/// Default application name when neither the map nor the environment sets one.
const DEFAULT_APP_NAME: &str = "app";

/// Default total timeout for direct delivery, in seconds.
const DEFAULT_DIRECT_TIMEOUT_SECS: u64 = 5;

/// Default connect timeout for direct delivery, in seconds.
const DEFAULT_DIRECT_CONNECT_TIMEOUT_SECS: u64 = 2;

/// Default job queue connection name.
const DEFAULT_QUEUE_CONNECTION: &str = "default";

/// Default queue name for delivery tasks.
const DEFAULT_QUEUE_NAME: &str = "logs";

/// Default base backoff between delivery attempts, in seconds.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Default number of delivery attempts per task.
const DEFAULT_MAX_TRIES: u32 = 3;

/// Upper bound for any configured timeout, in seconds.
const MAX_TIMEOUT_SECS: u64 = 300;

/// How records leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Synchronous HTTP POST on the caller's task.
    Direct,
    /// Deferred delivery through a job queue.
    Queue,
}

impl SendMode {
    /// Every accepted mode name, in the order they are documented.
    pub const NAMES: [&'static str; 2] = ["direct", "queue"];

    pub fn as_str(&self) -> &'static str {
        match self {
            SendMode::Direct => "direct",
            SendMode::Queue => "queue",
        }
    }
}

impl fmt::Display for SendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SendMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(SendMode::Direct),
            "queue" => Ok(SendMode::Queue),
            other => Err(ConfigError::UnsupportedMode {
                mode: other.to_string(),
            }),
        }
    }
}

/// Settings for synchronous delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectConfig {
    /// Total request timeout in seconds
    #[serde(rename = "timeout")]
    pub timeout_secs: u64,

    /// Connection establishment timeout in seconds
    #[serde(rename = "connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl DirectConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_DIRECT_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_DIRECT_CONNECT_TIMEOUT_SECS,
        }
    }
}

/// Routing and retry settings for queued delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Name of the job queue connection to enqueue on
    pub connection: String,

    /// Name of the queue within that connection
    pub queue_name: String,

    /// Seconds to wait before the first delivery attempt
    #[serde(rename = "delay")]
    pub delay_secs: u64,

    /// Base backoff in seconds; doubles after every failed attempt
    #[serde(rename = "retry_after")]
    pub retry_after_secs: u64,

    /// Maximum number of delivery attempts
    pub max_tries: u32,
}

impl QueueConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            connection: DEFAULT_QUEUE_CONNECTION.to_string(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            delay_secs: 0,
            retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
            max_tries: DEFAULT_MAX_TRIES,
        }
    }
}

/// Configuration for the log forwarder.
///
/// A `Config` is treated as immutable once a sender has been built from it.
/// Reconfiguring means building a new sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Secret sent in the `X-API-KEY` header
    pub api_key: String,

    /// Ingestion endpoint receiving the POSTed payloads
    pub api_url: String,

    /// Application name stamped on every payload
    pub app_name: String,

    /// Optional application identifier stamped on every payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_uuid: Option<String>,

    /// Delivery mode, `direct` or `queue`
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Minimum severity a handler forwards
    #[serde(default)]
    pub level: Severity,

    #[serde(default)]
    pub direct: DirectConfig,

    #[serde(default)]
    pub queue: QueueConfig,
}

fn default_mode() -> String {
    SendMode::Direct.as_str().to_string()
}

/// Errors raised while loading or interpreting configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting is missing or has an unusable value
    Invalid {
        message: String,
        key: Option<String>,
    },

    /// `mode` is neither `direct` nor `queue`
    UnsupportedMode { mode: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid {
                message,
                key: Some(key),
            } => write!(f, "Configuration error for {}: {}", key, message),
            ConfigError::Invalid { message, key: None } => {
                write!(f, "Configuration error: {}", message)
            }
            ConfigError::UnsupportedMode { mode } => write!(
                f,
                "Unsupported mode: {}. Supported modes are: {}",
                mode,
                SendMode::NAMES.join(", ")
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Invalid {
            message: err.to_string(),
            key: None,
        }
    }
}

impl Config {
    /// Build a configuration with the three required settings and defaults
    /// for everything else.
    pub fn new(
        api_key: impl Into<String>,
        api_url: impl Into<String>,
        app_name: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            api_url: api_url.into(),
            app_name: app_name.into(),
            app_uuid: None,
            mode: default_mode(),
            level: Severity::default(),
            direct: DirectConfig::default(),
            queue: QueueConfig::default(),
        }
    }

    /// Deserialize a configuration map handed over by the host.
    ///
    /// # Examples
    ///
    /// ```
    /// use log_forwarder::config::Config;
    /// use serde_json::json;
    ///
    /// let config = Config::from_value(json!({
    ///     "api_key": "secret",
    ///     "api_url": "https://ingest.example.com/logs",
    ///     "app_name": "billing",
    ///     "mode": "queue",
    ///     "queue": { "retry_after": 30 }
    /// }))
    /// .unwrap();
    /// assert_eq!(config.queue.retry_after_secs, 30);
    /// assert_eq!(config.queue.max_tries, 3);
    /// ```
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_value(value)?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    ///
    /// - `LOG_FORWARDER_API_KEY` (required)
    /// - `LOG_FORWARDER_API_URL` (default: http://localhost:8000/logs)
    /// - `LOG_FORWARDER_APP_NAME`, falling back to `APP_NAME`
    /// - `LOG_FORWARDER_APP_UUID`
    /// - `LOG_FORWARDER_MODE` (default: direct)
    /// - `LOG_FORWARDER_LEVEL` (default: debug)
    /// - `LOG_FORWARDER_DIRECT_TIMEOUT`, `LOG_FORWARDER_DIRECT_CONNECT_TIMEOUT`
    /// - `LOG_FORWARDER_QUEUE_CONNECTION`, `LOG_FORWARDER_QUEUE_NAME`,
    ///   `LOG_FORWARDER_QUEUE_DELAY`, `LOG_FORWARDER_QUEUE_RETRY_AFTER`,
    ///   `LOG_FORWARDER_QUEUE_MAX_TRIES`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the API key is missing or a numeric or level
    /// variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = env::var("LOG_FORWARDER_API_KEY")
            .map_err(|_| ConfigError::invalid("LOG_FORWARDER_API_KEY", "must be set"))?;

        let api_url = env::var("LOG_FORWARDER_API_URL")
            .unwrap_or_else(|_| DEFAULT_API_URL.to_string());

        let app_name = env::var("LOG_FORWARDER_APP_NAME")
            .or_else(|_| env::var("APP_NAME"))
            .unwrap_or_else(|_| DEFAULT_APP_NAME.to_string());

        let level = match env::var("LOG_FORWARDER_LEVEL") {
            Ok(value) => value
                .parse()
                .map_err(|e| ConfigError::invalid("LOG_FORWARDER_LEVEL", format!("{}", e)))?,
            Err(_) => Severity::default(),
        };

        let direct = DirectConfig {
            timeout_secs: parse_secs("LOG_FORWARDER_DIRECT_TIMEOUT", DEFAULT_DIRECT_TIMEOUT_SECS)?,
            connect_timeout_secs: parse_secs(
                "LOG_FORWARDER_DIRECT_CONNECT_TIMEOUT",
                DEFAULT_DIRECT_CONNECT_TIMEOUT_SECS,
            )?,
        };

        let queue = QueueConfig {
            connection: env::var("LOG_FORWARDER_QUEUE_CONNECTION")
                .unwrap_or_else(|_| DEFAULT_QUEUE_CONNECTION.to_string()),
            queue_name: env::var("LOG_FORWARDER_QUEUE_NAME")
                .unwrap_or_else(|_| DEFAULT_QUEUE_NAME.to_string()),
            delay_secs: parse_secs("LOG_FORWARDER_QUEUE_DELAY", 0)?,
            retry_after_secs: parse_secs(
                "LOG_FORWARDER_QUEUE_RETRY_AFTER",
                DEFAULT_RETRY_AFTER_SECS,
            )?,
            max_tries: parse_number("LOG_FORWARDER_QUEUE_MAX_TRIES", DEFAULT_MAX_TRIES)?,
        };

        Ok(Self {
            api_key,
            api_url: api_url.trim().to_string(),
            app_name,
            app_uuid: env::var("LOG_FORWARDER_APP_UUID").ok(),
            mode: env::var("LOG_FORWARDER_MODE").unwrap_or_else(|_| default_mode()),
            level,
            direct,
            queue,
        })
    }

    /// Interpret the `mode` setting.
    pub fn send_mode(&self) -> Result<SendMode, ConfigError> {
        self.mode.parse()
    }

    /// A copy of this configuration with the mode forced to `direct`.
    pub fn as_direct(&self) -> Self {
        Self {
            mode: SendMode::Direct.as_str().to_string(),
            ..self.clone()
        }
    }

    /// Check that required settings are present and limits are respected.
    ///
    /// The mode is interpreted separately by [`Config::send_mode`] so that an
    /// unknown mode surfaces as [`ConfigError::UnsupportedMode`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::invalid("api_key", "cannot be empty"));
        }

        if self.api_url.trim().is_empty() {
            return Err(ConfigError::invalid("api_url", "cannot be empty"));
        }

        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(ConfigError::invalid(
                "api_url",
                format!("'{}' is not an http(s) URL", self.api_url),
            ));
        }

        if self.app_name.trim().is_empty() {
            return Err(ConfigError::invalid("app_name", "cannot be empty"));
        }

        check_timeout("direct.timeout", self.direct.timeout_secs)?;
        check_timeout("direct.connect_timeout", self.direct.connect_timeout_secs)?;

        if self.queue.max_tries == 0 {
            return Err(ConfigError::invalid(
                "queue.max_tries",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

fn check_timeout(key: &str, secs: u64) -> Result<(), ConfigError> {
    if secs == 0 {
        return Err(ConfigError::invalid(key, "must be greater than 0"));
    }

    if secs > MAX_TIMEOUT_SECS {
        return Err(ConfigError::invalid(
            key,
            format!("{}s exceeds maximum ({}s)", secs, MAX_TIMEOUT_SECS),
        ));
    }

    Ok(())
}

fn parse_secs(env_var: &str, default: u64) -> Result<u64, ConfigError> {
    parse_number(env_var, default)
}

fn parse_number<T: FromStr>(env_var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(env_var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid(env_var, format!("'{}' is not a valid number", value))),
        Err(_) => Ok(default),
    }
}
