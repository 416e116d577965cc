//! Client configuration
//!
//! Loaded from a TOML file; every section is optional and the defaults
//! describe a local broker with the `guest` account and a queue named
//! `hello`. Credentials can be given literally or through environment
//! variables, which are resolved at runtime rather than at load time.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Longest queue name the broker accepts (AMQP short string)
pub const MAX_QUEUE_NAME_LEN: usize = 255;

/// Main client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub retry: RetrySection,
}

/// Target queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSection {
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_true")]
    pub durable: bool,
    /// Unacknowledged deliveries the broker may push ahead of the handler
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            durable: true,
            prefetch_count: default_prefetch_count(),
        }
    }
}

/// Broker address, credentials and keepalive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_amqp_port")]
    pub port: u16,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Literal username, used when `username_env` is unset or missing
    #[serde(default = "default_guest")]
    pub username: String,
    #[serde(default = "default_guest")]
    pub password: String,
    /// Environment variable containing the username
    pub username_env: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    /// Heartbeat interval negotiated with the broker (0 disables heartbeats)
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Wait for broker confirms on every publish
    #[serde(default = "default_true")]
    pub publisher_confirms: bool,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_amqp_port(),
            vhost: default_vhost(),
            username: default_guest(),
            password: default_guest(),
            username_env: None,
            password_env: None,
            heartbeat_secs: default_heartbeat_secs(),
            publisher_confirms: true,
        }
    }
}

/// Resolved login for the broker and its management API
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl BrokerSection {
    /// Resolve credentials, preferring environment variables when configured
    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: get_env_var_optional(self.username_env.as_ref())
                .unwrap_or_else(|| self.username.clone()),
            password: get_env_var_optional(self.password_env.as_ref())
                .unwrap_or_else(|| self.password.clone()),
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// `host:port/vhost`, safe to log
    pub fn display_address(&self) -> String {
        format!("{}:{}{}", self.host, self.port, display_vhost(&self.vhost))
    }
}

fn display_vhost(vhost: &str) -> String {
    if vhost.starts_with('/') {
        vhost.to_string()
    } else {
        format!("/{vhost}")
    }
}

/// Where the queue monitor reads its statistics from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatsSourceKind {
    /// HTTP management API (`/api/queues/{vhost}/{queue}`)
    Management,
    /// Passive declare on a dedicated channel
    Channel,
}

/// Queue monitor settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorSection {
    #[serde(default = "default_stats_source")]
    pub source: StatsSourceKind,
    /// Management API base URL; derived from the broker host when unset
    pub management_url: Option<String>,
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
    /// Per-request timeout for the management API
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Stop the session after this many failed ticks in a row (unset = never)
    pub max_consecutive_failures: Option<u32>,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            source: default_stats_source(),
            management_url: None,
            interval_secs: default_monitor_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_consecutive_failures: None,
        }
    }
}

impl MonitorSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn management_url(&self, broker: &BrokerSection) -> String {
        self.management_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:15672", broker.host))
    }
}

/// Retry policies for the two retried operations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default = "RetrySettings::connect")]
    pub connect: RetrySettings,
    #[serde(default = "RetrySettings::subscribe")]
    pub subscribe: RetrySettings,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            connect: RetrySettings::connect(),
            subscribe: RetrySettings::subscribe(),
        }
    }
}

/// Serialized form of a [`RetryPolicy`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    pub attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_ms")]
    pub min_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_ms: u64,
}

impl RetrySettings {
    fn connect() -> Self {
        Self::from(&RetryPolicy::connect())
    }

    fn subscribe() -> Self {
        Self::from(&RetryPolicy::subscribe())
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.attempts,
            base_delay: Duration::from_millis(self.base_ms),
            min_delay: Duration::from_millis(self.min_ms),
            max_delay: Duration::from_millis(self.max_ms),
        }
    }
}

impl From<&RetryPolicy> for RetrySettings {
    fn from(policy: &RetryPolicy) -> Self {
        Self {
            attempts: policy.max_attempts,
            base_ms: policy.base_delay.as_millis() as u64,
            min_ms: policy.min_delay.as_millis() as u64,
            max_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

fn default_queue_name() -> String {
    "hello".to_string()
}

fn default_true() -> bool {
    true
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_amqp_port() -> u16 {
    5672
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_guest() -> String {
    "guest".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_stats_source() -> StatsSourceKind {
    StatsSourceKind::Management
}

fn default_monitor_interval_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid queue name: {0}")]
    InvalidQueueName(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_queue_name(&self.queue.name)?;

        if self.broker.host.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.host must not be empty".to_string(),
            ));
        }
        if self.broker.heartbeat_secs > u64::from(u16::MAX) {
            return Err(ConfigError::InvalidConfig(format!(
                "broker.heartbeat_secs must be at most {}",
                u16::MAX
            )));
        }
        if self.monitor.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "monitor.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.monitor.max_consecutive_failures == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "monitor.max_consecutive_failures must be greater than 0 or unset".to_string(),
            ));
        }

        self.retry
            .connect
            .policy()
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(format!("retry.connect: {e}")))?;
        self.retry
            .subscribe
            .policy()
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(format!("retry.subscribe: {e}")))?;

        Ok(())
    }

    pub fn connect_policy(&self) -> RetryPolicy {
        self.retry.connect.policy()
    }

    pub fn subscribe_policy(&self) -> RetryPolicy {
        self.retry.subscribe.policy()
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[queue]
name = "test-queue"

[broker]
host = "localhost"
heartbeat_secs = 30

[monitor]
interval_secs = 5
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Validate queue name: non-empty, fits an AMQP short string, and does not
/// use the broker-reserved `amq.` prefix
pub fn validate_queue_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::InvalidQueueName(
            "queue name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_QUEUE_NAME_LEN {
        return Err(ConfigError::InvalidQueueName(format!(
            "queue name is {} bytes, limit is {MAX_QUEUE_NAME_LEN}",
            name.len()
        )));
    }
    if name.starts_with("amq.") {
        return Err(ConfigError::InvalidQueueName(format!(
            "'{name}' uses the reserved 'amq.' prefix"
        )));
    }
    Ok(())
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}
