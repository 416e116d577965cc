//! Error taxonomy for the queue client
//!
//! Each component has its own error type so the retry decision is visible in
//! the type: connection and subscription faults are retried locally with a
//! bounded policy, declaration conflicts and exhausted retries propagate to the
//! caller unchanged. [`ClientError`] aggregates them for the lifecycle layer.

use crate::client::connection::ConnectionState;
use crate::config::ConfigError;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Top-level error returned by lifecycle operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Declaration error: {0}")]
    Declaration(#[from] DeclarationError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Transport or authentication failure while establishing the session
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection failed after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: TransportError,
    },

    #[error("Connection attempt cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Failed to open channel")]
    ChannelOpen(#[source] TransportError),
}

/// Queue declaration failure. Never retried.
#[derive(Debug, Error)]
pub enum DeclarationError {
    #[error("Cannot declare queue '{queue}': channel is not open")]
    ChannelClosed { queue: String },

    #[error("Queue '{queue}' exists with incompatible parameters: {message}")]
    Conflict { queue: String, message: String },

    #[error("Queue '{queue}' does not exist")]
    NotFound { queue: String },

    #[error("Invalid queue name: {0}")]
    InvalidQueueName(String),

    #[error("Declaring queue '{queue}' failed")]
    Transport {
        queue: String,
        #[source]
        source: TransportError,
    },
}

/// Failure while sending a message. Surfaced, never retried: the broker may
/// already hold the message.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to serialize payload")]
    Serialization(#[source] serde_json::Error),

    #[error("Cannot publish to '{queue}': channel is not open")]
    ChannelClosed { queue: String },

    #[error("Broker rejected message for '{queue}'")]
    Rejected { queue: String },

    #[error("Publishing to '{queue}' failed")]
    Transport {
        queue: String,
        #[source]
        source: TransportError,
    },
}

/// Error returned by a message handler
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A handler failed on one delivery. The message is nacked without requeue
/// and consumption continues, so this is logged and counted, not propagated.
#[derive(Debug, Error)]
#[error("Handler failed for delivery {delivery_tag}")]
pub struct ConsumeError {
    pub delivery_tag: u64,
    #[source]
    pub source: HandlerError,
}

/// The subscription itself broke (subscribe refused, connection lost mid-stream)
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Subscription to '{queue}' failed after {attempts} attempts")]
    RetriesExhausted {
        queue: String,
        attempts: u32,
        #[source]
        last: TransportError,
    },

    #[error("Broker refused subscription to '{queue}'")]
    Refused {
        queue: String,
        #[source]
        source: TransportError,
    },
}

/// A queue statistics query failed. Non-fatal per tick.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Management API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Management API request failed: HTTP {status}")]
    Status { status: u16 },

    #[error("Management API returned an unexpected body: {0}")]
    Decode(String),

    #[error("Queue statistics query failed")]
    Channel(#[source] TransportError),

    #[error("Invalid management URL: {0}")]
    InvalidUrl(String),

    #[error("Queue monitor gave up after {failures} consecutive failures")]
    TooManyFailures { failures: u32 },
}

static URL_CREDENTIALS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(amqps?|https?)://([^:/@\s]+):([^@\s]+)@").expect("valid regex")
});

static KEY_VALUE_SECRETS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|secret)[=:]\s*\S+").expect("valid regex")
});

/// Strip credentials from error text before it reaches the logs
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = URL_CREDENTIALS.replace_all(message, "$1://$2:***@");
    let mut sanitized = KEY_VALUE_SECRETS
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    // Truncate very long messages - total length stays <= 500 bytes
    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
