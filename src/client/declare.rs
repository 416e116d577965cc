//! Idempotent queue declaration

use super::connection::ChannelHandle;
use crate::config::{validate_queue_name, ConfigError};
use crate::error::DeclarationError;
use crate::transport::{QueueOptions, TransportError};
use tracing::{error, info};

/// A queue that has been declared on the broker.
///
/// Publisher, consumer and monitor all take one of these, so nothing can use
/// a queue before it was declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub durable: bool,
    /// Ready messages when the declare was answered
    pub message_count: u32,
    /// Consumers when the declare was answered
    pub consumer_count: u32,
}

/// Declares queues on a channel
#[derive(Debug, Clone)]
pub struct QueueDeclarator {
    channel: ChannelHandle,
}

impl QueueDeclarator {
    pub fn new(channel: ChannelHandle) -> Self {
        Self { channel }
    }

    /// Ensure `name` exists with the given durability. Safe to repeat.
    ///
    /// A durability mismatch with an existing queue is
    /// [`DeclarationError::Conflict`] and is never retried.
    pub async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
    ) -> Result<QueueHandle, DeclarationError> {
        validate_queue_name(name).map_err(|e| match e {
            ConfigError::InvalidQueueName(reason) => DeclarationError::InvalidQueueName(reason),
            other => DeclarationError::InvalidQueueName(other.to_string()),
        })?;

        if !self.channel.is_open() {
            return Err(DeclarationError::ChannelClosed {
                queue: name.to_string(),
            });
        }

        let info = self
            .channel
            .queue_declare(name, QueueOptions::durable(durable))
            .await
            .map_err(|e| map_declare_error(name, e))?;

        info!(
            "Queue '{}' declared (durable={}, messages={}, consumers={})",
            info.name, durable, info.message_count, info.consumer_count
        );
        Ok(QueueHandle {
            name: info.name,
            durable,
            message_count: info.message_count,
            consumer_count: info.consumer_count,
        })
    }

    /// Look up an existing queue without creating it
    pub async fn inspect_queue(&self, name: &str) -> Result<QueueHandle, DeclarationError> {
        if !self.channel.is_open() {
            return Err(DeclarationError::ChannelClosed {
                queue: name.to_string(),
            });
        }

        let info = self
            .channel
            .queue_declare(name, QueueOptions::passive())
            .await
            .map_err(|e| map_declare_error(name, e))?;

        Ok(QueueHandle {
            name: info.name,
            // Passive declares do not report durability
            durable: false,
            message_count: info.message_count,
            consumer_count: info.consumer_count,
        })
    }
}

fn map_declare_error(queue: &str, error: TransportError) -> DeclarationError {
    let mapped = match error {
        TransportError::PreconditionFailed(message) => DeclarationError::Conflict {
            queue: queue.to_string(),
            message,
        },
        TransportError::NotFound(_) => DeclarationError::NotFound {
            queue: queue.to_string(),
        },
        TransportError::ChannelClosed => DeclarationError::ChannelClosed {
            queue: queue.to_string(),
        },
        other => DeclarationError::Transport {
            queue: queue.to_string(),
            source: other,
        },
    };
    error!("{}", mapped);
    mapped
}
