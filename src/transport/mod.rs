//! Transport layer for broker communication
//!
//! This module provides the transport abstraction the client is written
//! against, plus the AMQP implementation backed by `lapin`. The traits exist
//! so the connection, consumer and monitor logic can be driven by an
//! in-memory broker in tests (see [`crate::testing::MockBroker`]).

use crate::config::BrokerSection;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

pub mod amqp;

/// Low-level transport errors, classified so callers can decide what is retryable
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Channel is closed")]
    ChannelClosed,
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Broker rejected the operation: {0}")]
    Rejected(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether a fresh connection could plausibly make this error go away
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed(_)
                | TransportError::ConnectionLost(_)
                | TransportError::ChannelClosed
        )
    }
}

/// Parameters for a queue declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    /// Only check that the queue exists, never create it
    pub passive: bool,
}

impl QueueOptions {
    pub fn durable(durable: bool) -> Self {
        Self {
            durable,
            passive: false,
        }
    }

    pub fn passive() -> Self {
        Self {
            durable: false,
            passive: true,
        }
    }
}

/// Broker's answer to a queue declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A single message pushed by the broker to a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Bytes,
    pub redelivered: bool,
}

/// Stream of deliveries for one subscription. An `Err` item means the
/// subscription is broken (usually a lost connection).
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Factory for broker connections
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection to the broker described by `broker`
    async fn connect(&self, broker: &BrokerSection) -> Result<Box<dyn Connection>, TransportError>;
}

/// A live broker connection
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Open a new channel multiplexed over this connection
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError>;

    /// Close the connection; closing an already-closed connection is an error
    /// the caller is expected to tolerate
    async fn close(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}

/// Queue operations on one channel
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<QueueInfo, TransportError>;

    /// Publish to the default exchange with `routing_key` as the target queue.
    /// Resolves once the broker confirmed the message (when confirms are on).
    async fn basic_publish(
        &self,
        routing_key: &str,
        body: Bytes,
        persistent: bool,
        content_type: Option<&str>,
    ) -> Result<(), TransportError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}

/// Type alias for the production transport
pub type AmqpTransport = amqp::LapinTransport;
