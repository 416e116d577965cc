//! amqp-guard - resilient durable-queue client
//!
//! A client for an AMQP 0-9-1 broker (RabbitMQ) that keeps working through
//! broker restarts, network blips and management-plane outages.
//!
//! # Overview
//!
//! - Connection management with bounded exponential-backoff reconnect
//! - Idempotent queue declaration (durability conflicts are surfaced, never retried)
//! - Persistent publishing; JSON payloads encoded, bytes passed through
//! - Sequential consumption with ack on success and nack-without-requeue on failure
//! - Queue depth and consumer count monitoring via the management API
//! - Scoped sessions that always close the connection
//!
//! # Quick Start
//!
//! ```no_run
//! use amqp_guard::{handler_fn, shutdown_channel, AmqpTransport, ClientConfig, Lifecycle, Message};
//! use amqp_guard::error::HandlerError;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), amqp_guard::ClientError> {
//! let lifecycle = Lifecycle::new(ClientConfig::default(), Arc::new(AmqpTransport::new()));
//! let (_trigger, shutdown) = shutdown_channel();
//!
//! // Publish one persistent message to the `hello` queue
//! lifecycle
//!     .run(&shutdown, |session| async move {
//!         session.publisher().publish(json!({"id": 1, "content": "Hello"})).await?;
//!         Ok(())
//!     })
//!     .await?;
//!
//! // Consume until shutdown, with the queue monitor running alongside
//! let handler = handler_fn(|message: Message| async move {
//!     let body: serde_json::Value = message.json()?;
//!     println!("got {}", body["id"]);
//!     Ok::<(), HandlerError>(())
//! });
//! lifecycle
//!     .run(&shutdown, |session| async move {
//!         session.consume_and_monitor(&handler, true).await
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod retry;
pub mod shutdown;
pub mod testing;
pub mod transport;

pub use client::{
    handler_fn, ConnectionManager, ConnectionState, Consumer, Lifecycle, Message, MessageHandler,
    Payload, Publisher, QueueDeclarator, QueueHandle, QueueMonitor, QueueSnapshot, SessionContext,
};
pub use config::{ClientConfig, ConfigError};
pub use error::{ClientError, ClientResult};
pub use retry::RetryPolicy;
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
pub use transport::AmqpTransport;
