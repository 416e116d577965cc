//! Test support
//!
//! An in-memory broker implementing the transport traits, so connection,
//! consumer and lifecycle behaviour can be exercised without RabbitMQ.

pub mod mocks;

pub use mocks::{MockBroker, PublishedMessage};
