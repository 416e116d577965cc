//! Observability for the queue client
//!
//! Logging is the only observability surface: state transitions, retries,
//! publishes, receipts, ack/nack decisions and monitor ticks are all tracing
//! events.

pub mod logging;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat, LogSettings};

// Span macros for structured logging
pub use logging::{connection_span, consumer_span, lifecycle_span, monitor_span};
