//! The queue client
//!
//! Components are layered leaves-first: [`connection`] owns the broker
//! session, [`declare`] ensures the queue exists, [`publisher`] and
//! [`consumer`] move messages, [`monitor`] reports queue health, and
//! [`lifecycle`] sequences them with guaranteed cleanup.

pub mod connection;
pub mod consumer;
pub mod declare;
pub mod lifecycle;
pub mod monitor;
pub mod publisher;

pub use connection::{ChannelHandle, ConnectionManager, ConnectionState};
pub use consumer::{
    handler_fn, AckState, ConsumeReport, Consumer, ConsumerState, HandlerFn, Message,
    MessageHandler,
};
pub use declare::{QueueDeclarator, QueueHandle};
pub use lifecycle::{Lifecycle, SessionContext};
pub use monitor::{
    stats_source, ChannelStats, ManagementApi, MonitorReport, QueueMonitor, QueueSnapshot,
    QueueStatsSource,
};
pub use publisher::{Payload, Publisher};
