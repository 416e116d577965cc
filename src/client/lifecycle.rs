//! Scoped sessions: connect, declare, work, close
//!
//! [`Lifecycle::run`] acquires the connection and declares the queue, hands a
//! [`SessionContext`] to the caller's work, and closes the connection however
//! the work ends: success, error, panic, or the whole future being dropped.

use super::connection::{ChannelHandle, ConnectionManager};
use super::consumer::{ConsumeReport, Consumer, MessageHandler};
use super::declare::{QueueDeclarator, QueueHandle};
use super::monitor::{stats_source, MonitorReport, QueueMonitor};
use super::publisher::{Payload, Publisher};
use crate::config::ClientConfig;
use crate::error::{sanitize_error_message, ClientError, PublishError};
use crate::lifecycle_span;
use crate::shutdown::ShutdownSignal;
use crate::transport::Transport;
use futures::FutureExt;
use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, Instrument, Span};

/// Closes the connection if dropped while still armed, i.e. when the session
/// future is dropped before it could close on its own
struct CloseGuard {
    manager: Option<Arc<ConnectionManager>>,
}

impl CloseGuard {
    fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager: Some(manager),
        }
    }

    fn disarm(&mut self) {
        self.manager = None;
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let Some(manager) = self.manager.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Session dropped before completion, closing connection");
                handle.spawn(async move { manager.close().await });
            }
            Err(_) => error!("Session dropped outside a runtime; connection left to the broker"),
        }
    }
}

/// Owns the connection manager for one client and runs scoped sessions on it
pub struct Lifecycle {
    config: ClientConfig,
    manager: Arc<ConnectionManager>,
    span: Span,
}

impl Lifecycle {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let span = lifecycle_span!(queue = %config.queue.name);
        let manager = ConnectionManager::new(
            transport,
            config.broker.clone(),
            config.connect_policy(),
        );
        Self {
            config,
            manager: Arc::new(manager),
            span,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Connect, declare the configured queue, run `work`, then close.
    ///
    /// The connection is closed before this returns on every path. A panic
    /// inside `work` is re-raised after the close.
    pub async fn run<F, Fut, T>(&self, shutdown: &ShutdownSignal, work: F) -> Result<T, ClientError>
    where
        F: FnOnce(SessionContext) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut guard = CloseGuard::new(self.manager.clone());

        let outcome = AssertUnwindSafe(self.open_and_work(shutdown, work))
            .catch_unwind()
            .instrument(self.span.clone())
            .await;

        self.manager.close().instrument(self.span.clone()).await;
        guard.disarm();

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(parent: &self.span, "Session failed: {}", sanitize_error_message(&e.to_string()));
                Err(e)
            }
            Err(panic) => {
                error!(parent: &self.span, "Session panicked; connection closed");
                resume_unwind(panic)
            }
        }
    }

    async fn open_and_work<F, Fut, T>(&self, shutdown: &ShutdownSignal, work: F) -> Result<T, ClientError>
    where
        F: FnOnce(SessionContext) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let channel = self.manager.connect(shutdown).await?;
        let queue = QueueDeclarator::new(channel.clone())
            .declare_queue(&self.config.queue.name, self.config.queue.durable)
            .await?;

        work(SessionContext {
            config: self.config.clone(),
            manager: self.manager.clone(),
            channel,
            queue,
            shutdown: shutdown.clone(),
        })
        .await
    }
}

/// Everything a session's work needs, already connected and declared
#[derive(Clone)]
pub struct SessionContext {
    config: ClientConfig,
    manager: Arc<ConnectionManager>,
    channel: ChannelHandle,
    queue: QueueHandle,
    shutdown: ShutdownSignal,
}

impl SessionContext {
    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.channel.clone(), self.queue.clone())
    }

    pub fn consumer(&self) -> Consumer {
        Consumer::new(
            self.manager.clone(),
            self.queue.clone(),
            self.config.subscribe_policy(),
            self.config.queue.prefetch_count,
        )
    }

    pub fn monitor(&self) -> Result<QueueMonitor, ClientError> {
        let source = stats_source(&self.config, self.manager.clone())?;
        Ok(QueueMonitor::new(source, &self.queue, self.config.monitor.interval())
            .with_failure_ceiling(self.config.monitor.max_consecutive_failures))
    }

    /// Publish every payload concurrently. Returns how many were sent, or the
    /// first failure once all publishes have finished.
    pub async fn publish_all<I>(&self, payloads: I) -> Result<usize, PublishError>
    where
        I: IntoIterator,
        I::Item: Into<Payload>,
    {
        let results = self.publisher().publish_batch(payloads).await;
        let total = results.len();
        let mut sent = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(()) => sent += 1,
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(_) => {}
            }
        }

        match first_error {
            Some(e) => {
                error!("{} of {} publishes failed", total - sent, total);
                Err(e)
            }
            None => Ok(sent),
        }
    }

    /// Consume with `handler` while the monitor (if enabled) runs alongside.
    ///
    /// The monitor is stopped when the consumer stops. A monitor that hits its
    /// failure ceiling stops the consumer and its error is returned.
    pub async fn consume_and_monitor(
        &self,
        handler: &dyn MessageHandler,
        with_monitor: bool,
    ) -> Result<ConsumeReport, ClientError> {
        let monitor = if with_monitor {
            Some(self.monitor()?)
        } else {
            None
        };
        let consumer = self.consumer();
        let (consumer_stop, consumer_signal) = self.shutdown.child();
        let (monitor_stop, monitor_signal) = self.shutdown.child();

        let consume = async {
            let result = consumer.run(handler, &consumer_signal).await;
            monitor_stop.trigger();
            result
        };
        let watch = async {
            let Some(monitor) = monitor.as_ref() else {
                return Ok(MonitorReport::default());
            };
            let result = monitor.run(&monitor_signal).await;
            if result.is_err() {
                consumer_stop.trigger();
            }
            result
        };

        let (consumed, monitored) = tokio::join!(consume, watch);
        match (consumed, monitored) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e.into()),
            (Ok(report), Ok(monitor_report)) => {
                info!(
                    "Session finished: received={}, acked={}, nacked={}, monitor ticks={}",
                    report.received, report.acked, report.nacked, monitor_report.ticks
                );
                Ok(report)
            }
        }
    }

    /// Run only the monitor until shutdown
    pub async fn monitor_until_shutdown(&self) -> Result<MonitorReport, ClientError> {
        Ok(self.monitor()?.run(&self.shutdown).await?)
    }
}
