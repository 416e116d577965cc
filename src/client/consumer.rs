//! Sequential message consumption with explicit acknowledgement
//!
//! The consumer runs one handler call at a time, in delivery order. A handler
//! success acks the delivery; a handler failure nacks it without requeue so a
//! poison message is dropped instead of looping forever. Losing the
//! subscription (connection reset, broker restart) triggers a bounded
//! resubscribe: reconnect, redeclare, subscribe again.

use super::connection::{ChannelHandle, ConnectionManager};
use super::declare::{QueueDeclarator, QueueHandle};
use crate::consumer_span;
use crate::error::{
    sanitize_error_message, ClientError, ConnectionError, ConsumeError, DeclarationError,
    HandlerError, SubscriptionError,
};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::shutdown::ShutdownSignal;
use crate::transport::{Delivery, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument, Span};
use uuid::Uuid;

/// A delivered message as seen by a handler
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub queue: String,
    pub delivery_tag: u64,
    pub body: Bytes,
    /// The broker delivered this message before without an ack
    pub redelivered: bool,
}

impl Message {
    fn from_delivery(queue: &str, delivery: Delivery) -> Self {
        Self {
            queue: queue.to_string(),
            delivery_tag: delivery.delivery_tag,
            body: delivery.body,
            redelivered: delivery.redelivered,
        }
    }

    pub fn body_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Acknowledgement state of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Pending,
    Acked,
    Nacked,
}

/// User callback invoked for every delivery
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// An `Err` nacks the message without requeue
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct HandlerFn<F>(F);

/// Build a handler from `Fn(Message) -> impl Future<Output = Result<(), HandlerError>>`
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (self.0)(message.clone()).await
    }
}

/// Where the consumer is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Subscribing,
    Active,
    Dispatching { delivery_tag: u64 },
    Closed,
    Failed(String),
}

/// Counters returned when consumption stops cleanly
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    pub received: u64,
    pub acked: u64,
    pub nacked: u64,
    /// Resubscribe attempts after the subscription was lost
    pub resubscriptions: u32,
}

enum AttemptError {
    /// Worth another subscription attempt
    Transient {
        error: TransportError,
        /// At least one delivery was acked or nacked on this subscription
        settled: bool,
    },
    Fatal(ClientError),
}

pub struct Consumer {
    manager: Arc<ConnectionManager>,
    queue: QueueHandle,
    policy: RetryPolicy,
    prefetch_count: u16,
    consumer_tag: String,
    state_tx: watch::Sender<ConsumerState>,
    span: Span,
}

impl Consumer {
    pub fn new(
        manager: Arc<ConnectionManager>,
        queue: QueueHandle,
        policy: RetryPolicy,
        prefetch_count: u16,
    ) -> Self {
        let consumer_tag = format!("amqp-guard-{}", Uuid::new_v4());
        let span = consumer_span!(queue = %queue.name, tag = %consumer_tag);
        let (state_tx, _) = watch::channel(ConsumerState::Idle);
        Self {
            manager,
            queue,
            policy,
            prefetch_count,
            consumer_tag,
            state_tx,
            span,
        }
    }

    /// Log inside `span` instead of a fresh consumer span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn state(&self) -> ConsumerState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, next: ConsumerState) {
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            debug!("Consumer state: {:?} -> {:?}", previous, next);
        }
    }

    /// Consume until `shutdown` fires or the subscription fails for good.
    ///
    /// A handler that is running when shutdown fires is allowed to finish and
    /// its delivery is settled before this returns.
    pub async fn run(
        &self,
        handler: &dyn MessageHandler,
        shutdown: &ShutdownSignal,
    ) -> Result<ConsumeReport, ClientError> {
        self.run_inner(handler, shutdown)
            .instrument(self.span.clone())
            .await
    }

    async fn run_inner(
        &self,
        handler: &dyn MessageHandler,
        shutdown: &ShutdownSignal,
    ) -> Result<ConsumeReport, ClientError> {
        let mut report = ConsumeReport::default();
        let mut failures = 0u32;

        loop {
            let (error, settled) = match self.consume_once(handler, shutdown, &mut report).await {
                Ok(()) => {
                    self.set_state(ConsumerState::Closed);
                    info!(
                        "Consumer stopped: received={}, acked={}, nacked={}",
                        report.received, report.acked, report.nacked
                    );
                    return Ok(report);
                }
                Err(AttemptError::Fatal(e)) => {
                    error!("Consumer failed: {}", sanitize_error_message(&e.to_string()));
                    self.set_state(ConsumerState::Failed(e.to_string()));
                    return Err(e);
                }
                Err(AttemptError::Transient { error, settled }) => (error, settled),
            };

            // A subscription that settled a delivery was healthy; start a fresh budget
            if settled {
                failures = 0;
            }
            failures += 1;
            warn!(
                "Subscription to '{}' lost: {}",
                self.queue.name,
                sanitize_error_message(&error.to_string())
            );

            match self.policy.decide(failures, shutdown.is_cancelled()) {
                RetryDecision::Proceed { attempt, delay } => {
                    info!(
                        "Retrying subscription, attempt {}/{} in {:?}",
                        attempt, self.policy.max_attempts, delay
                    );
                    if !shutdown.sleep(delay).await {
                        self.set_state(ConsumerState::Closed);
                        return Ok(report);
                    }
                    report.resubscriptions += 1;
                }
                RetryDecision::AbortShutdownRequested => {
                    self.set_state(ConsumerState::Closed);
                    return Ok(report);
                }
                RetryDecision::AbortMaxAttemptsExceeded => {
                    let err = SubscriptionError::RetriesExhausted {
                        queue: self.queue.name.clone(),
                        attempts: failures,
                        last: error,
                    };
                    error!("{}", err);
                    self.set_state(ConsumerState::Failed(err.to_string()));
                    return Err(err.into());
                }
            }
        }
    }

    /// One subscribe-and-iterate pass. `Ok` means shutdown was requested.
    async fn consume_once(
        &self,
        handler: &dyn MessageHandler,
        shutdown: &ShutdownSignal,
        report: &mut ConsumeReport,
    ) -> Result<(), AttemptError> {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        self.set_state(ConsumerState::Subscribing);

        let channel = match self.manager.ensure_channel(shutdown).await {
            Ok(channel) => channel,
            Err(ConnectionError::Cancelled { .. }) => return Ok(()),
            Err(e) => return Err(AttemptError::Fatal(e.into())),
        };

        QueueDeclarator::new(channel.clone())
            .declare_queue(&self.queue.name, self.queue.durable)
            .await
            .map_err(classify_declare_error)?;

        channel
            .set_prefetch(self.prefetch_count)
            .await
            .map_err(|e| self.classify_subscribe_error(e))?;

        let mut stream = channel
            .subscribe(&self.queue.name, &self.consumer_tag)
            .await
            .map_err(|e| self.classify_subscribe_error(e))?;

        self.set_state(ConsumerState::Active);
        info!("Consuming from '{}'", self.queue.name);

        let mut settled = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                item = stream.next() => Some(item),
            };

            let delivery = match next {
                None => {
                    if let Err(e) = channel.cancel(&self.consumer_tag).await {
                        debug!("Ignoring error while cancelling subscription: {}", e);
                    }
                    return Ok(());
                }
                Some(None) => {
                    return Err(AttemptError::Transient {
                        error: TransportError::ConnectionLost(
                            "delivery stream ended".to_string(),
                        ),
                        settled,
                    })
                }
                Some(Some(Err(error))) => {
                    return Err(AttemptError::Transient { error, settled });
                }
                Some(Some(Ok(delivery))) => delivery,
            };

            self.dispatch(&channel, handler, delivery, report)
                .await
                .map_err(|error| AttemptError::Transient { error, settled })?;
            settled = true;
        }
    }

    /// Run the handler for one delivery and settle it
    async fn dispatch(
        &self,
        channel: &ChannelHandle,
        handler: &dyn MessageHandler,
        delivery: Delivery,
        report: &mut ConsumeReport,
    ) -> Result<AckState, TransportError> {
        let message = Message::from_delivery(&self.queue.name, delivery);
        report.received += 1;
        info!("Received: {}", String::from_utf8_lossy(&message.body));
        if message.redelivered {
            debug!("Delivery {} is a redelivery", message.delivery_tag);
        }

        self.set_state(ConsumerState::Dispatching {
            delivery_tag: message.delivery_tag,
        });

        let state = match handler.handle(&message).await {
            Ok(()) => {
                channel.ack(message.delivery_tag).await?;
                report.acked += 1;
                debug!("Acked delivery {}", message.delivery_tag);
                AckState::Acked
            }
            Err(source) => {
                let failure = ConsumeError {
                    delivery_tag: message.delivery_tag,
                    source,
                };
                error!(
                    "{}: {}; discarding message",
                    failure,
                    sanitize_error_message(&failure.source.to_string())
                );
                channel.nack(message.delivery_tag, false).await?;
                report.nacked += 1;
                AckState::Nacked
            }
        };

        self.set_state(ConsumerState::Active);
        Ok(state)
    }

    fn classify_subscribe_error(&self, error: TransportError) -> AttemptError {
        if error.is_transient() {
            AttemptError::Transient {
                error,
                settled: false,
            }
        } else {
            AttemptError::Fatal(
                SubscriptionError::Refused {
                    queue: self.queue.name.clone(),
                    source: error,
                }
                .into(),
            )
        }
    }
}

fn classify_declare_error(error: DeclarationError) -> AttemptError {
    match error {
        DeclarationError::ChannelClosed { .. } => AttemptError::Transient {
            error: TransportError::ChannelClosed,
            settled: false,
        },
        DeclarationError::Transport { source, .. } if source.is_transient() => {
            AttemptError::Transient {
                error: source,
                settled: false,
            }
        }
        other => AttemptError::Fatal(other.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerSection;
    use crate::shutdown::shutdown_channel;
    use crate::testing::MockBroker;
    use std::sync::Mutex;
    use std::time::Duration;

    fn hello_queue() -> QueueHandle {
        QueueHandle {
            name: "hello".to_string(),
            durable: true,
            message_count: 0,
            consumer_count: 0,
        }
    }

    fn consumer(broker: &MockBroker) -> Consumer {
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            BrokerSection::default(),
            RetryPolicy::connect(),
        ));
        Consumer::new(manager, hello_queue(), RetryPolicy::subscribe(), 10)
    }

    /// Records bodies and stops the session once `expected` arrived
    struct Collector {
        seen: Mutex<Vec<Bytes>>,
        expected: usize,
        trigger: crate::shutdown::ShutdownTrigger,
    }

    #[async_trait]
    impl MessageHandler for Collector {
        async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(message.body.clone());
            if seen.len() >= self.expected {
                self.trigger.trigger();
            }
            Ok(())
        }
    }

    #[test]
    fn test_message_helpers() {
        let message = Message {
            queue: "hello".to_string(),
            delivery_tag: 1,
            body: Bytes::from(r#"{"id":1,"content":"Hello"}"#),
            redelivered: false,
        };
        assert!(message.body_str().unwrap().contains("Hello"));
        let value: serde_json::Value = message.json().unwrap();
        assert_eq!(value["id"], 1);
    }

    #[tokio::test]
    async fn test_acks_in_delivery_order() {
        // Arrange
        let broker = MockBroker::new();
        for i in 0..5 {
            broker.enqueue("hello", format!("m{i}"));
        }
        let (trigger, shutdown) = shutdown_channel();
        let collector = Collector {
            seen: Mutex::new(Vec::new()),
            expected: 5,
            trigger,
        };

        // Act
        let report = consumer(&broker).run(&collector, &shutdown).await.unwrap();

        // Assert
        let seen = collector.seen.lock().unwrap().clone();
        let expected: Vec<Bytes> = (0..5).map(|i| Bytes::from(format!("m{i}"))).collect();
        assert_eq!(seen, expected);
        assert_eq!(report.received, 5);
        assert_eq!(report.acked, 5);
        assert_eq!(broker.acked(), expected);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_failure_nacks_without_requeue() {
        let broker = MockBroker::new();
        broker.enqueue("hello", "poison");
        broker.enqueue("hello", "fine");
        let (trigger, shutdown) = shutdown_channel();

        let handler = handler_fn(move |message: Message| {
            let trigger = trigger.clone();
            async move {
                if message.body == Bytes::from("poison") {
                    return Err::<(), HandlerError>("cannot parse".into());
                }
                trigger.trigger();
                Ok(())
            }
        });

        let report = consumer(&broker).run(&handler, &shutdown).await.unwrap();

        assert_eq!(report.nacked, 1);
        assert_eq!(report.acked, 1);
        assert_eq!(broker.nacked(), vec![(Bytes::from("poison"), false)]);
        assert_eq!(broker.acked(), vec![Bytes::from("fine")]);
        assert_eq!(broker.queue_depth("hello"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_connection_loss() {
        let broker = MockBroker::new();
        broker.enqueue("hello", "before");
        let (trigger, shutdown) = shutdown_channel();
        let collector = Arc::new(Collector {
            seen: Mutex::new(Vec::new()),
            expected: 2,
            trigger,
        });

        let consumer = consumer(&broker);
        let run_collector = collector.clone();
        let task = tokio::spawn(async move {
            consumer.run(run_collector.as_ref(), &shutdown).await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        broker.sever_connections();
        broker.enqueue("hello", "after");

        let report = tokio::time::timeout(Duration::from_secs(30), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(report.resubscriptions, 1);
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(
            collector.seen.lock().unwrap().clone(),
            vec![Bytes::from("before"), Bytes::from("after")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_retries_exhausted() {
        let broker = MockBroker::new();
        broker.declare_queue("hello", true);
        broker.fail_next_subscribes(3);
        let handler = handler_fn(|_message: Message| async { Ok::<(), HandlerError>(()) });

        let err = consumer(&broker)
            .run(&handler, &ShutdownSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ClientError::Subscription(SubscriptionError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsettled_redeliveries_do_not_reset_retry_budget() {
        // Arrange: the connection drops while every delivery is being handled
        let broker = MockBroker::new();
        broker.enqueue("hello", "flaky");
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let handler = {
            let broker = broker.clone();
            let calls = calls.clone();
            handler_fn(move |_message: Message| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                broker.sever_connections();
                async { Ok::<(), HandlerError>(()) }
            })
        };

        // Act
        let result = tokio::time::timeout(
            Duration::from_secs(60),
            consumer(&broker).run(&handler, &ShutdownSignal::never()),
        )
        .await
        .expect("consumer should give up instead of looping");

        // Assert
        assert!(matches!(
            result,
            Err(ClientError::Subscription(SubscriptionError::RetriesExhausted { attempts: 3, .. }))
        ));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(broker.connect_attempts(), 3);
        // Never acked, so the message is still on the queue
        assert_eq!(broker.queue_depth("hello"), 1);
    }

    #[tokio::test]
    async fn test_declaration_conflict_is_fatal() {
        let broker = MockBroker::new();
        broker.declare_queue("hello", false);
        let handler = handler_fn(|_message: Message| async { Ok::<(), HandlerError>(()) });

        let err = consumer(&broker)
            .run(&handler, &ShutdownSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ClientError::Declaration(DeclarationError::Conflict { .. })
        ));
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_consumer() {
        let broker = MockBroker::new();
        let (trigger, shutdown) = shutdown_channel();
        let consumer = consumer(&broker);
        let mut states = consumer.subscribe_state();
        let handler = handler_fn(|_message: Message| async { Ok::<(), HandlerError>(()) });

        let run = consumer.run(&handler, &shutdown);
        let stop = async {
            states
                .wait_for(|s| *s == ConsumerState::Active)
                .await
                .unwrap();
            assert_eq!(broker.consumer_count("hello"), 1);
            trigger.trigger();
        };
        let (report, ()) = tokio::join!(run, stop);

        assert_eq!(report.unwrap(), ConsumeReport::default());
        assert_eq!(consumer.state(), ConsumerState::Closed);
        assert_eq!(broker.consumer_count("hello"), 0);
    }
}
