//! Connection management with bounded reconnect
//!
//! [`ConnectionManager`] owns the broker connection and its primary channel.
//! Everything else in the client borrows a [`ChannelHandle`] from it and never
//! touches the connection directly.
//!
//! # Example
//!
//! ```
//! use amqp_guard::config::BrokerSection;
//! use amqp_guard::testing::MockBroker;
//! use amqp_guard::{ConnectionManager, RetryPolicy, ShutdownSignal};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let broker = MockBroker::new();
//! let manager = ConnectionManager::new(
//!     Arc::new(broker.clone()),
//!     BrokerSection::default(),
//!     RetryPolicy::connect(),
//! );
//!
//! let channel = manager.connect(&ShutdownSignal::never()).await?;
//! assert!(channel.is_open());
//!
//! manager.close().await;
//! assert_eq!(broker.open_connections(), 0);
//! # Ok::<(), amqp_guard::error::ConnectionError>(())
//! # });
//! ```

use crate::config::BrokerSection;
use crate::connection_span;
use crate::error::{sanitize_error_message, ConnectionError};
use crate::retry::{RetryError, RetryPolicy};
use crate::shutdown::ShutdownSignal;
use crate::transport::{
    Channel, Connection, DeliveryStream, QueueInfo, QueueOptions, Transport, TransportError,
};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn, Instrument, Span};

/// Connection lifecycle as seen by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; initial state and the state after `close`
    Disconnected,
    /// A connect attempt (or its retries) is in progress
    Connecting,
    /// Connection and primary channel are open
    Connected,
    /// Connect retries exhausted
    Failed(String),
}

/// Events that drive [`ConnectionState`]
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnectStarted,
    Established,
    RetriesExhausted(String),
    Closed,
}

impl ConnectionState {
    /// Pure transition function
    pub fn next(&self, event: &ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectStarted => ConnectionState::Connecting,
            ConnectionEvent::Established => ConnectionState::Connected,
            ConnectionEvent::RetriesExhausted(reason) => ConnectionState::Failed(reason.clone()),
            ConnectionEvent::Closed => ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// A channel plus its single-flight guard.
///
/// Cloning shares both, so every clone of a handle serializes against the
/// others: at most one operation is in flight on the underlying channel.
#[derive(Clone)]
pub struct ChannelHandle {
    id: u64,
    inner: Arc<dyn Channel>,
    flight: Arc<Mutex<()>>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("open", &self.inner.is_open())
            .finish()
    }
}

impl ChannelHandle {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            inner: channel,
            flight: Arc::new(Mutex::new(())),
        }
    }

    /// Process-local identifier, only meaningful in logs
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub async fn queue_declare(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<QueueInfo, TransportError> {
        let _flight = self.flight.lock().await;
        self.inner.queue_declare(queue, options).await
    }

    pub async fn publish(
        &self,
        routing_key: &str,
        body: Bytes,
        persistent: bool,
        content_type: Option<&str>,
    ) -> Result<(), TransportError> {
        let _flight = self.flight.lock().await;
        self.inner
            .basic_publish(routing_key, body, persistent, content_type)
            .await
    }

    pub async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), TransportError> {
        let _flight = self.flight.lock().await;
        self.inner.basic_qos(prefetch_count).await
    }

    pub async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let _flight = self.flight.lock().await;
        self.inner.basic_consume(queue, consumer_tag).await
    }

    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let _flight = self.flight.lock().await;
        self.inner.basic_cancel(consumer_tag).await
    }

    pub async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let _flight = self.flight.lock().await;
        self.inner.basic_ack(delivery_tag).await
    }

    pub async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let _flight = self.flight.lock().await;
        self.inner.basic_nack(delivery_tag, requeue).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.inner.is_open() {
            return Ok(());
        }
        let _flight = self.flight.lock().await;
        self.inner.close().await
    }
}

struct Session {
    connection: Arc<dyn Connection>,
    primary: ChannelHandle,
    secondary: Vec<ChannelHandle>,
}

impl Session {
    fn is_live(&self) -> bool {
        self.connection.is_open() && self.primary.is_open()
    }
}

/// Owns the broker connection and hands out channels
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    broker: BrokerSection,
    policy: RetryPolicy,
    state_tx: watch::Sender<ConnectionState>,
    /// Held only for single operations, never across a retry loop
    session: Mutex<Option<Session>>,
    /// Serializes connect attempts so concurrent callers share one reconnect
    connecting: Mutex<()>,
    span: Span,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, broker: BrokerSection, policy: RetryPolicy) -> Self {
        let span = connection_span!(broker = %broker.display_address());
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            broker,
            policy,
            state_tx,
            session: Mutex::new(None),
            connecting: Mutex::new(()),
            span,
        }
    }

    /// Log inside `span` instead of a fresh connection span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn broker(&self) -> &BrokerSection {
        &self.broker
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Observe every state transition
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn apply(&self, event: ConnectionEvent) {
        let current = self.state();
        let next = current.next(&event);
        if next != current {
            info!("Connection state: {:?} -> {:?}", current, next);
        }
        self.state_tx.send_replace(next);
    }

    /// Establish the connection and primary channel, retrying with backoff.
    ///
    /// Returns the live primary channel without reconnecting when the current
    /// session is still healthy.
    pub async fn connect(&self, shutdown: &ShutdownSignal) -> Result<ChannelHandle, ConnectionError> {
        self.connect_inner(shutdown)
            .instrument(self.span.clone())
            .await
    }

    /// The live primary channel, reconnecting first if it has gone away
    pub async fn ensure_channel(
        &self,
        shutdown: &ShutdownSignal,
    ) -> Result<ChannelHandle, ConnectionError> {
        self.connect(shutdown).await
    }

    async fn connect_inner(&self, shutdown: &ShutdownSignal) -> Result<ChannelHandle, ConnectionError> {
        let _connecting = self.connecting.lock().await;

        let stale = {
            let mut session = self.session.lock().await;
            if let Some(live) = session.as_ref().filter(|s| s.is_live()) {
                return Ok(live.primary.clone());
            }
            session.take()
        };
        if let Some(stale) = stale {
            warn!("Connection to {} lost, reconnecting", self.broker.display_address());
            close_session(stale).await;
        }

        self.apply(ConnectionEvent::ConnectStarted);
        info!("Connecting to {}", self.broker.display_address());

        let transport = &self.transport;
        let broker = &self.broker;
        let result = self
            .policy
            .retry("connection", shutdown, |_| true, move |attempt| async move {
                debug!("Connection attempt {}", attempt);
                let connection = transport.connect(broker).await?;
                match connection.create_channel().await {
                    Ok(channel) => Ok((connection, channel)),
                    Err(e) => {
                        let _ = connection.close().await;
                        Err(e)
                    }
                }
            })
            .await;

        match result {
            Ok((connection, channel)) => {
                let primary = ChannelHandle::new(channel);
                *self.session.lock().await = Some(Session {
                    connection: Arc::from(connection),
                    primary: primary.clone(),
                    secondary: Vec::new(),
                });
                self.apply(ConnectionEvent::Established);
                info!("Connected to {}", self.broker.display_address());
                Ok(primary)
            }
            Err(RetryError::Cancelled { attempts, .. }) => {
                self.apply(ConnectionEvent::Closed);
                info!("Connection attempts cancelled after {} attempts", attempts);
                Err(ConnectionError::Cancelled { attempts })
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                let reason = sanitize_error_message(&last.to_string());
                error!("Connection failed after {} attempts: {}", attempts, reason);
                self.apply(ConnectionEvent::RetriesExhausted(reason));
                Err(ConnectionError::RetriesExhausted { attempts, last })
            }
            Err(RetryError::Aborted(last)) => {
                let reason = sanitize_error_message(&last.to_string());
                error!("Connection failed: {}", reason);
                self.apply(ConnectionEvent::RetriesExhausted(reason));
                Err(ConnectionError::RetriesExhausted { attempts: 1, last })
            }
        }
    }

    /// Open an extra channel on the live connection, e.g. so the monitor or
    /// a publisher does not share the consumer's channel
    pub async fn open_channel(&self) -> Result<ChannelHandle, ConnectionError> {
        let mut session = self.session.lock().await;
        let live = match session.as_mut() {
            Some(live) if live.connection.is_open() => live,
            _ => {
                return Err(ConnectionError::NotConnected {
                    state: self.state(),
                })
            }
        };

        let channel = live
            .connection
            .create_channel()
            .await
            .map_err(ConnectionError::ChannelOpen)?;
        let handle = ChannelHandle::new(channel);
        live.secondary.retain(ChannelHandle::is_open);
        live.secondary.push(handle.clone());
        debug!(parent: &self.span, "Opened secondary channel {}", handle.id());
        Ok(handle)
    }

    /// Release channels then the connection. Idempotent, never fails.
    pub async fn close(&self) {
        async {
            let session = self.session.lock().await.take();
            if let Some(session) = session {
                close_session(session).await;
            }
            self.apply(ConnectionEvent::Closed);
            info!("Connection closed");
        }
        .instrument(self.span.clone())
        .await
    }
}

async fn close_session(session: Session) {
    for channel in session.secondary.iter().chain(std::iter::once(&session.primary)) {
        if let Err(e) = channel.close().await {
            debug!("Ignoring error while closing channel {}: {}", channel.id(), e);
        }
    }
    if session.connection.is_open() {
        if let Err(e) = session.connection.close().await {
            debug!("Ignoring error while closing connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBroker;
    use std::time::Duration;

    fn manager(broker: &MockBroker) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(broker.clone()),
            BrokerSection::default(),
            RetryPolicy::connect(),
        )
    }

    #[test]
    fn test_state_transitions() {
        let state = ConnectionState::Disconnected;
        let state = state.next(&ConnectionEvent::ConnectStarted);
        assert_eq!(state, ConnectionState::Connecting);
        let state = state.next(&ConnectionEvent::Established);
        assert!(state.is_connected());
        let state = state.next(&ConnectionEvent::Closed);
        assert_eq!(state, ConnectionState::Disconnected);

        let failed = ConnectionState::Connecting
            .next(&ConnectionEvent::RetriesExhausted("refused".to_string()));
        assert_eq!(failed, ConnectionState::Failed("refused".to_string()));
    }

    #[tokio::test]
    async fn test_connect_reuses_live_session() {
        // Arrange
        let broker = MockBroker::new();
        let manager = manager(&broker);

        // Act
        let first = manager.connect(&ShutdownSignal::never()).await.unwrap();
        let second = manager.connect(&ShutdownSignal::never()).await.unwrap();

        // Assert
        assert_eq!(first.id(), second.id());
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_then_succeeds() {
        let broker = MockBroker::new();
        broker.fail_next_connects(2);
        let manager = manager(&broker);
        let start = tokio::time::Instant::now();

        manager.connect(&ShutdownSignal::never()).await.unwrap();

        assert_eq!(broker.connect_attempts(), 3);
        // 1s after the first failure, 2s after the second
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_exhausts_and_marks_failed() {
        let broker = MockBroker::new();
        broker.set_down(true);
        let manager = manager(&broker);

        let err = manager.connect(&ShutdownSignal::never()).await.unwrap_err();

        assert!(matches!(
            err,
            ConnectionError::RetriesExhausted { attempts: 5, .. }
        ));
        assert_eq!(broker.connect_attempts(), 5);
        assert!(matches!(manager.state(), ConnectionState::Failed(_)));
    }

    #[tokio::test]
    async fn test_reconnects_after_sever() {
        let broker = MockBroker::new();
        let manager = manager(&broker);
        let first = manager.connect(&ShutdownSignal::never()).await.unwrap();

        broker.sever_connections();
        assert!(!first.is_open());

        let second = manager
            .ensure_channel(&ShutdownSignal::never())
            .await
            .unwrap();
        assert!(second.is_open());
        assert_ne!(first.id(), second.id());
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_open_channel_requires_connection() {
        let broker = MockBroker::new();
        let manager = manager(&broker);

        let err = manager.open_channel().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::NotConnected {
                state: ConnectionState::Disconnected
            }
        ));

        let primary = manager.connect(&ShutdownSignal::never()).await.unwrap();
        let secondary = manager.open_channel().await.unwrap();
        assert_ne!(primary.id(), secondary.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_channel_fails_fast_during_reconnect_backoff() {
        // Arrange: connected, then the broker goes away for good
        let broker = MockBroker::new();
        let manager = Arc::new(manager(&broker));
        manager.connect(&ShutdownSignal::never()).await.unwrap();
        broker.sever_connections();
        broker.set_down(true);

        let mut states = manager.subscribe_state();
        let reconnecting = manager.clone();
        let reconnect = tokio::spawn(async move {
            reconnecting.ensure_channel(&ShutdownSignal::never()).await
        });
        states
            .wait_for(|s| *s == ConnectionState::Connecting)
            .await
            .unwrap();

        // Act: the reconnect is now sleeping between attempts
        let opened =
            tokio::time::timeout(Duration::from_millis(100), manager.open_channel()).await;

        // Assert
        assert!(matches!(
            opened,
            Ok(Err(ConnectionError::NotConnected {
                state: ConnectionState::Connecting
            }))
        ));
        assert!(matches!(
            reconnect.await.unwrap(),
            Err(ConnectionError::RetriesExhausted { attempts: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = MockBroker::new();
        let manager = manager(&broker);
        let channel = manager.connect(&ShutdownSignal::never()).await.unwrap();
        let mut states = manager.subscribe_state();

        manager.close().await;
        manager.close().await;

        assert!(!channel.is_open());
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_before_connect_is_harmless() {
        let manager = manager(&MockBroker::new());
        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
