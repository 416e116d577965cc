//! In-memory broker for testing
//!
//! [`MockBroker`] implements the transport traits with enough AMQP behaviour
//! for the client logic to be exercised end to end: durable-flag conflicts,
//! round-robin delivery, unacked tracking and redelivery when a channel or
//! connection goes away, plus knobs for injecting outages.

use crate::config::BrokerSection;
use crate::transport::{
    Channel, Connection, Delivery, DeliveryStream, QueueInfo, QueueOptions, Transport,
    TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A message as it was handed to the broker
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub queue: String,
    pub body: Bytes,
    pub persistent: bool,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
struct Ready {
    body: Bytes,
    redelivered: bool,
}

struct Subscriber {
    channel_id: u64,
    consumer_tag: String,
    tx: mpsc::UnboundedSender<Result<Delivery, TransportError>>,
}

#[derive(Default)]
struct MockQueue {
    durable: bool,
    ready: VecDeque<Ready>,
    subscribers: Vec<Subscriber>,
    next_subscriber: usize,
}

struct Unacked {
    queue: String,
    channel_id: u64,
    body: Bytes,
}

#[derive(Default)]
struct BrokerState {
    down: bool,
    fail_next_connects: u32,
    fail_next_subscribes: u32,
    fail_next_publishes: u32,
    nack_next_publishes: u32,
    connect_attempts: u32,
    next_id: u64,
    connections: HashSet<u64>,
    /// channel id -> owning connection id
    channels: HashMap<u64, u64>,
    queues: HashMap<String, MockQueue>,
    next_delivery_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    published: Vec<PublishedMessage>,
    acked: Vec<Bytes>,
    nacked: Vec<(Bytes, bool)>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel_id: u64) -> bool {
        self.channels.contains_key(&channel_id)
    }

    /// Push ready messages to subscribers, round robin
    fn dispatch(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.subscribers.is_empty() {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let index = queue.next_subscriber % queue.subscribers.len();
            queue.next_subscriber = queue.next_subscriber.wrapping_add(1);

            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            let subscriber = &queue.subscribers[index];
            let delivery = Delivery {
                delivery_tag,
                body: message.body.clone(),
                redelivered: message.redelivered,
            };

            if subscriber.tx.unbounded_send(Ok(delivery)).is_ok() {
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        channel_id: subscriber.channel_id,
                        body: message.body,
                    },
                );
            } else {
                queue.subscribers.remove(index);
                queue.ready.push_front(message);
            }
        }
    }

    /// Return every unacked message held by `channels` to the head of its
    /// queue, flagged as redelivered
    fn requeue_unacked(&mut self, channels: &HashSet<u64>) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| channels.contains(&u.channel_id))
            .map(|(tag, _)| *tag)
            .collect();

        let mut touched = HashSet::new();
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.ready.push_front(Ready {
                        body: unacked.body,
                        redelivered: true,
                    });
                }
                touched.insert(unacked.queue);
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    /// Close channels, ending their subscriptions with `reason` (if any)
    fn close_channels(&mut self, channels: HashSet<u64>, reason: Option<TransportError>) {
        for queue in self.queues.values_mut() {
            queue.subscribers.retain(|subscriber| {
                if !channels.contains(&subscriber.channel_id) {
                    return true;
                }
                if let Some(reason) = &reason {
                    let _ = subscriber.tx.unbounded_send(Err(reason.clone()));
                }
                false
            });
        }
        for channel in &channels {
            self.channels.remove(channel);
        }
        self.requeue_unacked(&channels);
    }

    fn close_connection(&mut self, connection_id: u64, reason: Option<TransportError>) {
        self.connections.remove(&connection_id);
        let channels: HashSet<u64> = self
            .channels
            .iter()
            .filter(|(_, owner)| **owner == connection_id)
            .map(|(channel, _)| *channel)
            .collect();
        self.close_channels(channels, reason);
    }
}

/// In-memory AMQP broker. Cheap to clone; clones share the same broker.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse every connection while `down` is true
    pub fn set_down(&self, down: bool) {
        self.state().down = down;
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state().fail_next_connects = count;
    }

    pub fn fail_next_subscribes(&self, count: u32) {
        self.state().fail_next_subscribes = count;
    }

    pub fn fail_next_publishes(&self, count: u32) {
        self.state().fail_next_publishes = count;
    }

    /// Negatively confirm the next `count` publishes
    pub fn nack_next_publishes(&self, count: u32) {
        self.state().nack_next_publishes = count;
    }

    /// Drop every connection as if the network went away. Subscriptions see
    /// `ConnectionLost`; unacked messages go back to their queues.
    pub fn sever_connections(&self) {
        let mut state = self.state();
        let connections: Vec<u64> = state.connections.iter().copied().collect();
        for connection in connections {
            state.close_connection(
                connection,
                Some(TransportError::ConnectionLost(
                    "connection reset by peer".to_string(),
                )),
            );
        }
    }

    /// Create a queue out of band
    pub fn declare_queue(&self, name: &str, durable: bool) {
        self.state().queues.entry(name.to_string()).or_insert_with(|| MockQueue {
            durable,
            ..Default::default()
        });
    }

    /// Put a message straight onto a queue, creating it (durable) if needed
    pub fn enqueue(&self, queue: &str, body: impl Into<Bytes>) {
        let mut state = self.state();
        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| MockQueue {
                durable: true,
                ..Default::default()
            })
            .ready
            .push_back(Ready {
                body: body.into(),
                redelivered: false,
            });
        state.dispatch(queue);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    /// Messages waiting for delivery
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map_or(0, |q| q.subscribers.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    /// Bodies acknowledged by consumers, in ack order
    pub fn acked(&self) -> Vec<Bytes> {
        self.state().acked.clone()
    }

    /// Bodies negatively acknowledged, with their requeue flag
    pub fn nacked(&self) -> Vec<(Bytes, bool)> {
        self.state().nacked.clone()
    }
}

#[async_trait]
impl Transport for MockBroker {
    async fn connect(&self, _broker: &BrokerSection) -> Result<Box<dyn Connection>, TransportError> {
        let mut state = self.state();
        state.connect_attempts += 1;

        if state.down {
            return Err(TransportError::ConnectionFailed(
                "Connection refused (os error 111)".to_string(),
            ));
        }
        if state.fail_next_connects > 0 {
            state.fail_next_connects -= 1;
            return Err(TransportError::ConnectionFailed(
                "Connection refused (os error 111)".to_string(),
            ));
        }

        let id = state.next_id();
        state.connections.insert(id);
        Ok(Box::new(MockConnection {
            id,
            broker: self.clone(),
        }))
    }
}

struct MockConnection {
    id: u64,
    broker: MockBroker,
}

#[async_trait]
impl Connection for MockConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let mut state = self.broker.state();
        if !state.connections.contains(&self.id) {
            return Err(TransportError::ConnectionLost(
                "connection is closed".to_string(),
            ));
        }
        let id = state.next_id();
        state.channels.insert(id, self.id);
        Ok(Arc::new(MockChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        if !state.connections.contains(&self.id) {
            return Err(TransportError::ConnectionLost(
                "connection already closed".to_string(),
            ));
        }
        state.close_connection(self.id, None);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.state().connections.contains(&self.id)
    }
}

struct MockChannel {
    id: u64,
    broker: MockBroker,
}

impl MockChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        let state = self.broker.state();
        if state.channel_open(self.id) {
            Ok(state)
        } else {
            Err(TransportError::ChannelClosed)
        }
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<QueueInfo, TransportError> {
        let mut state = self.open_state()?;

        let error = match state.queues.get(queue) {
            None if options.passive => Some(TransportError::NotFound(format!(
                "NOT_FOUND - no queue '{queue}' in vhost '/'"
            ))),
            Some(existing) if !options.passive && existing.durable != options.durable => {
                Some(TransportError::PreconditionFailed(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{queue}' in vhost '/': received '{}' but current is '{}'",
                    options.durable, existing.durable
                )))
            }
            _ => None,
        };
        if let Some(error) = error {
            // Soft errors close the channel, as on a real broker
            state.close_channels(HashSet::from([self.id]), None);
            return Err(error);
        }

        let declared = state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| MockQueue {
                durable: options.durable,
                ..Default::default()
            });
        Ok(QueueInfo {
            name: queue.to_string(),
            message_count: declared.ready.len() as u32,
            consumer_count: declared.subscribers.len() as u32,
        })
    }

    async fn basic_publish(
        &self,
        routing_key: &str,
        body: Bytes,
        persistent: bool,
        content_type: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut state = self.open_state()?;

        if state.fail_next_publishes > 0 {
            state.fail_next_publishes -= 1;
            return Err(TransportError::ConnectionLost(
                "connection reset during publish".to_string(),
            ));
        }
        if state.nack_next_publishes > 0 {
            state.nack_next_publishes -= 1;
            return Err(TransportError::Rejected(format!(
                "broker nacked message for '{routing_key}'"
            )));
        }

        state.published.push(PublishedMessage {
            queue: routing_key.to_string(),
            body: body.clone(),
            persistent,
            content_type: content_type.map(str::to_string),
        });

        // The default exchange silently drops unroutable messages
        if let Some(queue) = state.queues.get_mut(routing_key) {
            queue.ready.push_back(Ready {
                body,
                redelivered: false,
            });
            state.dispatch(routing_key);
        }
        Ok(())
    }

    async fn basic_qos(&self, _prefetch_count: u16) -> Result<(), TransportError> {
        self.open_state().map(|_| ())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let mut state = self.open_state()?;

        if state.fail_next_subscribes > 0 {
            state.fail_next_subscribes -= 1;
            return Err(TransportError::ConnectionLost(
                "connection reset during subscribe".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded();
        let subscriber = Subscriber {
            channel_id: self.id,
            consumer_tag: consumer_tag.to_string(),
            tx,
        };
        match state.queues.get_mut(queue) {
            Some(q) => q.subscribers.push(subscriber),
            None => {
                return Err(TransportError::NotFound(format!(
                    "NOT_FOUND - no queue '{queue}' in vhost '/'"
                )))
            }
        }
        state.dispatch(queue);
        Ok(rx.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        for queue in state.queues.values_mut() {
            queue
                .subscribers
                .retain(|s| !(s.channel_id == self.id && s.consumer_tag == consumer_tag));
        }
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        match state.unacked.get(&delivery_tag) {
            Some(unacked) if unacked.channel_id == self.id => {}
            _ => {
                return Err(TransportError::PreconditionFailed(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                )))
            }
        }
        if let Some(unacked) = state.unacked.remove(&delivery_tag) {
            state.acked.push(unacked.body);
        }
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        let unacked = match state.unacked.remove(&delivery_tag) {
            Some(unacked) if unacked.channel_id == self.id => unacked,
            Some(other) => {
                state.unacked.insert(delivery_tag, other);
                return Err(TransportError::PreconditionFailed(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                )));
            }
            None => {
                return Err(TransportError::PreconditionFailed(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                )))
            }
        };

        state.nacked.push((unacked.body.clone(), requeue));
        if requeue {
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(Ready {
                    body: unacked.body,
                    redelivered: true,
                });
            }
            state.dispatch(&unacked.queue);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        state.close_channels(HashSet::from([self.id]), None);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.state().channel_open(self.id)
    }
}
