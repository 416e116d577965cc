//! AMQP 0-9-1 transport backed by `lapin`

use super::{
    Channel, Connection, Delivery, DeliveryStream, QueueInfo, QueueOptions, Transport,
    TransportError,
};
use crate::config::{BrokerSection, Credentials};
use bytes::Bytes;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::FieldTable,
    BasicProperties, ConnectionProperties,
};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// AMQP reply code for a normal shutdown
const REPLY_SUCCESS: u16 = 200;

/// Delivery mode that asks the broker to write the message to disk
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Build the `amqp://` URI for `broker`, with the vhost percent-encoded and
/// the heartbeat passed as a query parameter
pub fn amqp_uri(broker: &BrokerSection, credentials: &Credentials) -> Result<String, TransportError> {
    let mut url = Url::parse(&format!("amqp://{}:{}", broker.host, broker.port))
        .map_err(|e| TransportError::ConnectionFailed(format!("invalid broker address: {e}")))?;

    url.set_username(&credentials.username)
        .and_then(|_| url.set_password(Some(&credentials.password)))
        .map_err(|_| TransportError::ConnectionFailed("broker address cannot carry credentials".to_string()))?;

    // The vhost is a single path segment, so "/" itself must be encoded
    let vhost: String = url::form_urlencoded::byte_serialize(broker.vhost.as_bytes()).collect();
    url.set_path(&format!("/{vhost}"));
    url.set_query(Some(&format!("heartbeat={}", broker.heartbeat_secs)));

    Ok(url.to_string())
}

/// Map a lapin error onto the transport taxonomy
fn classify(error: lapin::Error) -> TransportError {
    let message = error.to_string();
    match error {
        lapin::Error::IOError(_) => TransportError::ConnectionLost(message),
        lapin::Error::InvalidConnectionState(_) => TransportError::ConnectionLost(message),
        lapin::Error::InvalidChannelState(_) => TransportError::ChannelClosed,
        lapin::Error::ProtocolError(ref amqp) => classify_protocol(amqp.kind(), message),
        _ => TransportError::Protocol(message),
    }
}

/// Reply codes decide the variant; the message is only carried along
fn classify_protocol(kind: &AMQPErrorKind, message: String) -> TransportError {
    match kind {
        AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
            TransportError::PreconditionFailed(message)
        }
        AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => TransportError::NotFound(message),
        AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED) => {
            TransportError::ConnectionFailed(message)
        }
        _ => TransportError::Protocol(message),
    }
}

/// Production transport: one TCP connection per [`Transport::connect`] call
#[derive(Debug, Default, Clone)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Transport for LapinTransport {
    async fn connect(&self, broker: &BrokerSection) -> Result<Box<dyn Connection>, TransportError> {
        let uri = amqp_uri(broker, &broker.credentials())?;
        let connection = lapin::Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| match classify(e) {
                // Nothing was established yet, so a lost socket is a failed connect
                TransportError::ConnectionLost(message) => TransportError::ConnectionFailed(message),
                other => other,
            })?;

        debug!("AMQP connection established to {}", broker.display_address());
        Ok(Box::new(LapinConnection {
            inner: connection,
            confirms: broker.publisher_confirms,
        }))
    }
}

struct LapinConnection {
    inner: lapin::Connection,
    confirms: bool,
}

#[async_trait::async_trait]
impl Connection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let channel = self.inner.create_channel().await.map_err(classify)?;
        if self.confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(classify)?;
        }
        Ok(Arc::new(LapinChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner
            .close(REPLY_SUCCESS, "client shutdown")
            .await
            .map_err(classify)
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

struct LapinChannel {
    inner: lapin::Channel,
}

#[async_trait::async_trait]
impl Channel for LapinChannel {
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<QueueInfo, TransportError> {
        let declared = self
            .inner
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(classify)?;

        Ok(QueueInfo {
            name: declared.name().as_str().to_string(),
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn basic_publish(
        &self,
        routing_key: &str,
        body: Bytes,
        persistent: bool,
        content_type: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut properties = BasicProperties::default();
        if persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }
        if let Some(content_type) = content_type {
            properties = properties.with_content_type(content_type.into());
        }

        let confirmation = self
            .inner
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(classify)?
            .await
            .map_err(classify)?;

        if confirmation.is_nack() {
            return Err(TransportError::Rejected(format!(
                "broker nacked message for '{routing_key}'"
            )));
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(classify)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(classify)?;

        let stream = consumer.map(|item| {
            item.map(|delivery| Delivery {
                delivery_tag: delivery.delivery_tag,
                body: Bytes::from(delivery.data),
                redelivered: delivery.redelivered,
            })
            .map_err(classify)
        });
        Ok(stream.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(classify)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(classify)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(classify)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner
            .close(REPLY_SUCCESS, "client shutdown")
            .await
            .map_err(classify)
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}
