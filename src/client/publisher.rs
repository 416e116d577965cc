//! Persistent message publishing

use super::connection::ChannelHandle;
use super::declare::QueueHandle;
use crate::error::{sanitize_error_message, PublishError};
use crate::transport::TransportError;
use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info};

const JSON_CONTENT_TYPE: &str = "application/json";

/// Message body before encoding
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Pre-encoded bytes, sent unchanged
    Bytes(Bytes),
    /// Structured value, sent as UTF-8 JSON
    Json(serde_json::Value),
    /// UTF-8 JSON already encoded from a typed value, fields in declaration order
    EncodedJson(Bytes),
}

impl Payload {
    /// Encode any serializable value as JSON
    pub fn json<T: Serialize>(value: &T) -> Result<Self, PublishError> {
        serde_json::to_vec(value)
            .map(|body| Payload::EncodedJson(Bytes::from(body)))
            .map_err(PublishError::Serialization)
    }

    fn encode(&self) -> Result<(Bytes, Option<&'static str>), PublishError> {
        match self {
            Payload::Bytes(bytes) => Ok((bytes.clone(), None)),
            Payload::EncodedJson(body) => Ok((body.clone(), Some(JSON_CONTENT_TYPE))),
            Payload::Json(value) => serde_json::to_vec(value)
                .map(|body| (Bytes::from(body), Some(JSON_CONTENT_TYPE)))
                .map_err(PublishError::Serialization),
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Bytes(Bytes::copy_from_slice(text.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Bytes(Bytes::from(text))
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

/// Publishes persistent messages to one declared queue via the default exchange.
///
/// Publishes are never retried here: a publish that failed after reaching the
/// broker may still be delivered, so retrying is the caller's decision.
#[derive(Debug, Clone)]
pub struct Publisher {
    channel: ChannelHandle,
    queue: QueueHandle,
}

impl Publisher {
    pub fn new(channel: ChannelHandle, queue: QueueHandle) -> Self {
        Self { channel, queue }
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    pub async fn publish(&self, payload: impl Into<Payload>) -> Result<(), PublishError> {
        let payload = payload.into();
        let (body, content_type) = payload.encode()?;

        if !self.channel.is_open() {
            let err = PublishError::ChannelClosed {
                queue: self.queue.name.clone(),
            };
            error!("{}", err);
            return Err(err);
        }

        let text = String::from_utf8_lossy(&body).into_owned();
        self.channel
            .publish(&self.queue.name, body, true, content_type)
            .await
            .map_err(|e| {
                let err = self.map_error(e);
                error!("{}: {}", err, sanitize_error_message(&source_text(&err)));
                err
            })?;

        info!("Sent: {}", text);
        Ok(())
    }

    /// Serialize `value` as JSON and publish it
    pub async fn publish_json<T: Serialize>(&self, value: &T) -> Result<(), PublishError> {
        self.publish(Payload::json(value)?).await
    }

    /// Publish every payload concurrently over this publisher's channel.
    /// Results are in input order; one failure does not stop the others.
    pub async fn publish_batch<I>(&self, payloads: I) -> Vec<Result<(), PublishError>>
    where
        I: IntoIterator,
        I::Item: Into<Payload>,
    {
        let results = join_all(payloads.into_iter().map(|p| self.publish(p))).await;

        let sent = results.iter().filter(|r| r.is_ok()).count();
        info!(
            "Published {}/{} messages to '{}'",
            sent,
            results.len(),
            self.queue.name
        );
        results
    }

    fn map_error(&self, error: TransportError) -> PublishError {
        let queue = self.queue.name.clone();
        match error {
            TransportError::ChannelClosed => PublishError::ChannelClosed { queue },
            TransportError::Rejected(_) => PublishError::Rejected { queue },
            other => PublishError::Transport {
                queue,
                source: other,
            },
        }
    }
}

fn source_text(error: &PublishError) -> String {
    std::error::Error::source(error)
        .map(|source| source.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerSection;
    use crate::testing::MockBroker;
    use crate::transport::Transport;
    use serde_json::json;

    async fn publisher(broker: &MockBroker) -> Publisher {
        let connection = broker.connect(&BrokerSection::default()).await.unwrap();
        let channel = ChannelHandle::new(connection.create_channel().await.unwrap());
        broker.declare_queue("hello", true);
        Publisher::new(
            channel,
            QueueHandle {
                name: "hello".to_string(),
                durable: true,
                message_count: 0,
                consumer_count: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_json_payload_is_encoded_and_persistent() {
        // Arrange
        let broker = MockBroker::new();
        let publisher = publisher(&broker).await;

        // Act
        publisher
            .publish(json!({"id": 1, "content": "Hello"}))
            .await
            .unwrap();

        // Assert
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].queue, "hello");
        assert!(published[0].persistent);
        assert_eq!(published[0].content_type.as_deref(), Some("application/json"));
        let decoded: serde_json::Value = serde_json::from_slice(&published[0].body).unwrap();
        assert_eq!(decoded, json!({"id": 1, "content": "Hello"}));
    }

    #[tokio::test]
    async fn test_json_keeps_key_order() {
        let broker = MockBroker::new();
        let publisher = publisher(&broker).await;

        publisher
            .publish(json!({"id": 1, "content": "Hello"}))
            .await
            .unwrap();

        assert_eq!(
            broker.published()[0].body,
            Bytes::from(r#"{"id":1,"content":"Hello"}"#)
        );
    }

    #[tokio::test]
    async fn test_bytes_pass_through_unchanged() {
        let broker = MockBroker::new();
        let publisher = publisher(&broker).await;
        let raw = vec![0xde, 0xad, 0xbe, 0xef];

        publisher.publish(raw.clone()).await.unwrap();

        let published = broker.published();
        assert_eq!(published[0].body.as_ref(), raw.as_slice());
        assert_eq!(published[0].content_type, None);
        assert_eq!(broker.queue_depth("hello"), 1);
    }

    #[tokio::test]
    async fn test_publish_json_struct() {
        #[derive(Serialize)]
        struct Greeting<'a> {
            id: u32,
            content: &'a str,
        }

        let broker = MockBroker::new();
        let publisher = publisher(&broker).await;
        publisher
            .publish_json(&Greeting {
                id: 7,
                content: "hi",
            })
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published[0].body, Bytes::from(r#"{"id":7,"content":"hi"}"#));
        assert_eq!(published[0].content_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_retried() {
        let broker = MockBroker::new();
        let publisher = publisher(&broker).await;
        broker.fail_next_publishes(1);

        let err = publisher.publish("lost").await.unwrap_err();

        assert!(matches!(err, PublishError::Transport { .. }));
        assert!(broker.published().is_empty());
        // The next publish goes through: nothing was queued for a retry
        publisher.publish("kept").await.unwrap();
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn test_broker_nack_is_rejected() {
        let broker = MockBroker::new();
        let publisher = publisher(&broker).await;
        broker.nack_next_publishes(1);

        let err = publisher.publish("nope").await.unwrap_err();
        assert!(matches!(err, PublishError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let broker = MockBroker::new();
        let publisher = publisher(&broker).await;
        broker.sever_connections();

        let err = publisher.publish("late").await.unwrap_err();
        assert!(matches!(err, PublishError::ChannelClosed { .. }));
    }

    #[tokio::test]
    async fn test_batch_reports_each_result() {
        let broker = MockBroker::new();
        let publisher = publisher(&broker).await;

        let results = publisher
            .publish_batch((0..20).map(|id| json!({ "id": id })))
            .await;

        assert_eq!(results.len(), 20);
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(broker.queue_depth("hello"), 20);
    }
}
