//! Periodic queue health reporting
//!
//! The monitor polls queue depth and consumer count on its own schedule,
//! independent of message flow. A failed poll is logged and the next tick
//! runs as usual; only a configured ceiling of consecutive failures stops it.

use super::connection::{ChannelHandle, ConnectionManager};
use super::declare::{QueueDeclarator, QueueHandle};
use crate::config::{ClientConfig, Credentials, StatsSourceKind};
use crate::error::{sanitize_error_message, ConnectionError, DeclarationError, MonitorError};
use crate::monitor_span;
use crate::shutdown::ShutdownSignal;
use crate::transport::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn, Instrument, Span};
use url::Url;

/// Queue statistics at one point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub queue: String,
    pub messages: u64,
    pub consumers: u64,
    pub observed_at: DateTime<Utc>,
    pub source: StatsSourceKind,
}

/// Somewhere queue statistics can be read from
#[async_trait]
pub trait QueueStatsSource: Send + Sync {
    async fn fetch(&self, queue: &str) -> Result<QueueSnapshot, MonitorError>;

    fn kind(&self) -> StatsSourceKind;
}

/// Subset of the management API's queue object
#[derive(Debug, Deserialize)]
struct ManagementQueue {
    #[serde(default)]
    messages: u64,
    #[serde(default)]
    consumers: u64,
}

/// Broker HTTP management API (`GET /api/queues/{vhost}/{queue}`)
#[derive(Debug, Clone)]
pub struct ManagementApi {
    client: reqwest::Client,
    base_url: Url,
    vhost: String,
    credentials: Credentials,
}

impl ManagementApi {
    pub fn new(
        base_url: &str,
        vhost: &str,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self, MonitorError> {
        let base_url =
            Url::parse(base_url).map_err(|e| MonitorError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(MonitorError::InvalidUrl(base_url.to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            vhost: vhost.to_string(),
            credentials,
        })
    }

    /// URL of the queue resource; vhost and queue name are single path
    /// segments, so a `/` inside either is percent-encoded
    pub fn queue_url(&self, queue: &str) -> Result<Url, MonitorError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| MonitorError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["api", "queues", self.vhost.as_str(), queue]);
        Ok(url)
    }
}

#[async_trait]
impl QueueStatsSource for ManagementApi {
    async fn fetch(&self, queue: &str) -> Result<QueueSnapshot, MonitorError> {
        let response = self
            .client
            .get(self.queue_url(queue)?)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MonitorError::Status {
                status: status.as_u16(),
            });
        }

        let stats: ManagementQueue = response
            .json()
            .await
            .map_err(|e| MonitorError::Decode(e.to_string()))?;

        Ok(QueueSnapshot {
            queue: queue.to_string(),
            messages: stats.messages,
            consumers: stats.consumers,
            observed_at: Utc::now(),
            source: StatsSourceKind::Management,
        })
    }

    fn kind(&self) -> StatsSourceKind {
        StatsSourceKind::Management
    }
}

/// Passive declares on a dedicated channel of the client's own connection
pub struct ChannelStats {
    manager: Arc<ConnectionManager>,
    channel: Mutex<Option<ChannelHandle>>,
}

impl ChannelStats {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            channel: Mutex::new(None),
        }
    }

    async fn channel(&self) -> Result<ChannelHandle, MonitorError> {
        let mut cached = self.channel.lock().await;
        if let Some(channel) = cached.as_ref().filter(|c| c.is_open()) {
            return Ok(channel.clone());
        }

        let channel = self.manager.open_channel().await.map_err(|e| match e {
            ConnectionError::ChannelOpen(source) => MonitorError::Channel(source),
            other => MonitorError::Channel(TransportError::ConnectionLost(other.to_string())),
        })?;
        *cached = Some(channel.clone());
        Ok(channel)
    }
}

#[async_trait]
impl QueueStatsSource for ChannelStats {
    async fn fetch(&self, queue: &str) -> Result<QueueSnapshot, MonitorError> {
        let channel = self.channel().await?;
        let handle = QueueDeclarator::new(channel)
            .inspect_queue(queue)
            .await
            .map_err(|e| {
                MonitorError::Channel(match e {
                    DeclarationError::ChannelClosed { .. } => TransportError::ChannelClosed,
                    DeclarationError::NotFound { queue } => TransportError::NotFound(queue),
                    DeclarationError::Transport { source, .. } => source,
                    other => TransportError::Protocol(other.to_string()),
                })
            })?;

        Ok(QueueSnapshot {
            queue: handle.name,
            messages: u64::from(handle.message_count),
            consumers: u64::from(handle.consumer_count),
            observed_at: Utc::now(),
            source: StatsSourceKind::Channel,
        })
    }

    fn kind(&self) -> StatsSourceKind {
        StatsSourceKind::Channel
    }
}

/// Build the statistics source selected by `config.monitor.source`
pub fn stats_source(
    config: &ClientConfig,
    manager: Arc<ConnectionManager>,
) -> Result<Arc<dyn QueueStatsSource>, MonitorError> {
    match config.monitor.source {
        StatsSourceKind::Management => Ok(Arc::new(ManagementApi::new(
            &config.monitor.management_url(&config.broker),
            &config.broker.vhost,
            config.broker.credentials(),
            config.monitor.request_timeout(),
        )?)),
        StatsSourceKind::Channel => Ok(Arc::new(ChannelStats::new(manager))),
    }
}

/// Tick counters returned when the monitor stops cleanly
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub ticks: u64,
    pub failures: u64,
}

pub struct QueueMonitor {
    source: Arc<dyn QueueStatsSource>,
    queue: String,
    interval: Duration,
    max_consecutive_failures: Option<u32>,
    latest: watch::Sender<Option<QueueSnapshot>>,
    span: Span,
}

impl QueueMonitor {
    pub fn new(source: Arc<dyn QueueStatsSource>, queue: &QueueHandle, interval: Duration) -> Self {
        let span = monitor_span!(queue = %queue.name, source = ?source.kind());
        let (latest, _) = watch::channel(None);
        Self {
            source,
            queue: queue.name.clone(),
            interval,
            max_consecutive_failures: None,
            latest,
            span,
        }
    }

    /// Stop with [`MonitorError::TooManyFailures`] after `limit` failed ticks in a row
    pub fn with_failure_ceiling(mut self, limit: Option<u32>) -> Self {
        self.max_consecutive_failures = limit;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Most recent successful snapshot
    pub fn subscribe(&self) -> watch::Receiver<Option<QueueSnapshot>> {
        self.latest.subscribe()
    }

    /// Query once and log the outcome
    pub async fn tick(&self) -> Result<QueueSnapshot, MonitorError> {
        match self.source.fetch(&self.queue).await {
            Ok(snapshot) => {
                info!(
                    "Queue {}: messages={}, consumers={}",
                    snapshot.queue, snapshot.messages, snapshot.consumers
                );
                self.latest.send_replace(Some(snapshot.clone()));
                Ok(snapshot)
            }
            Err(e) => {
                warn!("{}", sanitize_error_message(&describe(&e)));
                Err(e)
            }
        }
    }

    /// Tick every interval until `shutdown` fires. Cancellation takes effect
    /// at the sleep between ticks and is not an error.
    pub async fn run(&self, shutdown: &ShutdownSignal) -> Result<MonitorReport, MonitorError> {
        self.run_inner(shutdown).instrument(self.span.clone()).await
    }

    async fn run_inner(&self, shutdown: &ShutdownSignal) -> Result<MonitorReport, MonitorError> {
        info!("Monitoring queue '{}' every {:?}", self.queue, self.interval);
        let mut report = MonitorReport::default();
        let mut consecutive = 0u32;

        while !shutdown.is_cancelled() {
            report.ticks += 1;
            match self.tick().await {
                Ok(_) => consecutive = 0,
                Err(_) => {
                    report.failures += 1;
                    consecutive += 1;
                    if let Some(limit) = self.max_consecutive_failures {
                        if consecutive >= limit {
                            let err = MonitorError::TooManyFailures {
                                failures: consecutive,
                            };
                            error!("{}", err);
                            return Err(err);
                        }
                    }
                }
            }

            if !shutdown.sleep(self.interval).await {
                break;
            }
        }

        info!("Queue monitor stopped after {} ticks", report.ticks);
        Ok(report)
    }
}

/// Error text including its cause, e.g. the transport error behind a
/// channel-stats failure
fn describe(error: &MonitorError) -> String {
    match std::error::Error::source(error) {
        Some(source) if !matches!(error, MonitorError::Http(_)) => format!("{error}: {source}"),
        _ => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerSection;
    use crate::retry::RetryPolicy;
    use crate::shutdown::shutdown_channel;
    use crate::testing::MockBroker;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn guest() -> Credentials {
        BrokerSection::default().credentials()
    }

    fn hello() -> QueueHandle {
        QueueHandle {
            name: "hello".to_string(),
            durable: true,
            message_count: 0,
            consumer_count: 0,
        }
    }

    #[test]
    fn test_queue_url_encodes_default_vhost() {
        let api = ManagementApi::new(
            "http://localhost:15672/",
            "/",
            guest(),
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(
            api.queue_url("hello").unwrap().as_str(),
            "http://localhost:15672/api/queues/%2F/hello"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let err = ManagementApi::new("not a url", "/", guest(), Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, MonitorError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_management_api_snapshot() {
        // Arrange
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/queues/%2F/hello"))
            .and(header("authorization", "Basic Z3Vlc3Q6Z3Vlc3Q="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "hello",
                "messages": 42,
                "consumers": 2,
                "durable": true
            })))
            .mount(&server)
            .await;
        let api = ManagementApi::new(&server.uri(), "/", guest(), Duration::from_secs(5)).unwrap();

        // Act
        let snapshot = api.fetch("hello").await.unwrap();

        // Assert
        assert_eq!(snapshot.messages, 42);
        assert_eq!(snapshot.consumers, 2);
        assert_eq!(snapshot.source, StatsSourceKind::Management);
    }

    #[tokio::test]
    async fn test_management_api_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let api = ManagementApi::new(&server.uri(), "/", guest(), Duration::from_secs(5)).unwrap();

        let err = api.fetch("hello").await.unwrap_err();
        assert!(matches!(err, MonitorError::Status { status: 401 }));
    }

    #[tokio::test]
    async fn test_management_api_bad_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>plugin disabled</html>"))
            .mount(&server)
            .await;
        let api = ManagementApi::new(&server.uri(), "/", guest(), Duration::from_secs(5)).unwrap();

        let err = api.fetch("hello").await.unwrap_err();
        assert!(matches!(err, MonitorError::Decode(_)));
    }

    #[tokio::test]
    async fn test_channel_stats_reads_counts() {
        let broker = MockBroker::new();
        broker.enqueue("hello", "a");
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            BrokerSection::default(),
            RetryPolicy::connect(),
        ));
        manager.connect(&ShutdownSignal::never()).await.unwrap();
        let stats = ChannelStats::new(manager);

        let snapshot = stats.fetch("hello").await.unwrap();
        assert_eq!(snapshot.messages, 1);
        assert_eq!(snapshot.consumers, 0);

        // A missing queue closes the channel; the next fetch reopens one
        assert!(matches!(
            stats.fetch("missing").await,
            Err(MonitorError::Channel(TransportError::NotFound(_)))
        ));
        assert!(stats.fetch("hello").await.is_ok());
    }

    #[tokio::test]
    async fn test_channel_stats_without_connection() {
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(MockBroker::new()),
            BrokerSection::default(),
            RetryPolicy::connect(),
        ));
        let stats = ChannelStats::new(manager);

        assert!(matches!(
            stats.fetch("hello").await,
            Err(MonitorError::Channel(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_monitor_ticks_while_reconnecting() {
        // Arrange: the broker drops and stays down while a reconnect backs off
        let broker = MockBroker::new();
        broker.declare_queue("hello", true);
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            BrokerSection::default(),
            RetryPolicy::connect(),
        ));
        manager.connect(&ShutdownSignal::never()).await.unwrap();
        broker.sever_connections();
        broker.set_down(true);

        let reconnecting = manager.clone();
        let reconnect = tokio::spawn(async move {
            reconnecting.ensure_channel(&ShutdownSignal::never()).await
        });

        let monitor = QueueMonitor::new(
            Arc::new(ChannelStats::new(manager.clone())),
            &hello(),
            Duration::from_secs(1),
        );
        let (trigger, shutdown) = shutdown_channel();
        let stopper = async {
            tokio::time::sleep(Duration::from_millis(4500)).await;
            trigger.trigger();
        };

        // Act
        let (report, ()) = tokio::join!(monitor.run(&shutdown), stopper);

        // Assert: one tick per second, each failing fast, all inside the 15s backoff
        let report = report.unwrap();
        assert_eq!(report.ticks, 5);
        assert_eq!(report.failures, 5);
        assert!(!reconnect.is_finished());
        reconnect.abort();
    }

    #[tokio::test]
    async fn test_run_survives_failures_until_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let api = ManagementApi::new(&server.uri(), "/", guest(), Duration::from_secs(5)).unwrap();
        let monitor = QueueMonitor::new(Arc::new(api), &hello(), Duration::from_millis(20));
        let (trigger, shutdown) = shutdown_channel();

        let stopper = async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.trigger();
        };
        let (report, ()) = tokio::join!(monitor.run(&shutdown), stopper);

        let report = report.unwrap();
        assert!(report.ticks >= 2);
        assert_eq!(report.ticks, report.failures);
    }

    #[tokio::test]
    async fn test_run_stops_at_failure_ceiling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;
        let api = ManagementApi::new(&server.uri(), "/", guest(), Duration::from_secs(5)).unwrap();
        let monitor = QueueMonitor::new(Arc::new(api), &hello(), Duration::from_millis(5))
            .with_failure_ceiling(Some(3));

        let err = monitor.run(&ShutdownSignal::never()).await.unwrap_err();
        assert!(matches!(err, MonitorError::TooManyFailures { failures: 3 }));
    }

    #[tokio::test]
    async fn test_tick_publishes_latest_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"messages": 3, "consumers": 1})),
            )
            .mount(&server)
            .await;
        let api = ManagementApi::new(&server.uri(), "/", guest(), Duration::from_secs(5)).unwrap();
        let monitor = QueueMonitor::new(Arc::new(api), &hello(), Duration::from_secs(10));
        let latest = monitor.subscribe();

        monitor.tick().await.unwrap();

        let snapshot = latest.borrow().clone().unwrap();
        assert_eq!(snapshot.messages, 3);
        assert_eq!(snapshot.queue, "hello");
    }
}
