//! Connection establishment against a broker that is down or flapping
//!
//! Runs on paused time so the backoff schedule can be asserted exactly
//! without the test actually waiting for it.

use amqp_guard::config::BrokerSection;
use amqp_guard::error::ConnectionError;
use amqp_guard::testing::MockBroker;
use amqp_guard::{shutdown_channel, ConnectionManager, ConnectionState, RetryPolicy, ShutdownSignal};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn manager(broker: &MockBroker) -> ConnectionManager {
    ConnectionManager::new(
        Arc::new(broker.clone()),
        BrokerSection::default(),
        RetryPolicy::connect(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_broker_down_gives_up_after_five_attempts() {
    // Arrange
    let broker = MockBroker::new();
    broker.set_down(true);
    let manager = manager(&broker);
    let started = Instant::now();

    // Act
    let result = manager.connect(&ShutdownSignal::never()).await;

    // Assert: 1s + 2s + 4s + 8s between the five attempts
    let elapsed = started.elapsed();
    assert!(matches!(
        result,
        Err(ConnectionError::RetriesExhausted { attempts: 5, .. })
    ));
    assert_eq!(broker.connect_attempts(), 5);
    assert!(elapsed >= Duration::from_secs(15), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(16), "elapsed {elapsed:?}");
    assert!(matches!(manager.state(), ConnectionState::Failed(_)));
}

#[tokio::test(start_paused = true)]
async fn test_broker_recovers_within_budget() {
    // Arrange
    let broker = MockBroker::new();
    broker.fail_next_connects(3);
    let manager = manager(&broker);
    let started = Instant::now();

    // Act
    let channel = manager.connect(&ShutdownSignal::never()).await.unwrap();

    // Assert
    assert!(channel.is_open());
    assert_eq!(broker.connect_attempts(), 4);
    assert!(started.elapsed() >= Duration::from_secs(7));
    assert!(started.elapsed() < Duration::from_secs(8));
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_backoff() {
    // Arrange
    let broker = MockBroker::new();
    broker.set_down(true);
    let manager = manager(&broker);
    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        trigger.trigger();
    });

    // Act
    let result = manager.connect(&shutdown).await;

    // Assert: attempts at 0s and 1s, then cancelled while waiting for the third
    assert!(matches!(result, Err(ConnectionError::Cancelled { attempts: 2 })));
    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_connection_loss() {
    // Arrange
    let broker = MockBroker::new();
    let manager = manager(&broker);
    let first = manager.connect(&ShutdownSignal::never()).await.unwrap();

    // Act
    broker.sever_connections();
    broker.fail_next_connects(1);
    let second = manager.ensure_channel(&ShutdownSignal::never()).await.unwrap();

    // Assert
    assert!(!first.is_open());
    assert!(second.is_open());
    assert_ne!(first.id(), second.id());
    assert_eq!(broker.connect_attempts(), 3);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let broker = MockBroker::new();
    let manager = manager(&broker);
    manager.connect(&ShutdownSignal::never()).await.unwrap();

    manager.close().await;
    manager.close().await;

    assert_eq!(broker.open_connections(), 0);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_close_before_connect_is_harmless() {
    let broker = MockBroker::new();
    let manager = manager(&broker);

    manager.close().await;

    assert_eq!(broker.connect_attempts(), 0);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}
