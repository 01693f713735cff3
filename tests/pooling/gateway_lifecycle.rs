// ABOUTME: Gateway tests - idle shutdown, transparent restart and lifecycle signals

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use hostpool::pool::{ConnectionPoolSettings, Gateway, GatewayState, PoolError};
use pretty_assertions::assert_eq;

use crate::fixtures::{
    connection_id, eventually, key, request, request_id, settings, MockTransport, DELAY_HEADER,
};

fn gateway_with(
    transport: &Arc<MockTransport>,
    settings: ConnectionPoolSettings,
) -> Arc<Gateway<MockTransport>> {
    Arc::new(Gateway::new(key(&settings), settings, Arc::clone(transport)).unwrap())
}

fn short_idle() -> ConnectionPoolSettings {
    settings().with_idle_timeout(Duration::from_millis(50))
}

async fn wait_for_idle(gateway: &Gateway<MockTransport>) {
    let signals = gateway
        .state()
        .signals()
        .cloned()
        .expect("a pool incarnation is running");
    tokio::time::timeout(Duration::from_secs(2), signals.shutdown_completed().wait())
        .await
        .expect("pool should shut down when idle");
}

#[tokio::test]
async fn test_starts_idle_without_connecting() {
    let transport = MockTransport::new();
    let gateway = gateway_with(&transport, settings());

    assert!(matches!(gateway.state(), GatewayState::Idle));
    assert_eq!(transport.connect_attempts(), 0);
}

#[tokio::test]
async fn test_restarts_after_idle_shutdown() {
    let transport = MockTransport::new();
    let gateway = gateway_with(&transport, short_idle());

    let first = gateway.send(request(1)).await.unwrap();
    assert!(gateway.state().is_running());

    wait_for_idle(&gateway).await;
    assert!(matches!(gateway.state(), GatewayState::Idle));
    assert!(eventually(|| transport.open_connections() == 0).await);

    let second = gateway.send(request(2)).await.unwrap();
    assert_eq!(request_id(&second), 2);
    assert_ne!(connection_id(&first), connection_id(&second));
    assert_eq!(transport.connections_opened(), 2);

    // Fresh signals for the new incarnation
    let GatewayState::Running(signals) = gateway.state() else {
        panic!("gateway should be running again");
    };
    assert!(!signals.shutdown_started().is_fired());
    assert!(!signals.shutdown_completed().is_fired());

    // Metrics span incarnations
    assert_eq!(gateway.metrics().snapshot().requests_total, 2);
}

#[tokio::test]
async fn test_signals_fire_once_per_incarnation() {
    let transport = MockTransport::new();
    let gateway = gateway_with(&transport, short_idle());

    gateway.send(request(1)).await.unwrap();
    let first = gateway.state().signals().cloned().unwrap();
    wait_for_idle(&gateway).await;

    gateway.send(request(2)).await.unwrap();
    let second = gateway.state().signals().cloned().unwrap();

    assert!(first.shutdown_started().is_fired());
    assert!(first.shutdown_completed().is_fired());
    assert!(!second.shutdown_started().is_fired());
}

#[tokio::test]
async fn test_request_during_shutdown_goes_to_fresh_pool() {
    let transport = MockTransport::new();
    let gateway = gateway_with(&transport, settings());

    let in_flight = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            gateway
                .send(request(1).with_header(DELAY_HEADER, "200"))
                .await
        })
    };
    assert!(eventually(|| transport.requests_seen() == 1).await);

    let shutdown = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.shutdown().await })
    };
    assert!(eventually(|| matches!(gateway.state(), GatewayState::ShuttingDown(_))).await);

    let during = gateway.send(request(2)).await.unwrap();
    let before = in_flight.await.unwrap().unwrap();

    assert_eq!(request_id(&before), 1);
    assert_eq!(request_id(&during), 2);
    assert_ne!(connection_id(&before), connection_id(&during));

    tokio::time::timeout(Duration::from_secs(2), shutdown)
        .await
        .expect("old incarnation should finish")
        .unwrap();
    assert!(gateway.state().is_running());
}

#[tokio::test]
async fn test_concurrent_restart_creates_one_pool() {
    let transport = MockTransport::new();
    let gateway = gateway_with(&transport, short_idle().with_max_connections(1));

    gateway.send(request(0)).await.unwrap();
    wait_for_idle(&gateway).await;

    let results = join_all((1..=10).map(|id| gateway.send(request(id)))).await;

    assert!(results.iter().all(Result::is_ok));
    // One connection per incarnation; a second pool would have opened a third
    assert_eq!(transport.connections_opened(), 2);
    assert!(transport.max_open_connections() <= 1);
}

#[tokio::test]
async fn test_explicit_shutdown_then_reuse() {
    let transport = MockTransport::new();
    let gateway = gateway_with(&transport, settings());

    gateway.send(request(1)).await.unwrap();
    gateway.shutdown().await;

    assert!(matches!(gateway.state(), GatewayState::Idle));
    assert!(eventually(|| transport.open_connections() == 0).await);
    assert!(gateway.send(request(2)).await.is_ok());
}

#[tokio::test]
async fn test_invalid_settings_rejected() {
    let transport = MockTransport::new();
    let settings = settings().with_max_connections(0);

    let result = Gateway::new(key(&settings), settings, transport);
    assert!(matches!(result, Err(PoolError::InvalidSettings(_))));
}
