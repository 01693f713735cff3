// ABOUTME: Host pool tests - slot selection, pipelining, retries, backpressure and idle shutdown

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use hostpool::pool::{Completion, HostPool, PoolError, Reply};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use crate::fixtures::{
    connection_id, eventually, key, request, request_id, settings, MockTransport, BREAK_HEADER,
    DELAY_HEADER, DUPLICATE_HEADER, PANIC_HEADER, STATUS_HEADER,
};

fn pool_with(
    transport: &Arc<MockTransport>,
    settings: hostpool::pool::ConnectionPoolSettings,
) -> HostPool {
    HostPool::new(key(&settings), settings, Arc::clone(transport)).unwrap()
}

fn collecting_reply(tx: &mpsc::UnboundedSender<Completion>) -> Reply {
    let tx = tx.clone();
    Box::new(move |completion: Completion| {
        let _ = tx.send(completion);
    })
}

#[tokio::test]
async fn test_idle_connection_is_reused() {
    let transport = MockTransport::new();
    let pool = pool_with(&transport, settings());

    let first = pool.send(request(1)).await.unwrap();
    let second = pool.send(request(2)).await.unwrap();

    assert_eq!(connection_id(&first), connection_id(&second));
    assert_eq!(transport.connections_opened(), 1);
}

#[tokio::test]
async fn test_busy_slot_opens_second_connection() {
    let transport = MockTransport::new();
    let pool = pool_with(&transport, settings().with_max_connections(2));

    let (slow, fast) = tokio::join!(
        pool.send(request(1).with_header(DELAY_HEADER, "100")),
        pool.send(request(2)),
    );

    assert_ne!(connection_id(&slow.unwrap()), connection_id(&fast.unwrap()));
    assert_eq!(transport.connections_opened(), 2);
}

#[tokio::test]
async fn test_pipelines_onto_single_connection() {
    let transport = MockTransport::new();
    let pool = pool_with(
        &transport,
        settings().with_max_connections(1).with_pipelining_limit(2),
    );

    let (first, second) = tokio::join!(
        pool.send(request(1).with_header(DELAY_HEADER, "50")),
        pool.send(request(2)),
    );

    assert_eq!(connection_id(&first.unwrap()), connection_id(&second.unwrap()));
    assert_eq!(transport.connections_opened(), 1);
}

#[tokio::test]
async fn test_open_connections_bounded() {
    let transport = MockTransport::new();
    let pool = pool_with(&transport, settings().with_max_connections(2));

    let results = join_all(
        (0..10).map(|id| pool.send(request(id).with_header(DELAY_HEADER, "20"))),
    )
    .await;

    assert!(results.iter().all(Result::is_ok));
    assert!(transport.max_open_connections() <= 2);
    assert_eq!(transport.connections_opened(), 2);
}

#[tokio::test]
async fn test_pipelined_responses_match_requests() {
    let transport = MockTransport::new();
    let pool = pool_with(
        &transport,
        settings().with_max_connections(1).with_pipelining_limit(8),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    for id in 0..8u64 {
        let delay = (8 - id) * 5;
        pool.dispatch(
            request(id).with_header(DELAY_HEADER, &delay.to_string()),
            collecting_reply(&tx),
        )
        .await;
    }

    let mut order = Vec::new();
    for _ in 0..8 {
        let completion = rx.recv().await.unwrap();
        order.push(request_id(&completion.result.unwrap()));
    }

    assert_eq!(order, (0..8).collect::<Vec<_>>());
    assert_eq!(transport.connections_opened(), 1);
}

#[tokio::test]
async fn test_retries_exhausted_after_k_plus_one_failures() {
    let transport = MockTransport::new();
    transport.fail_connects(usize::MAX);
    let pool = pool_with(&transport, settings().with_max_connections(1).with_max_retries(3));

    let err = pool.send(request(1)).await.unwrap_err();

    assert!(matches!(err, PoolError::RetriesExhausted { retries: 3, .. }));
    assert!(matches!(err.root_cause(), PoolError::Connect { .. }));
    assert_eq!(transport.connect_attempts(), 4);
    assert_eq!(pool.metrics().snapshot().failures_total, 1);
}

#[tokio::test]
async fn test_zero_retries_surfaces_first_failure() {
    let transport = MockTransport::new();
    transport.fail_connects(1);
    let pool = pool_with(&transport, settings().with_max_retries(0));

    let err = pool.send(request(1)).await.unwrap_err();

    assert_eq!(err.retries(), 0);
    assert_eq!(transport.connect_attempts(), 1);

    // The pool itself is still usable
    assert!(pool.send(request(2)).await.is_ok());
}

#[tokio::test]
async fn test_transient_connect_failures_are_retried() {
    let transport = MockTransport::new();
    transport.fail_connects(2);
    let pool = pool_with(&transport, settings().with_max_connections(1));

    let (tx, mut rx) = mpsc::unbounded_channel();
    pool.dispatch(request(7), collecting_reply(&tx)).await;
    let completion = rx.recv().await.unwrap();

    assert_eq!(completion.retries, 2);
    assert_eq!(request_id(&completion.result.unwrap()), 7);
    assert_eq!(transport.connect_attempts(), 3);

    let metrics = pool.metrics().snapshot();
    assert_eq!(metrics.connect_failures, 2);
    assert_eq!(metrics.retries_total, 2);
    assert_eq!(metrics.connections_opened, 1);
}

#[tokio::test]
async fn test_broken_connection_retries_whole_queue() {
    let transport = MockTransport::new();
    transport.allow_breaks(1);
    let pool = pool_with(
        &transport,
        settings().with_max_connections(1).with_pipelining_limit(2),
    );

    let (first, second) = tokio::join!(
        pool.send(request(1).with_header(DELAY_HEADER, "100")),
        pool.send(request(2).with_header(BREAK_HEADER, "1")),
    );

    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(request_id(&first), 1);
    assert_eq!(request_id(&second), 2);
    assert_eq!(connection_id(&first), 2);
    assert_eq!(connection_id(&second), 2);
    assert_eq!(pool.metrics().snapshot().retries_total, 2);
}

#[tokio::test]
async fn test_panicking_connection_task_retries_queue() {
    let transport = MockTransport::new();
    transport.allow_panics(1);
    let pool = pool_with(&transport, settings().with_max_connections(1));

    let response = tokio::time::timeout(
        Duration::from_secs(2),
        pool.send(request(1).with_header(PANIC_HEADER, "1")),
    )
    .await
    .expect("request resolves after the connection task dies")
    .unwrap();

    assert_eq!(request_id(&response), 1);
    assert_eq!(connection_id(&response), 2);
    let metrics = pool.metrics().snapshot();
    assert_eq!(metrics.retries_total, 1);
    assert_eq!(metrics.open_connections, 1);
}

#[tokio::test]
async fn test_panicking_connection_task_without_retries_fails_request() {
    let transport = MockTransport::new();
    transport.allow_panics(1);
    let pool = pool_with(&transport, settings().with_max_retries(0));

    let err = tokio::time::timeout(
        Duration::from_secs(2),
        pool.send(request(1).with_header(PANIC_HEADER, "1")),
    )
    .await
    .expect("request resolves after the connection task dies")
    .unwrap_err();

    assert!(matches!(err.root_cause(), PoolError::Transport(_)));
    assert!(eventually(|| transport.open_connections() == 0).await);
    assert!(pool.send(request(2)).await.is_ok());
}

#[tokio::test]
async fn test_unmatched_response_drops_connection() {
    let transport = MockTransport::new();
    let pool = pool_with(&transport, settings().with_max_connections(1));

    let first = pool
        .send(request(1).with_header(DUPLICATE_HEADER, "1"))
        .await
        .unwrap();
    assert_eq!(request_id(&first), 1);

    // The second copy has nothing to answer, so the connection is torn down
    assert!(eventually(|| transport.open_connections() == 0).await);
    assert_eq!(pool.metrics().snapshot().open_connections, 0);

    let second = pool.send(request(2)).await.unwrap();
    assert_eq!(request_id(&second), 2);
    assert_eq!(connection_id(&second), 2);
}

#[tokio::test]
async fn test_reconnect_backs_off_after_failed_connects() {
    let transport = MockTransport::new();
    transport.fail_connects(2);
    let pool = pool_with(
        &transport,
        settings()
            .with_max_connections(1)
            .with_connection_backoff(Duration::from_millis(100), Duration::from_secs(1)),
    );

    // Immediate attempt, then waits of base and 2 * base
    let started = Instant::now();
    let response = pool.send(request(1)).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(request_id(&response), 1);
    assert_eq!(transport.connect_attempts(), 3);

    // A successful connect resets the delay for the next reconnect
    transport.allow_breaks(1);
    let started = Instant::now();
    let response = pool
        .send(request(2).with_header(BREAK_HEADER, "1"))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(connection_id(&response), 2);
}

#[tokio::test]
async fn test_server_errors_are_not_retried() {
    let transport = MockTransport::new();
    let pool = pool_with(&transport, settings());

    let response = pool
        .send(request(1).with_header(STATUS_HEADER, "503"))
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    assert!(response.is_server_error());
    assert_eq!(transport.requests_seen(), 1);
    assert_eq!(pool.metrics().snapshot().retries_total, 0);
}

#[tokio::test]
async fn test_dispatch_suspends_at_max_open_requests() {
    let transport = MockTransport::new();
    let pool = pool_with(
        &transport,
        settings().with_max_connections(1).with_max_open_requests(2),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    for id in 0..2 {
        pool.dispatch(
            request(id).with_header(DELAY_HEADER, "150"),
            collecting_reply(&tx),
        )
        .await;
    }

    let blocked = tokio::time::timeout(
        Duration::from_millis(50),
        pool.dispatch(request(2), collecting_reply(&tx)),
    )
    .await;
    assert!(blocked.is_err(), "third dispatch should wait for capacity");

    // Capacity returns once a completion is consumed
    let first = rx.recv().await.unwrap();
    drop(first);
    tokio::time::timeout(
        Duration::from_secs(1),
        pool.dispatch(request(3), collecting_reply(&tx)),
    )
    .await
    .expect("dispatch admitted after a result was taken");
}

#[tokio::test]
async fn test_idle_timeout_shuts_pool_down() {
    let transport = MockTransport::new();
    let pool = pool_with(&transport, settings().with_idle_timeout(Duration::from_millis(50)));

    pool.send(request(1)).await.unwrap();
    assert_eq!(transport.open_connections(), 1);

    tokio::time::timeout(
        Duration::from_secs(2),
        pool.signals().shutdown_completed().wait(),
    )
    .await
    .expect("pool should shut down when idle");

    assert!(pool.signals().shutdown_started().is_fired());
    assert!(!pool.is_accepting());
    assert!(eventually(|| transport.open_connections() == 0).await);
    assert!(matches!(
        pool.send(request(2)).await,
        Err(PoolError::PoolShutDown)
    ));
}

#[tokio::test]
async fn test_shutdown_drains_accepted_requests() {
    let transport = MockTransport::new();
    let pool = pool_with(&transport, settings());

    let in_flight = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.send(request(1).with_header(DELAY_HEADER, "100")).await })
    };
    assert!(eventually(|| transport.requests_seen() == 1).await);

    pool.shutdown();
    pool.signals().shutdown_started().wait().await;
    assert!(!pool.signals().shutdown_completed().is_fired());

    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(request_id(&response), 1);

    tokio::time::timeout(
        Duration::from_secs(2),
        pool.signals().shutdown_completed().wait(),
    )
    .await
    .expect("pool should finish shutting down");
}

#[tokio::test]
async fn test_every_request_resolves_once() {
    let transport = MockTransport::new();
    transport.fail_connects(3);
    let pool = pool_with(
        &transport,
        settings().with_max_connections(3).with_max_retries(1).with_pipelining_limit(2),
    );

    let resolved = Arc::new(Mutex::new(Vec::new()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    for id in 0..30u64 {
        let resolved = Arc::clone(&resolved);
        let tx = tx.clone();
        let reply: Reply = Box::new(move |completion: Completion| {
            resolved.lock().unwrap().push(id);
            let _ = tx.send(completion);
        });
        pool.dispatch(request(id), reply).await;
        // Keep admission free for the next dispatch
        while let Ok(completion) = rx.try_recv() {
            drop(completion);
        }
    }
    drop(tx);
    while rx.recv().await.is_some() {}

    let mut resolved = resolved.lock().unwrap().clone();
    resolved.sort_unstable();
    assert_eq!(resolved, (0..30).collect::<Vec<_>>());
}
