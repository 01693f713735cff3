// ABOUTME: Router tests - URI routing, usage errors, gateway creation and result multiplexing

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::StreamExt;
use hostpool::pool::{GatewayState, PoolError, Request, Responses, Router};
use pretty_assertions::assert_eq;

use crate::fixtures::{eventually, request, request_id, settings, MockTransport, DELAY_HEADER};

fn router_with<T: Send + 'static>(
    transport: &Arc<MockTransport>,
) -> (Router<T, MockTransport>, Responses<T>) {
    Router::builder(Arc::clone(transport))
        .settings(settings())
        .build()
        .unwrap()
}

async fn next<T>(responses: &mut Responses<T>) -> (Result<hostpool::pool::Response, PoolError>, T) {
    tokio::time::timeout(Duration::from_secs(2), responses.next())
        .await
        .expect("result within two seconds")
        .expect("stream open")
}

#[tokio::test]
async fn test_relative_uri_is_usage_error() {
    let transport = MockTransport::new();
    let (router, mut responses) = router_with::<&'static str>(&transport);

    router.dispatch(Request::get("/relative/path"), "ctx-1").await;
    let (result, context) = next(&mut responses).await;

    assert_eq!(context, "ctx-1");
    assert!(matches!(result, Err(PoolError::Usage(_))));
    assert_eq!(transport.connect_attempts(), 0);
    assert!(router.pool_keys().is_empty());
}

#[tokio::test]
async fn test_unsupported_scheme_is_usage_error() {
    let transport = MockTransport::new();
    let (router, mut responses) = router_with::<u32>(&transport);

    router.dispatch(Request::get("ftp://files.test/a"), 9).await;
    let (result, context) = next(&mut responses).await;

    assert_eq!(context, 9);
    assert!(matches!(result, Err(PoolError::Usage(_))));
    assert_eq!(transport.connect_attempts(), 0);
}

#[tokio::test]
async fn test_multiplexes_hosts_with_context() {
    let transport = MockTransport::new();
    let (router, mut responses) = router_with::<String>(&transport);

    router
        .dispatch(Request::get("http://alpha.test/a"), "alpha".to_string())
        .await;
    router
        .dispatch(Request::get("http://beta.test:8080/b"), "beta".to_string())
        .await;

    let mut contexts = HashSet::new();
    for _ in 0..2 {
        let (result, context) = next(&mut responses).await;
        assert_eq!(result.unwrap().status(), 200);
        contexts.insert(context);
    }

    assert_eq!(
        contexts,
        HashSet::from(["alpha".to_string(), "beta".to_string()])
    );
    let mut keys: Vec<String> = router.pool_keys().iter().map(ToString::to_string).collect();
    keys.sort();
    assert_eq!(keys, vec!["http://alpha.test:80", "http://beta.test:8080"]);
}

#[tokio::test]
async fn test_default_port_shares_pool() {
    let transport = MockTransport::new();
    let (router, _responses) = router_with::<()>(&transport);

    let implicit = router.key_for("http://mock.test/a").unwrap();
    let explicit = router.key_for("http://MOCK.test:80/b?x=1").unwrap();

    assert_eq!(implicit, explicit);
}

#[tokio::test]
async fn test_concurrent_first_requests_create_one_gateway() {
    let transport = MockTransport::new();
    let (router, mut responses) = router_with::<u64>(&transport);

    join_all((0..20u64).map(|id| router.dispatch(request(id), id))).await;
    for _ in 0..20 {
        let (result, id) = next(&mut responses).await;
        assert_eq!(request_id(&result.unwrap()), id);
    }

    assert_eq!(router.pool_keys().len(), 1);
    assert!(transport.max_open_connections() <= settings().max_connections);
}

#[tokio::test]
async fn test_many_requests_over_pipelined_connections() {
    let transport = MockTransport::new();
    let (router, mut responses) = Router::builder(Arc::clone(&transport))
        .settings(settings().with_max_connections(4).with_pipelining_limit(2))
        .build::<u64>()
        .unwrap();

    let dispatcher = {
        let router = router.clone();
        tokio::spawn(async move {
            for id in 1..=500u64 {
                router.dispatch(request(id), id).await;
            }
        })
    };

    let mut sum = 0;
    for _ in 0..500 {
        let (result, id) = next(&mut responses).await;
        assert_eq!(request_id(&result.unwrap()), id);
        sum += id;
    }
    dispatcher.await.unwrap();

    assert_eq!(sum, 500 * 501 / 2);
    assert!(transport.max_open_connections() <= 4);
}

#[tokio::test]
async fn test_host_settings_override() {
    let transport = MockTransport::new();
    let slow = settings().with_max_connections(1);
    let (router, mut responses) = Router::builder(Arc::clone(&transport))
        .settings(settings())
        .host_settings("Slow.test", slow.clone())
        .build::<()>()
        .unwrap();

    let slow_key = router.key_for("http://slow.test/").unwrap();
    let fast_key = router.key_for("http://fast.test/").unwrap();
    assert_eq!(slow_key.settings_fingerprint(), slow.fingerprint());
    assert_ne!(slow_key.settings_fingerprint(), fast_key.settings_fingerprint());

    router.dispatch(Request::get("http://slow.test/"), ()).await;
    next(&mut responses).await.0.unwrap();
    assert_eq!(
        router.gateway(&slow_key).unwrap().settings().max_connections,
        1
    );
}

#[tokio::test]
async fn test_invalid_settings_rejected_at_build() {
    let transport = MockTransport::new();

    let result = Router::builder(Arc::clone(&transport))
        .host_settings("broken.test", settings().with_pipelining_limit(0))
        .build::<()>();

    assert!(matches!(result, Err(PoolError::InvalidSettings(_))));
}

#[tokio::test]
async fn test_invalidate_drops_gateway() {
    let transport = MockTransport::new();
    let (router, mut responses) = router_with::<u64>(&transport);

    router.dispatch(request(1), 1).await;
    next(&mut responses).await.0.unwrap();
    let key = router.key_for("http://mock.test/").unwrap();

    assert!(router.invalidate(&key).is_some());
    assert!(router.gateway(&key).is_none());
    assert!(router.invalidate(&key).is_none());

    router.dispatch(request(2), 2).await;
    let (result, id) = next(&mut responses).await;
    assert_eq!(request_id(&result.unwrap()), id);
    assert!(router.gateway(&key).is_some());
}

#[tokio::test]
async fn test_shutdown_all_closes_every_pool() {
    let transport = MockTransport::new();
    let (router, mut responses) = router_with::<u64>(&transport);

    router.dispatch(Request::get("http://alpha.test/"), 1).await;
    router
        .dispatch(
            Request::get("http://beta.test/").with_header(DELAY_HEADER, "50"),
            2,
        )
        .await;

    router.shutdown_all().await;

    // Accepted work still completes
    for _ in 0..2 {
        assert!(next(&mut responses).await.0.is_ok());
    }
    for key in router.pool_keys() {
        let gateway = router.gateway(&key).unwrap();
        assert!(matches!(gateway.state(), GatewayState::Idle));
    }
    assert!(eventually(|| transport.open_connections() == 0).await);
}
