//! Runtime reconfiguration scenarios: growing an empty pool over the
//! control socket, rebinding live handles to replacement backends, and
//! checker-map bookkeeping.

#[path = "common.rs"]
mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{
    AppBehavior, HealthBehavior, fetch_body, spawn_backend, test_config, wait_for_body,
    wait_healthy,
};
use hyper::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use turnstile::pool::{ControlChannel, Pool};
use turnstile::stats::Metrics;

#[tokio::test]
async fn test_backend_added_over_control_socket() {
    let config = test_config(vec![], false);
    let socket_path = config.control_socket.clone();
    let pool = Pool::new(&config, Arc::new(Metrics::new())).await.unwrap();

    let control = ControlChannel::new(socket_path.clone());
    tokio::spawn(control.run(pool.clone()));

    // The listener binds asynchronously; wait for the socket file.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !socket_path.exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "control socket never appeared"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let backend = spawn_backend(HealthBehavior::Healthy, AppBehavior::Body("bar")).await;
    let mut stream = UnixStream::connect(&socket_path).await.unwrap();

    // Garbage lines are ignored without touching the backend set.
    stream.write_all(b"not a url\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pool.backends().await.is_empty());

    stream
        .write_all(format!("{}\n", backend.url).as_bytes())
        .await
        .unwrap();
    stream.flush().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !pool.backends().await.contains(&backend.url) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "backend never entered the checker map"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    wait_healthy(&pool, 1).await;

    let (status, body) = fetch_body(&pool, "/foo").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), b"bar");
}

#[tokio::test]
async fn test_reuse_rebinds_live_handles_to_replacement() {
    let a = spawn_backend(HealthBehavior::Healthy, AppBehavior::Body("a")).await;
    let b = spawn_backend(HealthBehavior::Healthy, AppBehavior::Body("b")).await;

    let pool = Pool::new(
        &test_config(vec![a.url.clone(), b.url.clone()], false),
        Arc::new(Metrics::new()),
    )
    .await
    .unwrap();
    wait_healthy(&pool, 2).await;

    // Both backends take traffic before the swap.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while a.hits() == 0 || b.hits() == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "both backends should serve before reconfiguration"
        );
        let (status, _) = fetch_body(&pool, "/").await;
        assert_eq!(status, StatusCode::OK);
    }

    // Swap A out for C. A's checker is rebound, so the handles already
    // circulating in the queue pick up C's forwarder.
    let c = spawn_backend(HealthBehavior::Healthy, AppBehavior::Body("c")).await;
    pool.reconfigure(vec![b.url.clone(), c.url.clone()]).await;

    let keys: HashSet<_> = pool.backends().await.into_iter().collect();
    let want: HashSet<_> = [b.url.clone(), c.url.clone()].into_iter().collect();
    assert_eq!(keys, want);

    let a_hits = a.hits();
    assert!(
        wait_for_body(&pool, "/", "c").await,
        "rebound handles should reach the replacement backend"
    );

    for _ in 0..20 {
        let (status, body) = fetch_body(&pool, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(
            body.as_ref() == b"b" || body.as_ref() == b"c",
            "unexpected responder after reconfiguration: {body:?}"
        );
    }
    assert_eq!(a.hits(), a_hits, "no request may reach a removed backend");
}

#[tokio::test]
async fn test_shrinking_the_set_retires_handles() {
    let a = spawn_backend(HealthBehavior::Healthy, AppBehavior::Body("a")).await;
    let b = spawn_backend(HealthBehavior::Healthy, AppBehavior::Body("b")).await;

    let pool = Pool::new(
        &test_config(vec![a.url.clone(), b.url.clone()], false),
        Arc::new(Metrics::new()),
    )
    .await
    .unwrap();
    wait_healthy(&pool, 2).await;

    // No replacement available: A's checker shuts down and its handles
    // retire.
    pool.reconfigure(vec![b.url.clone()]).await;
    assert_eq!(pool.backends().await, vec![b.url.clone()]);

    let a_hits = a.hits();
    for _ in 0..20 {
        let (status, body) = fetch_body(&pool, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_ref(), b"b");
    }
    assert_eq!(a.hits(), a_hits, "retired backend must receive no traffic");
}

#[tokio::test]
async fn test_reconfigure_to_empty_set_drains_the_pool() {
    let a = spawn_backend(HealthBehavior::Healthy, AppBehavior::Body("a")).await;
    let pool = Pool::new(
        &test_config(vec![a.url.clone()], false),
        Arc::new(Metrics::new()),
    )
    .await
    .unwrap();
    wait_healthy(&pool, 1).await;

    pool.reconfigure(vec![]).await;
    assert!(pool.backends().await.is_empty());

    // Retired handles are discarded on dequeue; once the queue is empty
    // the request times out.
    let (status, body) = fetch_body(&pool, "/").await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body.as_ref(), b"Gateway Timeout");
}
