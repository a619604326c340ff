//! Shared helpers for integration tests: disposable upstream servers with
//! scripted health behavior, pool configuration on test timings, and
//! polling utilities.

// Each test binary includes this file and uses a different subset of it.
#![allow(dead_code)]

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use url::Url;

use turnstile::config::{Config, HealthCheckConfig};
use turnstile::pool::{Pool, ProxyRequest};

/// How a test backend answers its `/health` probe.
#[derive(Clone, Copy)]
pub enum HealthBehavior {
    /// `200` with `{"state":"healthy"}`.
    Healthy,
    /// `503` with `{"state":"degraded"}`.
    Degraded,
    /// `500` with a non-JSON body.
    Error,
}

/// How a test backend answers application paths.
#[derive(Clone, Copy)]
pub enum AppBehavior {
    /// `200` with a fixed body.
    Body(&'static str),
    /// A fixed status with an empty body.
    Status(u16),
}

/// A disposable upstream origin counting non-probe hits.
pub struct TestBackend {
    pub url: Url,
    hits: Arc<AtomicUsize>,
}

impl TestBackend {
    /// Requests served on application paths (probes excluded).
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Spawn an upstream origin on an ephemeral port.
pub async fn spawn_backend(health: HealthBehavior, app: AppBehavior) -> TestBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let task_hits = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let hits = task_hits.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let hits = hits.clone();
                    async move { Ok::<_, Infallible>(respond(&req, health, app, &hits)) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    TestBackend {
        url: Url::parse(&format!("http://{addr}")).unwrap(),
        hits,
    }
}

fn respond(
    req: &Request<Incoming>,
    health: HealthBehavior,
    app: AppBehavior,
    hits: &AtomicUsize,
) -> Response<Full<Bytes>> {
    if req.uri().path() == "/health" {
        return match health {
            HealthBehavior::Healthy => {
                json_response(StatusCode::OK, r#"{"state":"healthy","message":""}"#)
            }
            HealthBehavior::Degraded => json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                r#"{"state":"degraded","message":"draining"}"#,
            ),
            HealthBehavior::Error => Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::from_static(b"boom")))
                .unwrap(),
        };
    }

    hits.fetch_add(1, Ordering::SeqCst);
    match app {
        AppBehavior::Body(body) => Response::new(Full::new(Bytes::from_static(body.as_bytes()))),
        AppBehavior::Status(code) => Response::builder()
            .status(code)
            .body(Full::new(Bytes::new()))
            .unwrap(),
    }
}

fn json_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap()
}

/// Pool configuration on test timings: fast probes, short queue wait.
pub fn test_config(backends: Vec<Url>, cache_enabled: bool) -> Config {
    Config {
        backends,
        conns_per_backend: 2,
        cache_enabled,
        max_retries: 2,
        control_socket: unique_socket_path(),
        queue_wait: Duration::from_millis(300),
        health: HealthCheckConfig {
            interval: Duration::from_millis(50),
            probe_timeout: Duration::from_secs(2),
        },
        ..Config::default()
    }
}

/// A socket path no other test in this process is using.
pub fn unique_socket_path() -> PathBuf {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    std::env::temp_dir().join(format!(
        "turnstile-test-{}-{}.sock",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::SeqCst)
    ))
}

/// A buffered `GET` request for `Pool::dispatch`.
pub fn get(path: &str) -> ProxyRequest {
    ProxyRequest::new(Method::GET, path, HeaderMap::new(), Bytes::new())
}

/// Dispatch one request and return its status and buffered body.
pub async fn fetch_body(pool: &Pool, path: &str) -> (StatusCode, Bytes) {
    let response = pool.dispatch(get(path)).await;
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

/// Poll `path` until it yields `200` with `want`, or five seconds elapse.
/// Returns whether the body was observed.
pub async fn wait_for_body(pool: &Pool, path: &str, want: &str) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        let (status, body) = fetch_body(pool, path).await;
        if status == StatusCode::OK && body == want.as_bytes() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Wait until at least `want` backends report healthy, or five seconds
/// elapse. Sends no traffic, so no retry budget is consumed while the
/// first probes land.
pub async fn wait_healthy(pool: &Pool, want: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while pool.healthy_count().await < want {
        assert!(
            tokio::time::Instant::now() < deadline,
            "{want} backend(s) never became healthy"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
