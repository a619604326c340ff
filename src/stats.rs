//! Prometheus metrics for the proxy.
//!
//! A single [`Metrics`] handle is shared by the pool, the health checkers,
//! and the public listener. The registry is encoded on demand by a small
//! HTTP listener serving `GET /metrics` in OpenMetrics text format; the
//! metrics path never touches the request path.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, body::Incoming, header};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::{EncodeLabelSet, text::encode};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets, linear_buckets};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tracing::{debug, info};

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Labels for the request-outcome counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// Terminal outcome of a proxied request.
    pub outcome: String,
}

/// Labels for the cache lookup counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    /// `hit` or `miss`.
    pub cache: String,
}

/// Shared metric handles plus the registry they are registered in.
pub struct Metrics {
    registry: Registry,
    /// Terminal request outcomes by kind.
    pub requests: Family<OutcomeLabels, Counter>,
    /// Cache hits and misses.
    pub cache_lookups: Family<CacheLabels, Counter>,
    /// Number of backends currently reporting healthy.
    pub backends_healthy: Gauge,
    /// Backend handles sitting in the available queue.
    pub connections_available: Gauge,
    /// Backend handles currently checked out by requests.
    pub connections_in_use: Gauge,
    /// Seconds spent waiting to acquire a backend handle.
    pub queue_wait: Histogram,
    /// Seconds from dispatch entry to the response being ready,
    /// retries and cache lookups included.
    pub request_duration: Histogram,
    /// Forward attempts consumed per request.
    pub attempts: Histogram,
}

impl Metrics {
    /// Build and register the full metric set.
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("turnstile");

        let requests = Family::<OutcomeLabels, Counter>::default();
        registry.register("requests", "Terminal request outcomes", requests.clone());

        let cache_lookups = Family::<CacheLabels, Counter>::default();
        registry.register("cache", "Cache hits and misses", cache_lookups.clone());

        let backends_healthy = Gauge::default();
        registry.register(
            "backends_healthy",
            "Backends currently reporting healthy",
            backends_healthy.clone(),
        );

        let connections_available = Gauge::default();
        registry.register(
            "connections_available",
            "Backend handles in the available queue",
            connections_available.clone(),
        );

        let connections_in_use = Gauge::default();
        registry.register(
            "connections_in_use",
            "Backend handles checked out by requests",
            connections_in_use.clone(),
        );

        let queue_wait = Histogram::new(exponential_buckets(0.0005, 2.0, 15));
        registry.register(
            "queue_wait_seconds",
            "Time spent acquiring a backend handle",
            queue_wait.clone(),
        );

        let request_duration = Histogram::new(exponential_buckets(0.001, 2.0, 16));
        registry.register(
            "request_duration_seconds",
            "Time from dispatch entry to response completion",
            request_duration.clone(),
        );

        let attempts = Histogram::new(linear_buckets(0.0, 1.0, 8));
        registry.register(
            "request_attempts",
            "Forward attempts consumed per request",
            attempts.clone(),
        );

        Self {
            registry,
            requests,
            cache_lookups,
            backends_healthy,
            connections_available,
            connections_in_use,
            queue_wait,
            request_duration,
            attempts,
        }
    }

    /// Count a terminal request outcome.
    pub fn record_outcome(&self, outcome: &str) {
        self.requests
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    /// Count a cache lookup result.
    pub fn record_cache(&self, result: &str) {
        self.cache_lookups
            .get_or_create(&CacheLabels {
                cache: result.to_string(),
            })
            .inc();
    }

    /// Encode the registry in OpenMetrics text format.
    ///
    /// # Errors
    ///
    /// Returns an error if text encoding fails.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve `GET /metrics` on the given address until the task is dropped.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or accept.
pub async fn serve(metrics: Arc<Metrics>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    info!(address = %listener.local_addr()?, "metrics listener ready");

    loop {
        let (stream, _) = listener.accept().await.context("metrics accept failed")?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let metrics = metrics.clone();
                async move { Ok::<_, Infallible>(respond(&metrics, &req)) }
            });

            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(error = %err, "metrics connection error");
            }
        });
    }
}

fn respond(metrics: &Metrics, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    if req.uri().path() != "/metrics" {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap();
    }

    match metrics.encode() {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)
            .body(Full::new(Bytes::from(body)))
            .unwrap(),
        Err(err) => {
            debug!(error = %err, "metrics encoding failed");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::new()))
                .unwrap()
        }
    }
}
