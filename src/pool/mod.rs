//! Backend connection pool.
//!
//! The pool owns everything on the request path:
//!
//! - the **available queue**, a bounded channel of backend handles that is
//!   at once the selection structure (handles come back in effectively
//!   random order) and the admission limiter (once every handle is checked
//!   out, new requests wait, then fail with 504)
//! - one **health checker** per backend URL, publishing decisions into the
//!   handles' mailboxes
//! - the optional **response cache** consulted before a handle forwards
//! - the **reconfiguration** path that swaps the backend set under load,
//!   preferring to rebind an existing checker over tearing one down
//!
//! ```text
//! [client] -> fetch -> [cache?] -> [available queue] -> Backend -> origin
//!                                        ^                  |
//!                                        +---- re-enqueue --+
//! ```

mod backend;
mod cache;
mod control;
mod forward;
mod health;

pub use backend::{Backend, BackendState, BackendUpdate};
pub use cache::ResponseCache;
pub use control::{ControlChannel, DEFAULT_SOCKET_PATH};
pub use forward::{Forward, ProxyRequest, ReverseProxy};
pub use health::HealthChecker;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Response, StatusCode, body::Incoming};
use rand::seq::SliceRandom;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Config, HealthCheckConfig};
use crate::error::Error;
use crate::stats::Metrics;

/// Dial timeout for the shared upstream client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// End-to-end timeout for one forwarded request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Idle timeout for pooled upstream connections.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// The backend connection pool.
pub struct Pool {
    available_tx: mpsc::Sender<Arc<Backend>>,
    available_rx: Mutex<mpsc::Receiver<Arc<Backend>>>,
    /// One checker per backend URL. `fetch` never touches this map;
    /// `reconfigure` holds the write side for the whole swap.
    checkers: RwLock<HashMap<Url, Arc<HealthChecker>>>,
    client: reqwest::Client,
    cache: Option<ResponseCache>,
    conns_per_backend: usize,
    max_retries: u32,
    queue_wait: Duration,
    health: HealthCheckConfig,
    metrics: Arc<Metrics>,
}

impl Pool {
    /// Build the pool: shared client, optional cache, and
    /// `conns_per_backend` handles per configured backend, shuffled into
    /// the available queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream HTTP client cannot be built.
    pub async fn new(config: &Config, metrics: Arc<Metrics>) -> Result<Arc<Self>> {
        let capacity = queue_capacity(config.conns_per_backend, config.backends.len());

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .pool_max_idle_per_host(config.conns_per_backend + 1)
            .build()
            .context("failed to create upstream HTTP client")?;

        let cache = config.cache_enabled.then(ResponseCache::new);
        let (available_tx, available_rx) = mpsc::channel(capacity);

        let pool = Arc::new(Self {
            available_tx,
            available_rx: Mutex::new(available_rx),
            checkers: RwLock::new(HashMap::new()),
            client,
            cache,
            conns_per_backend: config.conns_per_backend,
            max_retries: config.max_retries,
            queue_wait: config.queue_wait,
            health: config.health.clone(),
            metrics,
        });

        let mut handles = Vec::new();
        {
            let mut checkers = pool.checkers.write().await;
            for url in &config.backends {
                handles.extend(pool.install_backend(&mut checkers, url.clone()));
            }
        }
        pool.shuffle_in(handles).await;

        info!(
            backends = config.backends.len(),
            capacity,
            cache = pool.cache.is_some(),
            "connection pool ready"
        );
        Ok(pool)
    }

    /// Serve one client request, buffering its body first.
    pub async fn fetch(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                warn!(error = %err, "failed to read request body");
                return empty_response(StatusCode::BAD_REQUEST);
            }
        };

        self.dispatch(ProxyRequest::from_parts(&parts, body)).await
    }

    /// Serve one buffered request.
    ///
    /// Draws a handle from the available queue (504 after the queue wait
    /// timeout), serves `GET` cache hits directly, and otherwise forwards.
    /// Backend-level failures re-enqueue the handle and retry against
    /// whichever handle the queue yields next, bounded by `max_retries`;
    /// an exhausted budget yields an empty response. Retired handles are
    /// discarded, never re-enqueued.
    pub async fn dispatch(&self, req: ProxyRequest) -> Response<Full<Bytes>> {
        let started = Instant::now();
        let response = self.serve_attempts(req).await;
        self.metrics
            .request_duration
            .observe(started.elapsed().as_secs_f64());
        response
    }

    /// The attempt loop behind [`Pool::dispatch`].
    async fn serve_attempts(&self, req: ProxyRequest) -> Response<Full<Bytes>> {
        let mut attempt: u32 = 0;

        loop {
            let backend = match self.acquire().await {
                Ok(backend) => backend,
                Err(err) => {
                    warn!(error = %err, "no backend available");
                    self.metrics.record_outcome("gateway_timeout");
                    return gateway_timeout();
                }
            };

            if backend.is_retired() {
                debug!(backend = %backend.url(), "discarding retired handle");
                self.metrics.connections_in_use.dec();
                continue;
            }

            if attempt > self.max_retries {
                self.metrics.connections_in_use.dec();
                self.metrics.attempts.observe(f64::from(attempt));
                self.metrics.record_outcome("retry_exhausted");
                return empty_response(StatusCode::BAD_GATEWAY);
            }

            if req.method == Method::GET {
                if let Some(cache) = &self.cache {
                    if let Some(body) = cache.get(req.path()) {
                        self.metrics.record_cache("hit");
                        self.release(backend).await;
                        self.metrics.attempts.observe(f64::from(attempt));
                        self.metrics.record_outcome("cache_hit");
                        return Response::builder()
                            .status(StatusCode::OK)
                            .body(Full::new(body))
                            .unwrap();
                    }
                    self.metrics.record_cache("miss");
                }
            }

            match backend.forward(req.clone()).await {
                Ok(response) => {
                    self.release(backend).await;
                    self.metrics.attempts.observe(f64::from(attempt));
                    self.metrics.record_outcome("proxied");
                    return response;
                }
                Err(err @ Error::BackendShutdown { .. }) => {
                    debug!(error = %err, "discarding retired handle");
                    self.metrics.connections_in_use.dec();
                }
                Err(err) if err.is_retryable() => {
                    warn!(error = %err, attempt, "retrying against another backend");
                    self.release(backend).await;
                    self.metrics.record_outcome("backend_error");
                    attempt += 1;
                }
                Err(err) => {
                    warn!(error = %err, "request failed");
                    let status = err.status_code();
                    self.release(backend).await;
                    self.metrics.attempts.observe(f64::from(attempt));
                    self.metrics.record_outcome("error");
                    return empty_response(status);
                }
            }
        }
    }

    /// Apply a new desired backend set.
    ///
    /// Removed URLs preferentially hand their checker (and with it every
    /// subscribed handle already circulating in the queue) to an added
    /// URL via [`HealthChecker::reuse`]; without a replacement the checker
    /// shuts down and retires its handles. Remaining additions are built
    /// exactly as at startup and shuffled into the queue.
    pub async fn reconfigure(&self, desired: Vec<Url>) {
        let mut checkers = self.checkers.write().await;
        let current: Vec<Url> = checkers.keys().cloned().collect();
        let (mut added, removed) = difference(&current, &desired);
        info!(
            adding = added.len(),
            removing = removed.len(),
            "applying backend update"
        );

        for old_url in removed {
            if added.is_empty() {
                if let Some(checker) = checkers.remove(&old_url) {
                    checker.shutdown().await;
                }
            } else {
                let new_url = added.remove(0);
                if let Some(checker) = checkers.remove(&old_url) {
                    let forwarder = self.forwarder_for(&new_url);
                    checker.reuse(new_url.clone(), forwarder).await;
                    checkers.insert(new_url, checker);
                }
            }
        }

        let mut fresh = Vec::new();
        for url in added {
            fresh.extend(self.install_backend(&mut checkers, url));
        }
        self.shuffle_in(fresh).await;
    }

    /// Shut down every health checker, retiring all handles.
    pub async fn shutdown(&self) {
        let checkers = self.checkers.read().await;
        info!(checkers = checkers.len(), "shutting down pool");
        for checker in checkers.values() {
            checker.shutdown().await;
        }
    }

    /// URLs currently in rotation (keys of the checker map).
    pub async fn backends(&self) -> Vec<Url> {
        self.checkers.read().await.keys().cloned().collect()
    }

    /// Number of backends whose last reported health was positive.
    pub async fn healthy_count(&self) -> usize {
        let checkers = self.checkers.read().await;
        let mut count = 0;
        for checker in checkers.values() {
            if checker.is_healthy().await {
                count += 1;
            }
        }
        count
    }

    /// Wait for a handle, bounded by the queue wait timeout.
    async fn acquire(&self) -> crate::error::Result<Arc<Backend>> {
        let started = Instant::now();
        let waited = timeout(self.queue_wait, async {
            self.available_rx.lock().await.recv().await
        })
        .await;
        self.metrics
            .queue_wait
            .observe(started.elapsed().as_secs_f64());

        match waited {
            Ok(Some(backend)) => {
                self.metrics.connections_available.dec();
                self.metrics.connections_in_use.inc();
                Ok(backend)
            }
            _ => Err(Error::NoCapacity {
                wait_ms: self.queue_wait.as_millis() as u64,
            }),
        }
    }

    /// Return a handle to the queue.
    async fn release(&self, backend: Arc<Backend>) {
        self.metrics.connections_in_use.dec();
        self.metrics.connections_available.inc();
        let _ = self.available_tx.send(backend).await;
    }

    /// Build handles, mailboxes, and a running checker for one URL.
    fn install_backend(
        &self,
        checkers: &mut HashMap<Url, Arc<HealthChecker>>,
        url: Url,
    ) -> Vec<Arc<Backend>> {
        let forwarder = self.forwarder_for(&url);
        let mut handles = Vec::with_capacity(self.conns_per_backend);
        let mut subscribers = Vec::with_capacity(self.conns_per_backend);

        for _ in 0..self.conns_per_backend {
            let (backend, mailbox) = Backend::spawn(url.clone(), forwarder.clone());
            handles.push(backend);
            subscribers.push(mailbox);
        }

        let checker = Arc::new(HealthChecker::new(
            self.client.clone(),
            subscribers,
            url.clone(),
            self.health.clone(),
            self.metrics.clone(),
        ));
        tokio::spawn(checker.clone().run());
        checkers.insert(url, checker);

        handles
    }

    fn forwarder_for(&self, url: &Url) -> Arc<dyn Forward> {
        Arc::new(ReverseProxy::new(
            url.clone(),
            self.client.clone(),
            self.cache.clone(),
        ))
    }

    /// Enqueue handles in randomized order.
    async fn shuffle_in(&self, mut handles: Vec<Arc<Backend>>) {
        handles.shuffle(&mut rand::rng());
        for handle in handles {
            self.metrics.connections_available.inc();
            if self.available_tx.send(handle).await.is_err() {
                break;
            }
        }
    }
}

/// Queue capacity: double the handle count, with room for at least one
/// backend so an initially-empty pool can grow over the control channel.
fn queue_capacity(conns_per_backend: usize, backend_count: usize) -> usize {
    conns_per_backend * backend_count.max(1) * 2
}

/// Set difference between the current and desired backend sets, in
/// desired order. Duplicate desired entries collapse to one.
fn difference(current: &[Url], desired: &[Url]) -> (Vec<Url>, Vec<Url>) {
    let current_set: HashSet<&Url> = current.iter().collect();
    let desired_set: HashSet<&Url> = desired.iter().collect();

    let mut added = Vec::new();
    let mut seen = HashSet::new();
    for url in desired {
        if !current_set.contains(url) && seen.insert(url) {
            added.push(url.clone());
        }
    }

    let removed = current
        .iter()
        .filter(|url| !desired_set.contains(*url))
        .cloned()
        .collect();

    (added, removed)
}

fn gateway_timeout() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::GATEWAY_TIMEOUT)
        .body(Full::new(Bytes::from_static(b"Gateway Timeout")))
        .unwrap()
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap()
}
