//! Per-backend health checking.
//!
//! One [`HealthChecker`] owns one backend URL and the mailboxes of every
//! handle pooled against it. A fixed-cadence loop probes `GET {url}/health`
//! and broadcasts only *transitions* to its subscribers, waiting until each
//! one has applied the update before the next probe can run. The checker
//! survives reconfiguration: [`HealthChecker::reuse`] rebinds it to a new
//! URL and pushes an unconditional unhealthy broadcast carrying the new
//! forwarder, so subscribers stop sending traffic to the old origin before
//! the first probe of the new one completes.
//!
//! The decision for one probe:
//!
//! - network error, read error, or no response: unhealthy
//! - body decodes as `{"state": ..., "message": ...}`: healthy when
//!   `state == "healthy"`, or when the status is 200 and `state` is not
//!   the explicit `"degraded"` drain marker
//! - body does not decode: healthy when the status is 200

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use super::backend::BackendUpdate;
use super::forward::Forward;
use crate::config::HealthCheckConfig;
use crate::stats::Metrics;

/// Health report a backend may publish on `/health`.
#[derive(Debug, Default, Deserialize)]
struct HealthReport {
    #[serde(default)]
    state: String,
    #[serde(default)]
    message: String,
}

struct CheckerState {
    url: Url,
    /// Last health reported to subscribers.
    healthy: bool,
}

/// Probe loop for one backend URL.
pub struct HealthChecker {
    state: Mutex<CheckerState>,
    subscribers: Vec<mpsc::Sender<BackendUpdate>>,
    client: reqwest::Client,
    config: HealthCheckConfig,
    done: watch::Sender<bool>,
    metrics: Arc<Metrics>,
}

impl HealthChecker {
    /// Create a checker for `url` with the given subscriber mailboxes.
    /// The loop does not run until [`HealthChecker::run`] is spawned.
    pub fn new(
        client: reqwest::Client,
        subscribers: Vec<mpsc::Sender<BackendUpdate>>,
        url: Url,
        config: HealthCheckConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (done, _) = watch::channel(false);

        Self {
            state: Mutex::new(CheckerState {
                url,
                healthy: false,
            }),
            subscribers,
            client,
            config,
            done,
            metrics,
        }
    }

    /// Run the probe loop until [`HealthChecker::shutdown`] is called.
    pub async fn run(self: Arc<Self>) {
        let mut done = self.done.subscribe();
        // Shutdown may have landed before this task was first polled.
        if *done.borrow() {
            return;
        }

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = done.changed() => {
                    let backend = self.url().await;
                    debug!(%backend, "health checker stopped");
                    return;
                }
            }
        }
    }

    /// One probe. The state lock is held across probe and broadcast so a
    /// concurrent `reuse` or `shutdown` cannot interleave with a tick.
    async fn tick(&self) {
        let mut state = self.state.lock().await;
        let healthy = self.probe(&state.url).await;

        if healthy != state.healthy {
            state.healthy = healthy;
            if healthy {
                self.metrics.backends_healthy.inc();
            } else {
                self.metrics.backends_healthy.dec();
            }
            info!(backend = %state.url, healthy, "backend health changed");
            self.broadcast(healthy, None).await;
        }
    }

    async fn probe(&self, url: &Url) -> bool {
        let endpoint = match url.join("/health") {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(backend = %url, error = %err, "cannot build probe url");
                return false;
            }
        };

        let response = match self
            .client
            .get(endpoint)
            .timeout(self.config.probe_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                debug!(backend = %url, error = %err, "health probe failed");
                return false;
            }
        };

        let status = response.status();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                debug!(backend = %url, error = %err, "health probe body read failed");
                return false;
            }
        };

        evaluate(status, &body)
    }

    /// Deliver one update to every subscriber and wait until all have
    /// applied it. Retired subscribers count as applied immediately.
    async fn broadcast(&self, healthy: bool, rebind: Option<(Url, Arc<dyn Forward>)>) {
        let (ack, mut applied) = mpsc::channel::<()>(1);

        for subscriber in &self.subscribers {
            let update = BackendUpdate::SetHealth {
                healthy,
                url: rebind.as_ref().map(|(url, _)| url.clone()),
                forwarder: rebind.as_ref().map(|(_, forwarder)| forwarder.clone()),
                ack: ack.clone(),
            };
            let _ = subscriber.send(update).await;
        }

        drop(ack);
        let _ = applied.recv().await;
    }

    /// Rebind this checker to a new URL during reconfiguration.
    ///
    /// Broadcasts `healthy = false` with the new URL and forwarder before
    /// returning, so no subscriber keeps routing to the old origin. The
    /// broadcast is the last reported health; a healthy new origin
    /// re-enters rotation on the next probe.
    pub async fn reuse(&self, url: Url, forwarder: Arc<dyn Forward>) {
        let mut state = self.state.lock().await;
        info!(old = %state.url, new = %url, "rebinding health checker");

        state.url = url.clone();
        if state.healthy {
            self.metrics.backends_healthy.dec();
        }
        state.healthy = false;
        self.broadcast(false, Some((url, forwarder))).await;
    }

    /// Retire every subscriber and stop the probe loop. Returns once each
    /// subscriber has released its mailbox, so no retired handle can still
    /// be forwarding when the caller proceeds.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        info!(backend = %state.url, "shutting down health checker");

        for subscriber in &self.subscribers {
            let _ = subscriber.send(BackendUpdate::Shutdown).await;
        }
        for subscriber in &self.subscribers {
            subscriber.closed().await;
        }

        if state.healthy {
            self.metrics.backends_healthy.dec();
        }
        state.healthy = false;
        self.done.send_replace(true);
    }

    /// The URL this checker currently probes.
    pub async fn url(&self) -> Url {
        self.state.lock().await.url.clone()
    }

    /// Last health reported to subscribers.
    pub async fn is_healthy(&self) -> bool {
        self.state.lock().await.healthy
    }
}

/// Decide one probe result from the response status and body.
fn evaluate(status: reqwest::StatusCode, body: &[u8]) -> bool {
    match serde_json::from_slice::<HealthReport>(body) {
        Ok(report) => {
            if report.state == "degraded" {
                debug!(status = %status, message = %report.message, "backend reports degraded");
            }
            report.state == "healthy"
                || (status == reqwest::StatusCode::OK && report.state != "degraded")
        }
        Err(_) => status == reqwest::StatusCode::OK,
    }
}
