//! Backend handles and their mailbox.
//!
//! A [`Backend`] is one pooled handle onto an upstream origin. Its mutable
//! state (health, liveness, bound URL and forwarder) is changed only by
//! applying [`BackendUpdate`] messages from its mailbox, in order, on a
//! dedicated task. Readers take a brief lock to copy the current state out;
//! nothing is held across I/O. This is what makes reconfiguration safe
//! under live load: an in-flight forward keeps the forwarder it captured,
//! while the next forward sees the rebound one.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::Response;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use super::forward::{Forward, ProxyRequest};
use crate::error::{Error, Result};

/// Mailbox depth. One slot keeps broadcasts strictly ordered while the
/// apply task drains them.
const MAILBOX_DEPTH: usize = 1;

/// Observable backend lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Not receiving traffic; waiting on a healthy probe.
    Unhealthy,
    /// In rotation.
    Healthy,
    /// Shut down. Terminal; the handle must be discarded.
    Retired,
}

/// A state update delivered through a backend's mailbox.
pub enum BackendUpdate {
    /// Health decision, optionally rebinding the handle to a new origin.
    SetHealth {
        healthy: bool,
        /// New origin; applied together with `forwarder` when it differs
        /// from the current URL.
        url: Option<Url>,
        /// Forwarder bound to `url`.
        forwarder: Option<Arc<dyn Forward>>,
        /// Held by the sender until the update has been applied. The apply
        /// task acknowledges by dropping it.
        ack: mpsc::Sender<()>,
    },
    /// Terminal transition to [`BackendState::Retired`].
    Shutdown,
}

struct BackendInner {
    url: Url,
    healthy: bool,
    alive: bool,
    forwarder: Arc<dyn Forward>,
}

/// One pooled handle onto an upstream origin.
pub struct Backend {
    inner: RwLock<BackendInner>,
}

impl Backend {
    /// Create a handle bound to `url` and spawn its mailbox task.
    ///
    /// Returns the handle and the mailbox sender a health checker
    /// subscribes to it with. Handles start [`BackendState::Unhealthy`]
    /// and enter rotation on the first healthy broadcast.
    pub fn spawn(url: Url, forwarder: Arc<dyn Forward>) -> (Arc<Self>, mpsc::Sender<BackendUpdate>) {
        let backend = Arc::new(Self {
            inner: RwLock::new(BackendInner {
                url,
                healthy: false,
                alive: true,
                forwarder,
            }),
        });

        let (mailbox, mut updates) = mpsc::channel(MAILBOX_DEPTH);
        let handle = backend.clone();
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                if handle.apply(update) {
                    break;
                }
            }
            debug!(backend = %handle.url(), "mailbox released");
        });

        (backend, mailbox)
    }

    /// Apply one update. Returns true once the handle is retired and the
    /// mailbox should be released.
    fn apply(&self, update: BackendUpdate) -> bool {
        match update {
            BackendUpdate::SetHealth {
                healthy,
                url,
                forwarder,
                ack,
            } => {
                {
                    let mut inner = self.inner.write();
                    inner.healthy = healthy && inner.alive;
                    if let (Some(url), Some(forwarder)) = (url, forwarder) {
                        if inner.url != url {
                            inner.url = url;
                            inner.forwarder = forwarder;
                        }
                    }
                }
                drop(ack);
                false
            }
            BackendUpdate::Shutdown => {
                let mut inner = self.inner.write();
                inner.healthy = false;
                inner.alive = false;
                true
            }
        }
    }

    /// Forward a request through the currently bound forwarder.
    ///
    /// # Errors
    ///
    /// `BackendShutdown` if the handle is retired, `BackendUnhealthy` if
    /// the last health decision was negative, or a transport error from
    /// the forward itself.
    pub async fn forward(&self, req: ProxyRequest) -> Result<Response<Full<Bytes>>> {
        let forwarder = {
            let inner = self.inner.read();
            if !inner.alive {
                return Err(Error::BackendShutdown {
                    url: inner.url.clone(),
                });
            }
            if !inner.healthy {
                return Err(Error::BackendUnhealthy {
                    url: inner.url.clone(),
                });
            }
            inner.forwarder.clone()
        };

        forwarder.forward(req).await
    }

    /// The origin this handle is currently bound to.
    pub fn url(&self) -> Url {
        self.inner.read().url.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BackendState {
        let inner = self.inner.read();
        if !inner.alive {
            BackendState::Retired
        } else if inner.healthy {
            BackendState::Healthy
        } else {
            BackendState::Unhealthy
        }
    }

    /// Whether the handle has been retired.
    pub fn is_retired(&self) -> bool {
        self.state() == BackendState::Retired
    }
}
