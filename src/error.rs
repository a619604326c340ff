//! Error taxonomy for the proxy core.
//!
//! Backend-level failures (`BackendUnhealthy`, `Transport`) are retryable:
//! the pool re-enqueues the handle and draws another. `BackendShutdown`
//! marks a retired handle that must be discarded. `NoCapacity` is the only
//! variant a client ever observes, as `504 Gateway Timeout`.

use hyper::StatusCode;
use url::Url;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised on the request path.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The selected backend is marked unhealthy.
    #[error("backend unhealthy: {url}")]
    BackendUnhealthy { url: Url },

    /// The selected backend has been retired and must not be reused.
    #[error("backend retired: {url}")]
    BackendShutdown { url: Url },

    /// Network or IO failure while forwarding to the upstream.
    #[error("upstream transport failure for {url}: {source}")]
    Transport {
        url: Url,
        #[source]
        source: reqwest::Error,
    },

    /// No backend handle became available within the queue wait timeout.
    #[error("no backend available within {wait_ms}ms")]
    NoCapacity { wait_ms: u64 },

    /// A backend URL could not be parsed or resolved against an origin.
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),

    /// Malformed response parts while rebuilding the client response.
    #[error("response assembly failed: {0}")]
    Http(#[from] hyper::http::Error),
}

impl Error {
    /// Whether the pool should re-enqueue the handle and try another backend.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnhealthy { .. } | Self::Transport { .. }
        )
    }

    /// Status code reported to the client when this error terminates a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoCapacity { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}
