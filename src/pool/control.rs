//! Control channel for runtime backend updates.
//!
//! A Unix-domain socket listener accepts peers one at a time and reads
//! line-delimited messages. Each line is a comma-separated list of
//! absolute backend URLs naming the *complete* desired backend set, and
//! is handed to [`Pool::reconfigure`]. A stale socket file from a prior
//! run is removed before binding.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};
use url::Url;

use super::Pool;

/// Default control socket location.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/turnstile.sock";

/// Unix-socket listener feeding [`Pool::reconfigure`].
pub struct ControlChannel {
    socket_path: PathBuf,
}

impl ControlChannel {
    /// Create a channel bound to the given socket path when run.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Bind the socket and process peers until an accept error.
    ///
    /// Peers are served sequentially; a peer's read error is logged and
    /// the listener moves on to the next connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the stale socket cannot be removed, or on a
    /// bind or accept failure. These are fatal to the control task only.
    pub async fn run(self, pool: Arc<Pool>) -> std::io::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(socket = %self.socket_path.display(), "control channel listening");

        loop {
            let (stream, _) = listener.accept().await?;
            debug!("control peer connected");

            if let Err(err) = serve_peer(stream, &pool).await {
                warn!(error = %err, "control peer failed");
            }
        }
    }
}

async fn serve_peer(stream: UnixStream, pool: &Pool) -> std::io::Result<()> {
    let mut lines = BufReader::new(stream).lines();

    while let Some(line) = lines.next_line().await? {
        let desired = parse_backend_list(&line);
        debug!(desired = ?desired, "control message received");
        pool.reconfigure(desired).await;
    }

    debug!("control peer disconnected");
    Ok(())
}

/// Parse one control line into the desired backend set. Invalid entries
/// are logged and skipped.
pub(crate) fn parse_backend_list(line: &str) -> Vec<Url> {
    line.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match Url::parse(entry) {
            Ok(url) if url.host_str().is_some() => Some(url),
            Ok(_) => {
                warn!(backend = entry, "ignoring backend url without a host");
                None
            }
            Err(err) => {
                warn!(backend = entry, error = %err, "ignoring invalid backend url");
                None
            }
        })
        .collect()
}
