//! Public HTTP listener.
//!
//! Accepts HTTP/1.1 connections (optionally behind TLS) and hands every
//! request to [`Pool::fetch`]. On SIGTERM or ctrl-c the listener stops
//! accepting, shuts the pool down, and drains in-flight connections for a
//! grace period before aborting them.

use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, rustls};
use tracing::{debug, error, info, warn};

use crate::config::TlsConfig;
use crate::pool::Pool;

/// How long in-flight connections may drain after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// The public listener.
pub struct Server {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl Server {
    /// Bind the listen address and load TLS material when configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or the TLS
    /// certificate/key cannot be loaded.
    pub async fn bind(addr: SocketAddr, tls: Option<&TlsConfig>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind listener on {addr}"))?;

        let tls = match tls {
            Some(config) => Some(load_tls_acceptor(config)?),
            None => None,
        };

        Ok(Self { listener, tls })
    }

    /// The bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket's local address cannot be read.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the SIGTERM handler cannot be installed.
    pub async fn serve(self, pool: Arc<Pool>) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut connections = JoinSet::new();

        let protocol = if self.tls.is_some() { "https" } else { "http" };
        info!(address = %self.local_addr()?, protocol, "listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            error!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    debug!(remote = %remote_addr, "connection accepted");

                    let pool = pool.clone();
                    let tls = self.tls.clone();
                    connections.spawn(async move {
                        if let Err(err) = handle_connection(stream, tls, pool).await {
                            debug!(remote = %remote_addr, error = %err, "connection error");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    break;
                }
            }
        }

        pool.shutdown().await;

        let drained = timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "shutdown grace expired, aborting connections"
            );
            connections.abort_all();
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    tls: Option<TlsAcceptor>,
    pool: Arc<Pool>,
) -> Result<()> {
    match tls {
        Some(acceptor) => {
            let stream = acceptor
                .accept(stream)
                .await
                .context("TLS handshake failed")?;
            serve_http(stream, pool).await?;
        }
        None => serve_http(stream, pool).await?,
    }
    Ok(())
}

async fn serve_http<S>(stream: S, pool: Arc<Pool>) -> hyper::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let service = service_fn(move |req| {
        let pool = pool.clone();
        async move { Ok::<_, Infallible>(pool.fetch(req).await) }
    });

    http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
}

fn load_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_file = File::open(&tls.cert)
        .with_context(|| format!("failed to open certificate: {}", tls.cert.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::io::Result<Vec<_>>>()
        .context("failed to parse certificate chain")?;

    let key_file = File::open(&tls.key)
        .with_context(|| format!("failed to open private key: {}", tls.key.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("failed to parse private key")?
        .ok_or_else(|| anyhow!("no private key found in {}", tls.key.display()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid certificate/key pair")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = Server::bind(SocketAddr::from(([127, 0, 0, 1], 0)), None)
            .await
            .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert!(server.tls.is_none());
    }

    #[tokio::test]
    async fn test_bind_fails_on_missing_tls_material() {
        let tls = TlsConfig {
            cert: PathBuf::from("/nonexistent/cert.pem"),
            key: PathBuf::from("/nonexistent/key.pem"),
        };
        let result = Server::bind(SocketAddr::from(([127, 0, 0, 1], 0)), Some(&tls)).await;
        assert!(result.is_err());
    }
}
