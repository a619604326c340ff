//! Binary entry point: resolve configuration, start the pool, the control
//! channel, the metrics listener, and the public listener.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use turnstile::config::Cli;
use turnstile::pool::{ControlChannel, Pool};
use turnstile::server::Server;
use turnstile::stats::{self, Metrics};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "turnstile=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Cli::parse().into_config()?;
    info!(
        port = config.port,
        backends = config.backends.len(),
        conns_per_backend = config.conns_per_backend,
        cache = config.cache_enabled,
        tls = config.tls.is_some(),
        "starting turnstile"
    );

    let metrics = Arc::new(Metrics::new());
    let pool = Pool::new(&config, metrics.clone()).await?;

    let control = ControlChannel::new(config.control_socket.clone());
    {
        let pool = pool.clone();
        tokio::spawn(async move {
            if let Err(err) = control.run(pool).await {
                error!(error = %err, "control channel terminated");
            }
        });
    }

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    tokio::spawn(async move {
        if let Err(err) = stats::serve(metrics, metrics_addr).await {
            error!(error = %err, "metrics listener terminated");
        }
    });

    let server = Server::bind(SocketAddr::from(([0, 0, 0, 0], config.port)), config.tls.as_ref())
        .await?;
    server.serve(pool).await
}
