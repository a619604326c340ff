//! Configuration for the proxy.
//!
//! Settings come from two places, flags winning over file values:
//!
//! - command-line flags ([`Cli`])
//! - an optional TOML file (`--config`), mirroring the flag set
//!
//! The resolved [`Config`] is what the rest of the crate consumes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use url::Url;

use crate::pool::DEFAULT_SOCKET_PATH;

/// Default public listen port.
pub const DEFAULT_PORT: u16 = 3000;
/// Default metrics listen port.
pub const DEFAULT_METRICS_PORT: u16 = 8080;
/// Default number of pooled connections per backend.
pub const DEFAULT_CONNS_PER_BACKEND: usize = 3;
/// Default retry budget per request.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default time a request waits for a backend handle before giving up.
pub const DEFAULT_QUEUE_WAIT: Duration = Duration::from_secs(5);

/// Command-line interface.
#[derive(Debug, Parser)]
#[command(
    name = "turnstile",
    version,
    about = "HTTP reverse-proxy load balancer with live reconfiguration"
)]
pub struct Cli {
    /// Port the public listener binds.
    #[arg(short, long)]
    port: Option<u16>,

    /// Backend origin, repeatable (e.g. http://localhost:9000).
    #[arg(short, long = "backend")]
    backends: Vec<Url>,

    /// Pooled connections per backend.
    #[arg(short = 'n', long)]
    conns: Option<usize>,

    /// TLS certificate chain in PEM format. Requires --privkey.
    #[arg(long, requires = "privkey")]
    cacert: Option<PathBuf>,

    /// TLS private key in PEM format. Requires --cacert.
    #[arg(long, requires = "cacert")]
    privkey: Option<PathBuf>,

    /// Enable the GET response cache.
    #[arg(long)]
    cache: bool,

    /// Retry budget per request.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Control socket path for runtime backend updates.
    #[arg(long)]
    control_socket: Option<PathBuf>,

    /// Port the metrics listener binds.
    #[arg(long)]
    metrics_port: Option<u16>,

    /// TOML configuration file. Flags override its values.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
}

impl Cli {
    /// Resolve flags and the optional config file into a [`Config`].
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed, or if
    /// the resolved settings fail validation.
    pub fn into_config(self) -> Result<Config> {
        let file = match &self.config {
            Some(path) => FileConfig::load_from(path)?,
            None => FileConfig::default(),
        };

        let tls = match (
            self.cacert.or(file.server.cacert),
            self.privkey.or(file.server.privkey),
        ) {
            (Some(cert), Some(key)) => Some(TlsConfig { cert, key }),
            (None, None) => None,
            _ => bail!("TLS requires both a certificate and a private key"),
        };

        let backends = if self.backends.is_empty() {
            file.backends.hosts
        } else {
            self.backends
        };

        let config = Config {
            port: self.port.or(file.server.port).unwrap_or(DEFAULT_PORT),
            backends,
            conns_per_backend: self
                .conns
                .or(file.backends.num_conns)
                .unwrap_or(DEFAULT_CONNS_PER_BACKEND),
            tls,
            cache_enabled: self.cache || file.cache.enabled,
            max_retries: self
                .max_retries
                .or(file.proxy.max_retries)
                .unwrap_or(DEFAULT_MAX_RETRIES),
            control_socket: self
                .control_socket
                .or(file.control.socket)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
            metrics_port: self
                .metrics_port
                .or(file.metrics.port)
                .unwrap_or(DEFAULT_METRICS_PORT),
            queue_wait: DEFAULT_QUEUE_WAIT,
            health: HealthCheckConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Resolved configuration consumed by the pool and the listeners.
#[derive(Debug, Clone)]
pub struct Config {
    /// Public listen port.
    pub port: u16,
    /// Initial backend origins.
    pub backends: Vec<Url>,
    /// Pooled connections per backend.
    pub conns_per_backend: usize,
    /// Optional TLS material for the public listener.
    pub tls: Option<TlsConfig>,
    /// Whether GET responses are cached by path.
    pub cache_enabled: bool,
    /// Retry budget per request.
    pub max_retries: u32,
    /// Control socket path.
    pub control_socket: PathBuf,
    /// Metrics listen port.
    pub metrics_port: u16,
    /// Time a request waits for a backend handle before 504.
    pub queue_wait: Duration,
    /// Health-check loop settings.
    pub health: HealthCheckConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            backends: Vec::new(),
            conns_per_backend: DEFAULT_CONNS_PER_BACKEND,
            tls: None,
            cache_enabled: false,
            max_retries: DEFAULT_MAX_RETRIES,
            control_socket: PathBuf::from(DEFAULT_SOCKET_PATH),
            metrics_port: DEFAULT_METRICS_PORT,
            queue_wait: DEFAULT_QUEUE_WAIT,
            health: HealthCheckConfig::default(),
        }
    }
}

impl Config {
    /// Validate resolved settings.
    ///
    /// # Errors
    ///
    /// Returns an error if any setting is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.conns_per_backend == 0 {
            bail!("conns per backend must be at least 1");
        }
        for url in &self.backends {
            if url.cannot_be_a_base() || url.host_str().is_none() {
                bail!("backend url '{url}' must be an absolute origin");
            }
        }
        Ok(())
    }
}

/// TLS material for the public listener.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub cert: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
}

/// Settings for the per-backend health-check loops.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Cadence of the probe loop.
    pub interval: Duration,
    /// Per-attempt probe timeout.
    pub probe_timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// TOML file shape. Every section is optional.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    backends: FileBackends,
    #[serde(default)]
    cache: FileCache,
    #[serde(default)]
    proxy: FileProxy,
    #[serde(default)]
    control: FileControl,
    #[serde(default)]
    metrics: FileMetrics,
}

#[derive(Debug, Default, Deserialize)]
struct FileServer {
    port: Option<u16>,
    cacert: Option<PathBuf>,
    privkey: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileBackends {
    #[serde(default)]
    hosts: Vec<Url>,
    num_conns: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct FileCache {
    #[serde(default)]
    enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
struct FileProxy {
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct FileControl {
    socket: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileMetrics {
    port: Option<u16>,
}

impl FileConfig {
    /// Load configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains invalid TOML.
    fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }
}
