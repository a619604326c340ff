//! HTTP reverse-proxy load balancer.
//!
//! turnstile accepts client HTTP(S) requests on a listen port, selects a
//! backend from a health-checked pool, and forwards the request. Backends
//! can be added and removed at runtime over a Unix-domain control socket,
//! and `GET` response bodies can optionally be cached by request path.
//!
//! # Architecture
//!
//! ```text
//! [client] -> [listener :3000] -> [pool] -> [backend :9000]
//!                                        -> [backend :9001]
//!
//! [updater] -> /tmp/turnstile.sock -> pool.reconfigure
//! ```
//!
//! The interesting machinery lives in [`pool`]: a bounded queue of backend
//! handles doubling as selection structure and admission limiter, one
//! health-check loop per backend URL feeding per-handle mailboxes, and a
//! reconfiguration path that rebinds live handles to new origins without
//! draining them.

pub mod config;
pub mod error;
pub mod pool;
pub mod server;
pub mod stats;

pub use config::{Cli, Config};
pub use error::Error;
pub use pool::{ControlChannel, Pool};
pub use server::Server;
pub use stats::Metrics;
