//! Spagate - a development reverse proxy for single-page applications
//!
//! This library provides a proxy that sits in front of one or more SPA
//! development servers and:
//! - Routes requests to a dev server by public path prefix
//! - Launches the dev server on the first request when nothing answers yet
//! - Serves a self-refreshing launch page until the dev server is reachable
//! - Forwards HTTP and WebSocket traffic once it is, over HTTP or HTTPS
//! - Stops launched dev servers on shutdown, with a watchdog for abrupt exits

pub mod config;
pub mod error;
pub mod forwarder;
pub mod gate;
pub mod pool;
pub mod probe;
pub mod process;
pub mod proxy;
pub mod router;
pub mod supervisor;
pub mod tls;
pub mod watchdog;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
