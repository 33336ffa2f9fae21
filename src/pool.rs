//! Connections towards dev servers
//!
//! Plain `http` destinations share a pooled client. `https` destinations get
//! a fresh TLS connection per request, since dev servers use throwaway
//! certificates and are only ever reached over loopback.

use crate::forwarder::{ForwardError, ProxyBody};
use crate::tls::dev_server_client_config;
use http::uri::{Authority, Scheme};
use http_body_util::BodyExt;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub tls_requests: AtomicU64,
}

impl PoolStats {
    /// Count one outbound request
    pub fn record_request(&self, tls: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if tls {
            self.tls_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get total requests sent
    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Get requests sent to `https` destinations
    pub fn get_tls_requests(&self) -> u64 {
        self.tls_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Outbound connections to dev servers
pub struct ConnectionPool {
    client: Client<HttpConnector, ProxyBody>,
    tls: TlsConnector,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool
    pub fn new(config: PoolConfig) -> Result<Self, rustls::Error> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        let tls = TlsConnector::from(Arc::new(dev_server_client_config()?));

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Ok(Self {
            client,
            tls,
            stats: Arc::new(PoolStats::default()),
            config,
        })
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request whose URI is already absolute. Upgrades stay possible
    /// on both paths.
    pub async fn send(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, ForwardError> {
        let scheme = req.uri().scheme().cloned();
        let authority = req
            .uri()
            .authority()
            .cloned()
            .ok_or_else(|| ForwardError::InvalidDestination(req.uri().to_string()))?;

        let tls = scheme.as_ref() == Some(&Scheme::HTTPS);
        self.stats.record_request(tls);

        if tls {
            return self.send_tls(req, &authority).await;
        }

        let response = self.client.request(req).await?;
        Ok(response.map(|body| body.boxed()))
    }

    async fn send_tls(
        &self,
        req: Request<ProxyBody>,
        authority: &Authority,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let host = authority.host().trim_start_matches('[').trim_end_matches(']');
        let port = authority.port_u16().unwrap_or(443);

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ForwardError::InvalidDestination(authority.to_string()))?;

        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;
        let stream = self.tls.connect(server_name, tcp).await?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(error = %e, "TLS connection to dev server closed with error");
            }
        });

        // Over a dedicated connection the request line carries the origin form
        let (mut parts, body) = req.into_parts();
        let origin = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = origin.parse::<Uri>()?;

        let response = sender.send_request(Request::from_parts(parts, body)).await?;
        Ok(response.map(|body| body.boxed()))
    }
}
