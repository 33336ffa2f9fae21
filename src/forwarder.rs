//! Forwarding requests to a dev server
//!
//! A [`Forwarder`] re-targets an inbound request at a destination base URL,
//! applies a [`RequestTransform`] to it and relays the dev server's response.
//! WebSocket and other HTTP/1.1 upgrades are spliced through once the dev
//! server answers `101 Switching Protocols`.

use crate::pool::{ConnectionPool, PoolConfig};
use futures::future::BoxFuture;
use http::request::Parts;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tracing::{debug, warn};

/// Body type used for every request and response passing through the proxy
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Wrap a complete chunk as a [`ProxyBody`]
pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

/// Errors raised while forwarding a request
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("invalid destination '{0}'")]
    InvalidDestination(String),

    #[error("invalid request URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    #[error("failed to build outbound request: {0}")]
    Request(#[from] http::Error),

    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

/// Rewrites the head of a request before it leaves for the dev server
pub trait RequestTransform: Send + Sync {
    fn transform(&self, parts: &mut Parts);
}

/// Drops the inbound `Host` header so the outbound request names the dev
/// server's own authority
#[derive(Debug, Default, Clone, Copy)]
pub struct HostHeaderTransform;

impl RequestTransform for HostHeaderTransform {
    fn transform(&self, parts: &mut Parts) {
        parts.headers.remove(HOST);
    }
}

/// Sends a request to a destination and returns its response
pub trait Forwarder: Send + Sync {
    fn forward<'a>(
        &'a self,
        req: Request<ProxyBody>,
        destination: &'a str,
        transform: &'a dyn RequestTransform,
    ) -> BoxFuture<'a, Result<Response<ProxyBody>, ForwardError>>;
}

/// [`Forwarder`] backed by the shared [`ConnectionPool`]
pub struct HttpForwarder {
    pool: Arc<ConnectionPool>,
}

impl HttpForwarder {
    /// Create a forwarder with its own connection pool
    pub fn new(config: PoolConfig) -> Result<Self, rustls::Error> {
        Ok(Self {
            pool: Arc::new(ConnectionPool::new(config)?),
        })
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    async fn send(
        &self,
        req: Request<ProxyBody>,
        destination: &str,
        transform: &dyn RequestTransform,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let (mut parts, body) = req.into_parts();
        transform.transform(&mut parts);

        parts.uri = destination_uri(destination, &parts.uri)?;
        parts.version = Version::HTTP_11;

        if !parts.headers.contains_key(HOST) {
            if let Some(authority) = parts.uri.authority() {
                let host = HeaderValue::from_str(authority.as_str()).map_err(http::Error::from)?;
                parts.headers.insert(HOST, host);
            }
        }

        let inbound_upgrade = if is_upgrade_request(&parts.headers) {
            parts.extensions.remove::<OnUpgrade>()
        } else {
            None
        };

        let mut response = self.pool.send(Request::from_parts(parts, body)).await?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            match inbound_upgrade {
                Some(inbound) => {
                    let outbound = hyper::upgrade::on(&mut response);
                    tokio::spawn(splice_upgraded(inbound, outbound, destination.to_string()));
                }
                None => warn!(destination, "Dev server switched protocols without an upgrade request"),
            }
        }

        Ok(response)
    }
}

impl Forwarder for HttpForwarder {
    fn forward<'a>(
        &'a self,
        req: Request<ProxyBody>,
        destination: &'a str,
        transform: &'a dyn RequestTransform,
    ) -> BoxFuture<'a, Result<Response<ProxyBody>, ForwardError>> {
        Box::pin(self.send(req, destination, transform))
    }
}

/// Build the absolute outbound URI: the destination's scheme and authority,
/// its base path, then the inbound path and query.
pub fn destination_uri(destination: &str, inbound: &Uri) -> Result<Uri, ForwardError> {
    let invalid = || ForwardError::InvalidDestination(destination.to_string());

    let base: Uri = destination.parse().map_err(|_| invalid())?;
    let scheme = base.scheme().cloned().ok_or_else(invalid)?;
    let authority = base.authority().cloned().ok_or_else(invalid)?;

    let request_target = inbound
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let base_path = base.path().trim_end_matches('/');
    let path_and_query = format!("{}{}", base_path, request_target);

    Ok(Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()?)
}

/// Check if a request carries `Connection: upgrade` and an `Upgrade` header
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let has_upgrade_connection = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")));

    has_upgrade_connection && headers.contains_key(UPGRADE)
}

/// Copy bytes between the upgraded client and dev server connections
async fn splice_upgraded(inbound: OnUpgrade, outbound: OnUpgrade, destination: String) {
    let (client, server) = match tokio::try_join!(inbound, outbound) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(destination, error = %e, "Failed to complete protocol upgrade");
            return;
        }
    };

    let mut client_io = TokioIo::new(client);
    let mut server_io = TokioIo::new(server);

    match tokio::io::copy_bidirectional(&mut client_io, &mut server_io).await {
        Ok((client_to_server, server_to_client)) => {
            debug!(
                destination,
                client_to_server, server_to_client, "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(destination, error = %e, "Upgraded connection closed with error");
        }
    }
}
