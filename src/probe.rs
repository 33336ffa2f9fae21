//! Liveness probing of dev servers

use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::redirect::Policy;
use std::error::Error as _;
use std::time::Duration;
use tracing::{debug, error};

/// Upper bound for a single probe request
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    Unreachable,
}

/// Decides whether a dev server answers at a URL. Never fails: every
/// problem is reported as [`ProbeOutcome::Unreachable`].
pub trait LivenessProbe: Send + Sync {
    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ProbeOutcome>;
}

/// Probes with a plain `GET`. Only a 2xx status counts as reachable.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// Create a probe with the standard timeout
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeout(PROBE_TIMEOUT)
    }

    /// Create a probe whose requests give up after `timeout`
    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*;q=0.1"));

        // Dev servers use self-signed certificates and must be reached directly
        let client = reqwest::Client::builder()
            .no_proxy()
            .danger_accept_invalid_certs(true)
            .redirect(Policy::none())
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self { client })
    }

    async fn check(&self, url: &str) -> ProbeOutcome {
        match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => ProbeOutcome::Reachable,
            Ok(response) => {
                debug!(url, status = %response.status(), "Dev server answered probe with non-success status");
                ProbeOutcome::Unreachable
            }
            Err(e) if is_expected_failure(&e) => {
                debug!(url, error = %e, "Dev server not reachable yet");
                ProbeOutcome::Unreachable
            }
            Err(e) => {
                error!(url, error = %e, "Unexpected error while probing dev server");
                ProbeOutcome::Unreachable
            }
        }
    }
}

impl LivenessProbe for HttpProbe {
    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, ProbeOutcome> {
        Box::pin(self.check(url))
    }
}

/// Timeouts, refused connections and dropped exchanges are what a starting
/// dev server produces. Name resolution failures and malformed URLs are not.
fn is_expected_failure(err: &reqwest::Error) -> bool {
    if err.is_builder() || is_dns_failure(err) {
        return false;
    }
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// hyper's connector reports resolver failures as a `ConnectError` whose
/// message is "dns error"; the wrapped cause carries no usable error kind.
fn is_dns_failure(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(e) = source {
        if e.to_string().contains("dns error") {
            return true;
        }
        source = e.source();
    }
    false
}
