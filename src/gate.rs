//! Per-target request handling
//!
//! A [`ForwardingGate`] either forwards a request to its dev server or, while
//! the dev server is not known to be up, kicks off a launch and answers with
//! a page that refreshes itself until the dev server takes over.

use crate::config::DevServerTarget;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::forwarder::{full, Forwarder, HostHeaderTransform, ProxyBody};
use crate::router::strip_segment_prefix;
use crate::supervisor::SupervisorRegistry;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, EXPIRES, PRAGMA};
use hyper::{Request, Response, StatusCode, Uri};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const LAUNCH_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta http-equiv="refresh" content="3" />
  <title>SPA proxy launch page</title>
</head>
<body>
  <h1>Launching the SPA client...</h1>
  <p>This page will automatically redirect to the SPA client when it is ready.</p>
</body>
</html>
"#;

/// The self-refreshing placeholder served while a dev server starts
pub fn launch_page_response() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CACHE_CONTROL, "no-cache, no-store, must-revalidate, max-age=0")
        .header(PRAGMA, "no-cache")
        .header(EXPIRES, "0")
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full(LAUNCH_PAGE))
        .expect("valid response with static headers")
}

pub struct ForwardingGate {
    target: Arc<DevServerTarget>,
    registry: Arc<SupervisorRegistry>,
    forwarder: Arc<dyn Forwarder>,
}

impl ForwardingGate {
    /// Create a gate for `target`, sharing the registry and forwarder with other gates
    pub fn new(
        target: Arc<DevServerTarget>,
        registry: Arc<SupervisorRegistry>,
        forwarder: Arc<dyn Forwarder>,
    ) -> Self {
        Self {
            target,
            registry,
            forwarder,
        }
    }

    /// Get the target this gate serves
    pub fn target(&self) -> &DevServerTarget {
        &self.target
    }

    /// Forward the request, or serve the launch page while the dev server starts
    pub async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let supervisor = self.registry.supervisor_for(&self.target);

        if supervisor.currently_reachable() {
            return self.forward(req).await;
        }

        if supervisor.ensure_launching() {
            debug!(dev_server = %self.target.name, "Started dev server launch");
        }
        info!(
            dev_server = %self.target.name,
            path = %req.uri().path(),
            "Dev server is not ready yet, serving launch page"
        );
        launch_page_response()
    }

    async fn forward(&self, mut req: Request<ProxyBody>) -> Response<ProxyBody> {
        if !self.target.preserve_matched_path_segment {
            if let Some(prefix) = &self.target.public_path {
                if let Some(stripped) = strip_public_path(req.uri(), prefix) {
                    *req.uri_mut() = stripped;
                }
            }
        }

        let destination = self.target.client_url.as_str();
        let forwarding = self.forwarder.forward(req, destination, &HostHeaderTransform);

        match tokio::time::timeout(self.target.forward_timeout, forwarding).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(dev_server = %self.target.name, destination, error = %e, "Failed to forward request to dev server");
                json_error_response(
                    ProxyErrorCode::from(&e),
                    format!("Failed to forward request to the dev server: {}", e),
                )
            }
            Err(_) => {
                warn!(
                    dev_server = %self.target.name,
                    destination,
                    timeout_secs = self.target.forward_timeout.as_secs(),
                    "Dev server did not respond in time"
                );
                json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!(
                        "Dev server did not respond within {} seconds",
                        self.target.forward_timeout.as_secs()
                    ),
                )
            }
        }
    }
}

/// Origin-form URI with the public path removed, or `None` when the path
/// is not under it
fn strip_public_path(uri: &Uri, prefix: &str) -> Option<Uri> {
    let rest = strip_segment_prefix(uri.path(), prefix)?;
    let path = if rest.is_empty() { "/" } else { rest };
    let target = match uri.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    };
    target.parse().ok()
}
