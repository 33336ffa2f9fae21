use crate::error::{json_error_response, ProxyErrorCode};
use crate::forwarder::ProxyBody;
use crate::router::TargetRouter;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Listener that hands every request to the gate mounted at its path.
///
/// Connections are served as HTTP/1.1 or h2c; HTTP/1.1 connections may be
/// upgraded so dev server hot-reload sockets pass through.
pub struct ProxyServer {
    bind_addr: SocketAddr,
    router: Arc<TargetRouter>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Create a server that will listen on `bind_addr`
    pub fn new(bind_addr: SocketAddr, router: Arc<TargetRouter>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            router,
            shutdown_rx,
        }
    }

    /// Bind the listener and serve until shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        if self.router.is_empty() {
            warn!(addr = %addr, "No dev server targets configured, every request will get a 404");
        }
        info!(addr = %addr, "SPA proxy listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            tokio::spawn(serve_client(stream, peer, Arc::clone(&self.router)));
                        }
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("SPA proxy no longer accepting connections");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_client<S>(stream: S, peer: SocketAddr, router: Arc<TargetRouter>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { handle_request(req, router, peer).await }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);

    if let Err(e) = builder
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        debug!(client = %peer, error = %e, "Client connection ended with error");
    }
}

async fn handle_request(
    req: Request<Incoming>,
    router: Arc<TargetRouter>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    debug!(
        client = %client_addr,
        method = %req.method(),
        uri = %req.uri(),
        "Incoming request"
    );

    let Some(gate) = router.route(req.uri().path()).cloned() else {
        debug!(path = %req.uri().path(), "No dev server mounted for path");
        return Ok(json_error_response(
            ProxyErrorCode::UnknownTarget,
            format!("No dev server is mounted at '{}'", req.uri().path()),
        ));
    };

    Ok(gate.handle(req.map(|body| body.boxed())).await)
}
