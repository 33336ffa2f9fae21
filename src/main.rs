use spagate::config::{Config, DevServerTarget};
use spagate::forwarder::{Forwarder, HttpForwarder};
use spagate::gate::ForwardingGate;
use spagate::pool::PoolConfig;
use spagate::probe::HttpProbe;
use spagate::process::ProcessLauncher;
use spagate::proxy::ProxyServer;
use spagate::router::TargetRouter;
use spagate::supervisor::SupervisorRegistry;
use spagate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("spagate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("spagate.toml"));

    let config = Config::load_optional(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    let config = match config {
        Some(config) => {
            info!(path = %config_path.display(), "Configuration loaded");
            config
        }
        None => {
            warn!(
                path = %config_path.display(),
                "No configuration found, no dev servers will be launched"
            );
            Config::default()
        }
    };

    let targets = config.resolved_targets();
    print_startup_banner(&config, &targets);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let http_forwarder = Arc::new(
        HttpForwarder::new(pool_config)
            .map_err(|e| anyhow::anyhow!("TLS client configuration error: {}", e))?,
    );
    let forwarder: Arc<dyn Forwarder> = http_forwarder.clone();

    let registry = SupervisorRegistry::new(
        Arc::new(ProcessLauncher::for_current_platform()),
        Arc::new(HttpProbe::new()?),
        shutdown_rx.clone(),
    );

    let gates = targets.into_iter().map(|target| {
        Arc::new(ForwardingGate::new(
            Arc::new(target),
            Arc::clone(&registry),
            Arc::clone(&forwarder),
        ))
    });
    let router = Arc::new(TargetRouter::new(gates));

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;

    let server = ProxyServer::new(bind_addr, router, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    info!("Stopping dev servers...");
    registry.shutdown_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    let stats = http_forwarder.pool().stats();
    info!(
        forwarded = stats.get_total_requests(),
        forwarded_tls = stats.get_tls_requests(),
        "Forwarding statistics"
    );

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config, targets: &[DevServerTarget]) {
    info!(name = PKG_NAME, version = VERSION, "Starting SPA dev proxy");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        max_timeout_secs = config.defaults.max_timeout_secs,
        forward_timeout_secs = config.defaults.forward_timeout_secs,
        shutdown_grace_period_secs = config.defaults.shutdown_grace_period_secs,
        "Target defaults"
    );
    for target in targets {
        info!(
            dev_server = %target.name,
            client_url = %target.client_url,
            public_path = target.public_path.as_deref().unwrap_or("/"),
            default = target.is_default(),
            command = %target.launch_command,
            working_dir = %target.working_directory.display(),
            "Configured dev server"
        );
    }
}
