// src/main.rs
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use http_load_balancer::{
    config,
    lifecycle::shutdown_signal,
    metrics::MetricsRegistry,
    server::{start_admin_server, AdminState, RequestHandler, ServerBuilder},
    Balancer,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("http_load_balancer=debug,hyper=info")
            }),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = config::load_config(&config_path).await?;

    // Initialize metrics
    let metrics_registry = Arc::new(MetricsRegistry::new()?);

    // Build the balancing engine and start probing
    let balancer = Arc::new(Balancer::new(&config, metrics_registry.collector())?);
    balancer.start_health_checks(config.health_check.interval())?;

    // Broadcast the OS signal to the proxy listener, the admin server and
    // the drain below.
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    if config.metrics.enabled {
        let admin_addr: SocketAddr = format!("{}:{}", config.listen.host, config.metrics.port).parse()?;
        let state = AdminState {
            balancer: balancer.clone(),
            metrics: metrics_registry.clone(),
            metrics_path: Arc::from(config.metrics.path.as_str()),
        };
        start_admin_server(admin_addr, state, stopped(stop_rx.clone()))?;
    }

    let addr: SocketAddr = format!("{}:{}", config.listen.host, config.listen.port).parse()?;
    info!("Starting load balancer on {}", addr);

    let server = ServerBuilder::new(addr)
        .with_handler(RequestHandler::new(balancer.clone()))
        .serve_with_shutdown(stopped(stop_rx.clone()));

    // Admission stops as soon as the signal arrives; the listener keeps
    // serving 503s on open connections until they close.
    let drain = async {
        stopped(stop_rx).await;
        balancer.shutdown().await;
        Ok::<_, anyhow::Error>(())
    };

    tokio::try_join!(server, drain)?;

    info!("Shutdown complete");
    Ok(())
}

/// Resolves once the stop flag is raised (or its sender is gone).
async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}
