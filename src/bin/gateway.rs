use anyhow::{Context, Result};
use rpcproxy::{ProxyRouter, ProxyService};
use rpcproxy_gateway::{GatewayConfig, GatewayDirector};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::from_env()?;
    let director = GatewayDirector::from_config(&config)?;
    let proxy = ProxyService::new(director);
    let routes = ProxyRouter::new(proxy.clone()).transparent().into_routes();

    info!(
        addr = %config.listen_addr,
        backends = config.backends.len(),
        default_backend = ?config.default_backend,
        "Gateway listening"
    );

    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        info!("Shutting down");
        proxy.shutdown();
    };

    tonic::transport::Server::builder()
        .add_routes(routes)
        .serve_with_shutdown(config.listen_addr, shutdown)
        .await
        .context("gateway server failed")?;

    Ok(())
}
