#![forbid(unsafe_code)]

use envlease_adapter::{build_router, AdapterConfig};
use envlease_contracts::saturating_millis;
use envlease_os::LeaseService;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,envlease_os=info,envlease_adapter=info")
        }))
        .init();

    let config = AdapterConfig::from_env()?;
    let service = LeaseService::start(config.service, config.build_ports()?)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = service.heartbeat_monitor().spawn(shutdown_rx);
    let app = build_router(service);

    tracing::info!(
        addr = %config.bind,
        reset_mode = config.reset_mode_label(),
        readiness_mode = config.readiness_mode_label(),
        heartbeat_timeout_ms = saturating_millis(config.service.heartbeat_timeout),
        monitor_interval_ms = saturating_millis(config.service.monitor_interval),
        "envlease_http listening"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    monitor.await?;
    tracing::info!("envlease_http stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
