use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{error, info};
use transport_bus::{Bus, BusInbox, LocalBus, RedisBus};

use crate::config::{BrokerTarget, Cli, ServerConfig};
use crate::websocket::{router, AppState};

mod bridge;
mod config;
mod connection;
mod heartbeat;
mod protocol;
mod registry;
mod session;
mod telemetry;
mod websocket;

#[cfg(test)]
mod tests;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        broker = %config.broker.redacted(),
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        "starting beach-boardwalk"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    match &config.broker {
        BrokerTarget::Redis(url) => {
            let (bus, inbox) = RedisBus::connect(url)
                .await
                .context("failed to connect to redis")?;
            serve(config, Arc::new(bus), inbox, metrics).await
        }
        BrokerTarget::Memory => {
            info!("using in-process bus; rooms will not span instances");
            let (bus, inbox) = LocalBus::new().connect();
            serve(config, Arc::new(bus), inbox, metrics).await
        }
    }
}

async fn serve<B: Bus + 'static>(
    config: ServerConfig,
    bus: Arc<B>,
    inbox: BusInbox,
    metrics: PrometheusHandle,
) -> Result<()> {
    let state = Arc::new(AppState::new(bus, config.outbound_buffer, Some(metrics)));

    let mut inbound = tokio::spawn(Arc::clone(&state.bridge).run_inbound(inbox));
    let heartbeat = state.heartbeat.spawn(config.heartbeat_interval);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-boardwalk listening on {}", config.listen_addr);

    let app = router(Arc::clone(&state));
    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    };

    let outcome = tokio::select! {
        result = server => result.context("server shutdown with error"),
        _ = &mut inbound => {
            error!("broker subscription stream ended; shutting down");
            Err(anyhow::anyhow!("broker subscription stream ended"))
        }
    };

    heartbeat.abort();
    inbound.abort();
    outcome?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

