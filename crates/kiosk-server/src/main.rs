//! Kiosk server entry point.
//!
//! Connects to Docker, sweeps whatever a previous run left behind, then
//! serves the HTTP API until SIGINT or SIGTERM. On shutdown every instance
//! is torn down before the process exits.

use kiosk_backend::{CloudflaredTunnel, DirectTunnel, DockerBackend};
use kiosk_core::{
    ContainerBackend, Orchestrator, RetryPolicy, RetryingContainerBackend, TunnelBackend,
};
use kiosk_server::{http, KioskConfig, TunnelMode};
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("kiosk_server=info".parse()?)
                .add_directive("kiosk_core=info".parse()?)
                .add_directive("kiosk_backend=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting Kiosk server");

    // Load configuration from environment
    let config = KioskConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    // Warn-only checks; hard limits are validated by the orchestrator
    config.validate_warn();

    let docker = DockerBackend::connect(config.docker_config())?;
    if let Err(e) = docker.ping().await {
        tracing::warn!(error = %e, "Docker daemon not answering yet");
    }
    let containers: Arc<dyn ContainerBackend> =
        Arc::new(RetryingContainerBackend::new(docker, RetryPolicy::default()));

    let tunnels: Arc<dyn TunnelBackend> = match config.tunnel_mode {
        TunnelMode::Cloudflared => Arc::new(CloudflaredTunnel::new(config.cloudflared_config())?),
        TunnelMode::Direct => Arc::new(DirectTunnel::new(config.public_host.clone())),
    };

    let orchestrator = Orchestrator::new(config.orchestrator_config()?, containers, tunnels)?;

    // Leftovers of a previous run go before the first request comes in
    let report = orchestrator.start().await;
    tracing::info!(
        sandboxes = report.sandboxes,
        tunnels = report.tunnels,
        http_addr = %config.http_addr,
        tunnel_mode = ?config.tunnel_mode,
        "Server ready"
    );

    if let Err(e) = http::serve(orchestrator.clone(), config.http_addr, shutdown_signal()).await {
        tracing::error!(error = %e, "HTTP server error");
    }

    tracing::info!("Received shutdown signal, cleaning up...");
    orchestrator.shutdown().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
