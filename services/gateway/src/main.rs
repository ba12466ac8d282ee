// Gateway service entry point: client edge listener, worker-facing
// internal listener, and the discovery link to the register.
mod config;
mod edge;

use anyhow::{Context, Result};
use lattice_gateway::{GatewayCore, RoundRobinRouter};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = lattice_common::observability::init_observability("lattice-gateway");
    let config = config::GatewayServiceConfig::from_env_or_yaml()?;
    tokio::spawn(lattice_common::observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let core_config = config.core_config();
    let core = Arc::new(GatewayCore::new(
        &core_config,
        Box::new(RoundRobinRouter::default()),
    ));

    let internal_listener = TcpListener::bind(config.internal_bind)
        .await
        .context("bind internal listener")?;
    tracing::info!(addr = %internal_listener.local_addr()?, "internal listener started");
    let internal_task = {
        let core = Arc::clone(&core);
        let core_config = core_config.clone();
        tokio::spawn(async move {
            if let Err(err) = lattice_gateway::server::serve(internal_listener, core, core_config).await {
                tracing::warn!(error = %err, "internal accept loop exited");
            }
        })
    };

    let link_task = tokio::spawn(lattice_gateway::link::run_register_link(
        core_config.clone(),
    ));

    let client_listener = TcpListener::bind(config.client_bind)
        .await
        .context("bind client listener")?;
    tracing::info!(addr = %client_listener.local_addr()?, "client listener started");
    let edge_task = {
        let core = Arc::clone(&core);
        let max_frame_bytes = config.max_frame_bytes;
        tokio::spawn(async move {
            if let Err(err) = edge::serve(client_listener, core, max_frame_bytes).await {
                tracing::warn!(error = %err, "client accept loop exited");
            }
        })
    };

    shutdown.await;
    edge_task.abort();
    link_task.abort();
    internal_task.abort();
    tracing::info!("gateway stopped");
    Ok(())
}
