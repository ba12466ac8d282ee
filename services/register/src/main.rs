// Register service entry point.
mod config;

use anyhow::{Context, Result};
use lattice_register::RegisterConfig;
use std::future::Future;
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
    let metrics_handle = lattice_common::observability::init_observability("lattice-register");
    let config = config::RegisterServiceConfig::from_env_or_yaml()?;
    tokio::spawn(lattice_common::observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let listener = TcpListener::bind(config.bind)
        .await
        .context("bind register listener")?;
    tracing::info!(addr = %listener.local_addr()?, "register listening");

    let serve_task = tokio::spawn(lattice_register::serve(
        listener,
        RegisterConfig {
            secret_key: config.secret_key,
            auth_timeout: config.auth_timeout,
            max_frame_bytes: config.max_frame_bytes,
        },
    ));

    shutdown.await;
    serve_task.abort();
    tracing::info!("register stopped");
    Ok(())
}
