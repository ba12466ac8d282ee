// Worker service entry point: register discovery, gateway links, and
// the event dispatch loop feeding the application handler.
mod config;
mod handler;

use anyhow::Result;
use lattice_worker::Links;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

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
    let metrics_handle = lattice_common::observability::init_observability("lattice-worker");
    let config = config::WorkerServiceConfig::from_env_or_yaml()?;
    tokio::spawn(lattice_common::observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let links = Arc::new(Links::default());
    let (events_tx, mut events_rx) = mpsc::channel(config.event_queue_depth);
    let worker_task = tokio::spawn(lattice_worker::run(
        config.worker_config(),
        Arc::clone(&links),
        events_tx,
    ));
    tracing::info!(register = %config.register_address, "worker started");

    let dispatch_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            handler::handle(event).await;
        }
    });

    shutdown.await;
    dispatch_task.abort();
    worker_task.abort();
    tracing::info!("worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_exits_cleanly() {
        std::env::set_var("LATTICE_WORKER_METRICS_BIND", "127.0.0.1:0");
        // Point at a closed port; the supervised link just retries.
        std::env::set_var("LATTICE_REGISTER_ADDRESS", "127.0.0.1:1");
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_with_shutdown(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }),
        )
        .await
        .expect("shutdown in time");
        assert!(result.is_ok());
        std::env::remove_var("LATTICE_WORKER_METRICS_BIND");
        std::env::remove_var("LATTICE_REGISTER_ADDRESS");
    }
}
