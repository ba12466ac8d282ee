//! Observability setup shared by the three service binaries: a tracing
//! subscriber with environment filtering and a Prometheus metrics
//! recorder with an HTTP server exposing `/metrics`, `/live` and
//! `/ready`. In tests the recorder handle is cached because the global
//! recorder can only be installed once per process.
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
#[cfg(test)]
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(test)]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initializes tracing and metrics for a service.
///
/// Log filtering comes from `RUST_LOG` with an `info` default. Returns
/// the `PrometheusHandle` to pass to [`serve_metrics`].
pub fn init_observability(service_name: &str) -> PrometheusHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);
    init_subscriber(registry);
    tracing::debug!(service = service_name, "observability initialized");
    install_metrics_recorder()
}

/// Serves Prometheus metrics and health endpoints on `addr`.
pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route("/ready", axum::routing::get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await
}

fn install_metrics_recorder() -> PrometheusHandle {
    #[cfg(test)]
    {
        // Return the cached handle if a test already installed one.
        if let Some(handle) = METRICS_HANDLE.get() {
            return handle.clone();
        }
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("install metrics recorder");
        let _ = METRICS_HANDLE.set(handle.clone());
        handle
    }
    #[cfg(not(test))]
    {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install metrics recorder")
    }
}

fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    // try_init so embedding a role in-process (or in tests) cannot panic
    // on a second initialization.
    let _ = subscriber.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn init_observability_returns_handle() {
        let handle = init_observability("test-service");
        let _ = handle.render();
    }

    #[test]
    #[serial]
    fn metrics_recorder_install_is_idempotent_in_tests() {
        let first = install_metrics_recorder();
        let second = install_metrics_recorder();
        let _ = first.render();
        let _ = second.render();
    }
}
