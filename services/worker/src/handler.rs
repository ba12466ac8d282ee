// Built-in echo application: greet on connect, echo messages back to
// the sender, log closes. Real deployments replace this module with
// their own event handling.
use lattice_worker::{Event, EventKind};

pub async fn handle(event: Event) {
    match event.kind {
        EventKind::Connect { fd, .. } => {
            tracing::info!(fd, gateway = %event.gateway.address(), "client connected");
            let _ = event.gateway.send_to_one(fd, greeting(fd)).await;
        }
        EventKind::Message { fd, payload, .. } => {
            let _ = event.gateway.send_to_one(fd, echo(&payload)).await;
        }
        EventKind::WebsocketConnect { fd, .. } => {
            tracing::debug!(fd, "websocket handshake");
        }
        EventKind::Close { fd, .. } => {
            tracing::info!(fd, gateway = %event.gateway.address(), "client closed");
        }
    }
}

fn greeting(fd: u64) -> Vec<u8> {
    format!("hello {fd}").into_bytes()
}

fn echo(payload: &[u8]) -> Vec<u8> {
    payload.to_vec()
}
