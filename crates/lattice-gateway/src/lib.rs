// Edge process: terminates client connections, routes their lifecycle
// events to a pool of attached workers, and executes worker-issued
// control commands (send/kick/group/bind) against its local tables.
//
// The engine (`GatewayCore`) is transport-agnostic: client sockets sit
// behind the `ClientSink` seam and worker connections behind mpsc
// senders, so every table mutation and routing decision is testable
// without a network.
use std::time::Duration;

pub mod core;
pub mod link;
pub mod router;
pub mod server;

pub use crate::core::{ClientSink, GatewayCore};
pub use crate::router::{RoundRobinRouter, WorkerRouter};

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("gateway io error")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Secret expected from workers on the internal listener.
    pub secret_key: String,
    /// Secret presented to the register on the discovery link.
    pub register_secret_key: String,
    /// Register endpoint for address registration.
    pub register_address: String,
    /// Internal address advertised to the register; must be reachable by
    /// workers (a non-loopback lan address in distributed deployments).
    pub lan_address: String,
    /// Client heartbeat sweep interval.
    pub heartbeat_interval: Duration,
    /// Missed heartbeat cycles tolerated before a client is destroyed.
    pub response_limit: u32,
    /// Grace window for the worker handshake on the internal listener.
    pub auth_timeout: Duration,
    /// Keepalive interval towards attached workers and the register.
    pub ping_interval: Duration,
    /// Reconnect backoff for the register link.
    pub reconnect_delay: Duration,
    /// Window after startup during which unroutable client events are
    /// logged quietly (worker links have not had time to form yet).
    pub startup_grace: Duration,
    /// Frame size cap on internal connections.
    pub max_frame_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            register_secret_key: String::new(),
            register_address: "127.0.0.1:1236".to_string(),
            lan_address: "127.0.0.1:2300".to_string(),
            heartbeat_interval: Duration::from_secs(25),
            response_limit: 2,
            auth_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(3),
            startup_grace: Duration::from_secs(2),
            max_frame_bytes: lattice_wire::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}
