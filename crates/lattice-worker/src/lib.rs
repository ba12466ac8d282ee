// Business-worker side of the system: discover gateways through the
// register, hold one event link per gateway, and hand decoded client
// events to application code together with a handle for pushing
// control commands back to the originating gateway.
use lattice_wire::Session;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod client;
pub mod gateway;
pub mod link;

pub use crate::client::GatewayClient;
pub use crate::gateway::GatewayHandle;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("worker io error")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Link(#[from] lattice_common::Error),
    #[error("gateway closed the connection during handshake")]
    HandshakeRejected,
    #[error("unexpected reply frame (cmd {0})")]
    UnexpectedReply(u16),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Secret presented to the register.
    pub register_secret_key: String,
    /// Secret presented to each gateway's internal listener.
    pub gateway_secret_key: String,
    /// Register endpoint for gateway discovery.
    pub register_address: String,
    /// Keepalive interval towards the register.
    pub ping_interval: Duration,
    /// Redial backoff for the register link.
    pub reconnect_delay: Duration,
    /// Frame size cap on internal connections.
    pub max_frame_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            register_secret_key: String::new(),
            gateway_secret_key: String::new(),
            register_address: "127.0.0.1:1236".to_string(),
            ping_interval: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(3),
            max_frame_bytes: lattice_wire::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// One client lifecycle event, tagged with the gateway link it arrived
/// on so control commands can be pushed back to the right place.
#[derive(Debug, Clone)]
pub struct Event {
    pub gateway: GatewayHandle,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Connect {
        fd: u64,
        ext_data: Session,
    },
    Message {
        fd: u64,
        payload: Vec<u8>,
        ext_data: Session,
    },
    WebsocketConnect {
        fd: u64,
        payload: Vec<u8>,
        ext_data: Session,
    },
    Close {
        fd: u64,
        ext_data: Session,
    },
}

/// Live set of gateway links, keyed by advertised address. Addresses in
/// the set are either dialing or connected; reconciliation skips them.
#[derive(Default)]
pub struct Links {
    inner: Mutex<HashMap<String, Option<GatewayHandle>>>,
}

impl Links {
    /// Addresses not yet held by any link task. Claims them so a repeat
    /// broadcast does not double-dial.
    pub(crate) fn missing(&self, addresses: &[String]) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut fresh = Vec::new();
        for address in addresses {
            if !inner.contains_key(address) {
                inner.insert(address.clone(), None);
                fresh.push(address.clone());
            }
        }
        fresh
    }

    pub(crate) fn attach(&self, address: &str, handle: GatewayHandle) {
        self.inner.lock().insert(address.to_string(), Some(handle));
        self.publish_gauge();
    }

    pub(crate) fn detach(&self, address: &str) {
        self.inner.lock().remove(address);
        self.publish_gauge();
    }

    /// Handles for every currently connected gateway.
    pub fn gateways(&self) -> Vec<GatewayHandle> {
        self.inner.lock().values().flatten().cloned().collect()
    }

    fn publish_gauge(&self) {
        let connected = self.inner.lock().values().flatten().count();
        metrics::gauge!("lattice_worker_gateways").set(connected as f64);
    }
}

/// Runs the worker forever: a supervised register link that feeds
/// address broadcasts into gateway link tasks. Events from every
/// gateway arrive on the single `events` channel; the channel's
/// capacity is the worker's backpressure bound.
pub async fn run(config: WorkerConfig, links: Arc<Links>, events: mpsc::Sender<Event>) {
    link::run_register_link(config, links, events).await;
}
