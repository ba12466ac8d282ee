// Service-discovery rendezvous: gateways and workers authenticate with a
// shared secret, and the live set of gateway internal addresses is
// broadcast to every authenticated worker whenever it changes.
//
// The membership bookkeeping is a plain state machine (`Registry`) that
// emits explicit effects, so the auth-timeout race and broadcast
// deduplication are testable without sockets. The TCP loop in `serve`
// applies those effects.
use lattice_wire::{BroadcastAddresses, Command};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub type Result<T> = std::result::Result<T, RegisterError>;

#[derive(thiserror::Error, Debug)]
pub enum RegisterError {
    #[error("register io error")]
    Io(#[from] std::io::Error),
}

/// Opaque identifier of one inbound connection within this process.
pub type ConnId = u64;

const WRITER_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct RegisterConfig {
    /// Shared secret compared byte-for-byte against handshake commands.
    pub secret_key: String,
    /// Grace window for the first valid handshake command.
    pub auth_timeout: Duration,
    /// Frame size cap on inbound connections.
    pub max_frame_bytes: usize,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            auth_timeout: Duration::from_secs(10),
            max_frame_bytes: lattice_wire::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Peer {
    Pending,
    Worker,
    Gateway { address: String },
}

/// Action requested by the state machine. `Send` targets may be any
/// authenticated worker; `CloseSelf` always refers to the connection
/// whose event produced the effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send { to: ConnId, command: Command },
    CloseSelf,
}

/// Membership map: the only global state in the system. Mutations are
/// serialized by the caller (one lock around the whole registry).
#[derive(Debug)]
pub struct Registry {
    secret_key: String,
    conns: HashMap<ConnId, Peer>,
}

impl Registry {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            conns: HashMap::new(),
        }
    }

    pub fn on_connect(&mut self, id: ConnId) {
        self.conns.insert(id, Peer::Pending);
    }

    /// Called when the auth grace window elapses. Re-checks existence and
    /// state at fire time: closing an already-authenticated connection
    /// would be a bug, not a race to tolerate.
    pub fn auth_deadline_elapsed(&self, id: ConnId) -> Option<Effect> {
        match self.conns.get(&id) {
            Some(Peer::Pending) => Some(Effect::CloseSelf),
            _ => None,
        }
    }

    pub fn is_pending(&self, id: ConnId) -> bool {
        matches!(self.conns.get(&id), Some(Peer::Pending))
    }

    pub fn on_command(&mut self, id: ConnId, command: Command) -> Vec<Effect> {
        match command {
            Command::GatewayConnect(body) => {
                if body.address.is_empty() {
                    tracing::warn!(conn = id, "gateway handshake missing address");
                    return vec![Effect::CloseSelf];
                }
                if body.secret_key != self.secret_key {
                    tracing::warn!(conn = id, "gateway handshake secret mismatch");
                    return vec![Effect::CloseSelf];
                }
                tracing::info!(conn = id, address = %body.address, "gateway registered");
                self.conns.insert(id, Peer::Gateway {
                    address: body.address,
                });
                metrics::gauge!("lattice_register_gateways").set(self.gateway_count() as f64);
                self.broadcast_to_workers()
            }
            Command::WorkerConnect(body) => {
                if body.secret_key != self.secret_key {
                    tracing::warn!(conn = id, "worker handshake secret mismatch");
                    return vec![Effect::CloseSelf];
                }
                tracing::info!(conn = id, "worker registered");
                self.conns.insert(id, Peer::Worker);
                metrics::gauge!("lattice_register_workers").set(self.worker_count() as f64);
                // Bootstrap this worker immediately rather than waiting
                // for the next gateway event.
                vec![Effect::Send {
                    to: id,
                    command: Command::BroadcastAddresses(BroadcastAddresses {
                        addresses: self.addresses(),
                    }),
                }]
            }
            Command::Ping => vec![Effect::Send {
                to: id,
                command: Command::Pong,
            }],
            other => {
                tracing::warn!(conn = id, cmd = other.code(), "unexpected command, closing");
                vec![Effect::CloseSelf]
            }
        }
    }

    pub fn on_close(&mut self, id: ConnId) -> Vec<Effect> {
        match self.conns.remove(&id) {
            Some(Peer::Gateway { address }) => {
                tracing::info!(conn = id, %address, "gateway departed");
                metrics::gauge!("lattice_register_gateways").set(self.gateway_count() as f64);
                self.broadcast_to_workers()
            }
            Some(Peer::Worker) => {
                metrics::gauge!("lattice_register_workers").set(self.worker_count() as f64);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Deduplicated, sorted list of advertised gateway addresses.
    pub fn addresses(&self) -> Vec<String> {
        self.conns
            .values()
            .filter_map(|peer| match peer {
                Peer::Gateway { address } => Some(address.clone()),
                _ => None,
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn broadcast_to_workers(&self) -> Vec<Effect> {
        let command = Command::BroadcastAddresses(BroadcastAddresses {
            addresses: self.addresses(),
        });
        self.conns
            .iter()
            .filter(|(_, peer)| matches!(peer, Peer::Worker))
            .map(|(id, _)| Effect::Send {
                to: *id,
                command: command.clone(),
            })
            .collect()
    }

    fn gateway_count(&self) -> usize {
        self.conns
            .values()
            .filter(|peer| matches!(peer, Peer::Gateway { .. }))
            .count()
    }

    fn worker_count(&self) -> usize {
        self.conns
            .values()
            .filter(|peer| matches!(peer, Peer::Worker))
            .count()
    }
}

struct Shared {
    registry: Registry,
    writers: HashMap<ConnId, mpsc::Sender<Command>>,
}

impl Shared {
    /// Delivers `Send` effects; a full writer queue skips that target and
    /// the broadcast continues for the rest. Returns true when the
    /// originating connection must close.
    fn apply(&mut self, effects: Vec<Effect>) -> bool {
        let mut close_self = false;
        for effect in effects {
            match effect {
                Effect::Send { to, command } => {
                    if let Some(tx) = self.writers.get(&to) {
                        if tx.try_send(command).is_err() {
                            tracing::warn!(conn = to, "writer queue full, dropping frame");
                        }
                    }
                }
                Effect::CloseSelf => close_self = true,
            }
        }
        close_self
    }
}

/// Accept loop for the register service. The caller binds the listener
/// so tests can use an ephemeral port.
pub async fn serve(listener: TcpListener, config: RegisterConfig) -> Result<()> {
    let shared = Arc::new(Mutex::new(Shared {
        registry: Registry::new(config.secret_key.clone()),
        writers: HashMap::new(),
    }));
    let next_id = AtomicU64::new(1);
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(conn = id, %peer_addr, "register connection accepted");
        let shared = Arc::clone(&shared);
        let config = config.clone();
        tokio::spawn(async move {
            handle_conn(shared, id, stream, config).await;
        });
    }
}

async fn handle_conn(
    shared: Arc<Mutex<Shared>>,
    id: ConnId,
    stream: tokio::net::TcpStream,
    config: RegisterConfig,
) {
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
    {
        let mut shared = shared.lock();
        shared.registry.on_connect(id);
        shared.writers.insert(id, tx);
    }
    let writer_task = tokio::spawn(lattice_common::framed::run_writer(writer, rx));

    let auth_deadline = tokio::time::sleep(config.auth_timeout);
    tokio::pin!(auth_deadline);
    let mut authenticated = false;

    loop {
        tokio::select! {
            _ = &mut auth_deadline, if !authenticated => {
                let effect = shared.lock().registry.auth_deadline_elapsed(id);
                if effect.is_some() {
                    tracing::warn!(conn = id, "register auth timeout");
                    break;
                }
                // Authenticated between scheduling and firing; stop arming.
                authenticated = true;
            }
            frame = lattice_common::framed::read_command(&mut reader, config.max_frame_bytes) => {
                match frame {
                    Ok(Some(command)) => {
                        let close = {
                            let mut shared = shared.lock();
                            let effects = shared.registry.on_command(id, command);
                            let close = shared.apply(effects);
                            if !close && !shared.registry.is_pending(id) {
                                authenticated = true;
                            }
                            close
                        };
                        if close {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::debug!(conn = id, error = %err, "register connection error");
                        break;
                    }
                }
            }
        }
    }

    let effects = {
        let mut shared = shared.lock();
        shared.writers.remove(&id);
        shared.registry.on_close(id)
    };
    let _ = shared.lock().apply(effects);
    writer_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_wire::{GatewayConnect, WorkerConnect};

    fn gateway_connect(address: &str, secret: &str) -> Command {
        Command::GatewayConnect(GatewayConnect {
            address: address.to_string(),
            secret_key: secret.to_string(),
        })
    }

    fn worker_connect(secret: &str) -> Command {
        Command::WorkerConnect(WorkerConnect {
            secret_key: secret.to_string(),
        })
    }

    fn broadcast(addresses: &[&str]) -> Command {
        Command::BroadcastAddresses(BroadcastAddresses {
            addresses: addresses.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn worker_handshake_bootstraps_current_addresses() {
        let mut registry = Registry::new("s1");
        registry.on_connect(1);
        registry.on_command(1, gateway_connect("10.0.0.1:2000", "s1"));
        registry.on_connect(2);
        let effects = registry.on_command(2, worker_connect("s1"));
        assert_eq!(
            effects,
            vec![Effect::Send {
                to: 2,
                command: broadcast(&["10.0.0.1:2000"]),
            }]
        );
    }

    #[test]
    fn gateway_handshake_broadcasts_to_all_workers() {
        let mut registry = Registry::new("s1");
        registry.on_connect(1);
        registry.on_command(1, worker_connect("s1"));
        registry.on_connect(2);
        registry.on_command(2, worker_connect("s1"));
        registry.on_connect(3);
        let effects = registry.on_command(3, gateway_connect("10.0.0.1:2000", "s1"));
        assert_eq!(effects.len(), 2);
        for effect in effects {
            assert!(matches!(
                effect,
                Effect::Send { command: Command::BroadcastAddresses(_), .. }
            ));
        }
    }

    #[test]
    fn duplicate_addresses_are_deduplicated() {
        let mut registry = Registry::new("s1");
        registry.on_connect(1);
        registry.on_command(1, gateway_connect("10.0.0.1:2000", "s1"));
        registry.on_connect(2);
        registry.on_command(2, gateway_connect("10.0.0.1:2000", "s1"));
        assert_eq!(registry.addresses(), vec!["10.0.0.1:2000".to_string()]);
    }

    #[test]
    fn wrong_secret_closes_connection() {
        let mut registry = Registry::new("s1");
        registry.on_connect(1);
        assert_eq!(
            registry.on_command(1, gateway_connect("10.0.0.1:2000", "nope")),
            vec![Effect::CloseSelf]
        );
        registry.on_connect(2);
        assert_eq!(
            registry.on_command(2, worker_connect("nope")),
            vec![Effect::CloseSelf]
        );
    }

    #[test]
    fn empty_gateway_address_closes_connection() {
        let mut registry = Registry::new("s1");
        registry.on_connect(1);
        assert_eq!(
            registry.on_command(1, gateway_connect("", "s1")),
            vec![Effect::CloseSelf]
        );
    }

    #[test]
    fn ping_is_answered_regardless_of_auth_state() {
        let mut registry = Registry::new("s1");
        registry.on_connect(1);
        assert_eq!(
            registry.on_command(1, Command::Ping),
            vec![Effect::Send { to: 1, command: Command::Pong }]
        );
        // A ping is not an authentication.
        assert!(registry.is_pending(1));
        assert!(registry.auth_deadline_elapsed(1).is_some());
    }

    #[test]
    fn unexpected_command_closes_connection() {
        let mut registry = Registry::new("s1");
        registry.on_connect(1);
        let effects = registry.on_command(
            1,
            Command::SendToOne(lattice_wire::SendToOne {
                fd: 1,
                payload: vec![],
            }),
        );
        assert_eq!(effects, vec![Effect::CloseSelf]);
    }

    #[test]
    fn auth_timer_never_fires_on_authenticated_connection() {
        let mut registry = Registry::new("s1");
        registry.on_connect(1);
        registry.on_command(1, worker_connect("s1"));
        assert!(registry.auth_deadline_elapsed(1).is_none());
        // Gone connections are also not closed twice.
        registry.on_close(1);
        assert!(registry.auth_deadline_elapsed(1).is_none());
    }

    #[test]
    fn gateway_departure_rebroadcasts_smaller_set() {
        let mut registry = Registry::new("s1");
        registry.on_connect(1);
        registry.on_command(1, worker_connect("s1"));
        registry.on_connect(2);
        registry.on_command(2, gateway_connect("10.0.0.1:2000", "s1"));
        let effects = registry.on_close(2);
        assert_eq!(
            effects,
            vec![Effect::Send {
                to: 1,
                command: broadcast(&[]),
            }]
        );
    }

    #[test]
    fn worker_departure_is_silent() {
        let mut registry = Registry::new("s1");
        registry.on_connect(1);
        registry.on_command(1, worker_connect("s1"));
        assert!(registry.on_close(1).is_empty());
    }
}
