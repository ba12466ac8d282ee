// Connection/session engine: the client table, group and uid indexes,
// the attached-worker pool and the heartbeat sweep.
//
// Tables are mutated under one mutex; the routing hot path reads an
// `ArcSwap` snapshot of the worker pool that is rebuilt on attach and
// detach, so iteration never contends with pool mutation.
use arc_swap::ArcSwap;
use bytes::Bytes;
use lattice_wire::{
    AllSessions, ClientCountByGroup, ClientIdsByUid, Command, GroupIdList, IsOnlineResult,
    OnClose, OnConnect, OnMessage, OnWebsocketConnect, Select, SelectField, SelectResult,
    SelectRow, Session, SessionByClientId, SessionsByGroup,
};
use parking_lot::Mutex;
use slab::Slab;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::GatewayConfig;
use crate::router::WorkerRouter;

/// Transport seam for one client connection. Implementations must not
/// block: `send` and `ping` report delivery into the outbound buffer,
/// not delivery to the peer.
pub trait ClientSink: Send + Sync + 'static {
    /// Queue a payload towards the client; false on buffer overflow or a
    /// closed connection.
    fn send(&self, payload: Bytes) -> bool;
    /// Queue a transport-level ping probe.
    fn ping(&self) -> bool;
    /// Close the connection. Graceful close lets buffered sends flush
    /// first; otherwise the socket drops immediately.
    fn close(&self, graceful: bool);
}

/// One attached worker connection as seen by the router.
#[derive(Clone)]
pub struct WorkerEntry {
    id: usize,
    tx: mpsc::Sender<Command>,
}

impl WorkerEntry {
    pub fn new(id: usize, tx: mpsc::Sender<Command>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn try_send(&self, command: Command) -> bool {
        self.tx.try_send(command).is_ok()
    }
}

struct ClientEntry {
    sink: Arc<dyn ClientSink>,
    session: Session,
    // -1 means "heard from within the last cycle, suppress the next ping".
    ping_miss: i64,
    groups: HashSet<String>,
    uid: Option<String>,
}

#[derive(Default)]
struct Tables {
    clients: Slab<ClientEntry>,
    groups: HashMap<String, HashSet<usize>>,
    uids: HashMap<String, HashSet<usize>>,
    workers: Slab<mpsc::Sender<Command>>,
}

pub struct GatewayCore {
    tables: Mutex<Tables>,
    pool_snapshot: ArcSwap<Vec<WorkerEntry>>,
    router: Box<dyn WorkerRouter>,
    response_limit: i64,
    startup_grace: std::time::Duration,
    started_at: Instant,
}

impl GatewayCore {
    pub fn new(config: &GatewayConfig, router: Box<dyn WorkerRouter>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            pool_snapshot: ArcSwap::from_pointee(Vec::new()),
            router,
            response_limit: i64::from(config.response_limit),
            startup_grace: config.startup_grace,
            started_at: Instant::now(),
        }
    }

    // --- client lifecycle (driven by the edge transport) ---

    /// Registers a freshly accepted client and forwards the connect
    /// event to a routed worker. Returns the connection's fd.
    pub fn client_connected(&self, sink: Arc<dyn ClientSink>) -> u64 {
        let fd = {
            let mut tables = self.tables.lock();
            let fd = tables.clients.insert(ClientEntry {
                sink,
                session: Session::new(),
                ping_miss: 0,
                groups: HashSet::new(),
                uid: None,
            });
            metrics::gauge!("lattice_gateway_clients").set(tables.clients.len() as f64);
            fd
        } as u64;
        self.route_event(
            fd,
            Command::OnConnect(OnConnect {
                fd,
                ext_data: Session::new(),
            }),
        );
        fd
    }

    /// Forwards a client message with the connection's current session as
    /// `ext_data`. The message also counts as liveness: the next outbound
    /// ping is suppressed.
    pub fn client_message(&self, fd: u64, payload: Vec<u8>) {
        let session = {
            let mut tables = self.tables.lock();
            match tables.clients.get_mut(fd as usize) {
                Some(entry) => {
                    entry.ping_miss = -1;
                    entry.session.clone()
                }
                None => return,
            }
        };
        self.route_event(
            fd,
            Command::OnMessage(OnMessage {
                fd,
                payload,
                ext_data: session,
            }),
        );
    }

    /// Forwards a websocket handshake event (payload is the transport's
    /// handshake data, opaque to the gateway).
    pub fn client_websocket_connect(&self, fd: u64, payload: Vec<u8>) {
        let session = {
            let tables = self.tables.lock();
            match tables.clients.get(fd as usize) {
                Some(entry) => entry.session.clone(),
                None => return,
            }
        };
        self.route_event(
            fd,
            Command::OnWebsocketConnect(OnWebsocketConnect {
                fd,
                payload,
                ext_data: session,
            }),
        );
    }

    /// Records transport-level liveness (e.g. a pong) without forwarding
    /// anything to a worker.
    pub fn client_heard_from(&self, fd: u64) {
        let mut tables = self.tables.lock();
        if let Some(entry) = tables.clients.get_mut(fd as usize) {
            entry.ping_miss = -1;
        }
    }

    /// Transport-initiated close: forward the close event, then purge the
    /// connection from every group and uid binding it participated in.
    pub fn client_closed(&self, fd: u64) {
        if let Some((_sink, session)) = self.drop_client(fd) {
            self.route_event(
                fd,
                Command::OnClose(OnClose {
                    fd,
                    ext_data: session,
                }),
            );
        }
    }

    /// Gateway-initiated destruction (kick, destroy, heartbeat timeout).
    pub fn destroy_client(&self, fd: u64, graceful: bool) {
        if let Some((sink, session)) = self.drop_client(fd) {
            sink.close(graceful);
            self.route_event(
                fd,
                Command::OnClose(OnClose {
                    fd,
                    ext_data: session,
                }),
            );
        }
    }

    fn drop_client(&self, fd: u64) -> Option<(Arc<dyn ClientSink>, Session)> {
        let mut tables = self.tables.lock();
        let key = fd as usize;
        if !tables.clients.contains(key) {
            return None;
        }
        let entry = tables.clients.remove(key);
        for group in &entry.groups {
            if let Some(members) = tables.groups.get_mut(group) {
                members.remove(&key);
                if members.is_empty() {
                    tables.groups.remove(group);
                }
            }
        }
        if let Some(uid) = &entry.uid {
            if let Some(fds) = tables.uids.get_mut(uid) {
                fds.remove(&key);
                if fds.is_empty() {
                    tables.uids.remove(uid);
                }
            }
        }
        metrics::gauge!("lattice_gateway_clients").set(tables.clients.len() as f64);
        Some((entry.sink, entry.session))
    }

    // --- heartbeat ---

    /// One heartbeat cycle. Policy: a connection heard from within the
    /// last cycle (counter -1) resets to 0 and is not pinged; otherwise
    /// the counter increments and a ping goes out; a connection whose
    /// counter reaches `response_limit` missed cycles is destroyed.
    pub fn heartbeat_tick(&self) {
        let mut to_ping = Vec::new();
        let mut to_destroy = Vec::new();
        {
            let mut tables = self.tables.lock();
            for (fd, entry) in tables.clients.iter_mut() {
                if entry.ping_miss < 0 {
                    entry.ping_miss = 0;
                    continue;
                }
                entry.ping_miss += 1;
                if entry.ping_miss >= self.response_limit {
                    to_destroy.push(fd as u64);
                } else {
                    to_ping.push(Arc::clone(&entry.sink));
                }
            }
        }
        for sink in to_ping {
            let _ = sink.ping();
        }
        for fd in to_destroy {
            tracing::debug!(fd, "client heartbeat timeout");
            metrics::counter!("lattice_gateway_heartbeat_timeouts").increment(1);
            self.destroy_client(fd, false);
        }
    }

    // --- worker pool ---

    /// Attaches an authenticated worker connection to the routing pool.
    pub fn add_worker(&self, tx: mpsc::Sender<Command>) -> usize {
        let mut tables = self.tables.lock();
        let id = tables.workers.insert(tx);
        self.rebuild_pool_snapshot(&tables);
        metrics::gauge!("lattice_gateway_workers").set(tables.workers.len() as f64);
        id
    }

    pub fn remove_worker(&self, id: usize) {
        let mut tables = self.tables.lock();
        if tables.workers.contains(id) {
            tables.workers.remove(id);
            self.rebuild_pool_snapshot(&tables);
        }
        metrics::gauge!("lattice_gateway_workers").set(tables.workers.len() as f64);
    }

    fn rebuild_pool_snapshot(&self, tables: &Tables) {
        let pool: Vec<WorkerEntry> = tables
            .workers
            .iter()
            .map(|(id, tx)| WorkerEntry::new(id, tx.clone()))
            .collect();
        self.pool_snapshot.store(Arc::new(pool));
    }

    /// Sends a keepalive ping to every attached worker connection.
    pub fn ping_workers(&self) {
        let pool = self.pool_snapshot.load();
        for entry in pool.iter() {
            let _ = entry.try_send(Command::Ping);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.pool_snapshot.load().len()
    }

    fn route_event(&self, fd: u64, command: Command) {
        let pool = self.pool_snapshot.load();
        let is_close = matches!(command, Command::OnClose(_));
        match self.router.route(&pool, fd, command.code()) {
            Some(index) => {
                if let Some(entry) = pool.get(index) {
                    if !entry.try_send(command) {
                        tracing::warn!(fd, worker = entry.id(), "worker queue full, event dropped");
                        metrics::counter!("lattice_gateway_dropped_events").increment(1);
                    }
                }
            }
            None => {
                // No worker attached: drop the event and disconnect the
                // client with a normal closure. Quiet during the startup
                // grace window while worker links are still forming.
                if self.started_at.elapsed() < self.startup_grace {
                    tracing::debug!(fd, "no worker available, dropping event");
                } else {
                    tracing::warn!(fd, "no worker available, dropping event");
                }
                metrics::counter!("lattice_gateway_unroutable_events").increment(1);
                if !is_close {
                    if let Some((sink, _session)) = self.drop_client(fd) {
                        sink.close(true);
                    }
                }
            }
        }
    }

    // --- control commands from workers ---

    /// Executes one worker-issued control command. Queries return a reply
    /// frame to send back on the same connection.
    pub fn handle_worker_command(&self, command: Command) -> Option<Command> {
        match command {
            Command::SendToOne(body) => {
                let sink = {
                    let tables = self.tables.lock();
                    tables
                        .clients
                        .get(body.fd as usize)
                        .map(|entry| Arc::clone(&entry.sink))
                };
                // Unknown fd: the client already closed; silently drop.
                if let Some(sink) = sink {
                    if !sink.send(Bytes::from(body.payload)) {
                        // Full outbound buffer on a direct send
                        // disconnects the client.
                        self.destroy_client(body.fd, false);
                    }
                }
                None
            }
            Command::SendToAll(body) => {
                let exclude: HashSet<usize> =
                    body.exclude.iter().map(|fd| *fd as usize).collect();
                let sinks: Vec<Arc<dyn ClientSink>> = {
                    let tables = self.tables.lock();
                    tables
                        .clients
                        .iter()
                        .filter(|(fd, _)| !exclude.contains(fd))
                        .map(|(_, entry)| Arc::clone(&entry.sink))
                        .collect()
                };
                let payload = Bytes::from(body.payload);
                for sink in sinks {
                    // A failing target is skipped; the broadcast continues.
                    let _ = sink.send(payload.clone());
                }
                None
            }
            Command::SendToUid(body) => {
                let sinks: Vec<Arc<dyn ClientSink>> = {
                    let tables = self.tables.lock();
                    tables
                        .uids
                        .get(&body.uid)
                        .map(|fds| {
                            fds.iter()
                                .filter_map(|fd| tables.clients.get(*fd))
                                .map(|entry| Arc::clone(&entry.sink))
                                .collect()
                        })
                        .unwrap_or_default()
                };
                let payload = Bytes::from(body.payload);
                for sink in sinks {
                    let _ = sink.send(payload.clone());
                }
                None
            }
            Command::SendToGroup(body) => {
                let exclude: HashSet<usize> =
                    body.exclude.iter().map(|fd| *fd as usize).collect();
                let sinks: Vec<Arc<dyn ClientSink>> = {
                    let tables = self.tables.lock();
                    tables
                        .groups
                        .get(&body.group)
                        .map(|fds| {
                            fds.iter()
                                .filter(|fd| !exclude.contains(fd))
                                .filter_map(|fd| tables.clients.get(*fd))
                                .map(|entry| Arc::clone(&entry.sink))
                                .collect()
                        })
                        .unwrap_or_default()
                };
                let payload = Bytes::from(body.payload);
                for sink in sinks {
                    let _ = sink.send(payload.clone());
                }
                None
            }
            Command::Kick(body) => {
                // Buffered sends flush before the socket closes.
                self.destroy_client(body.fd, true);
                None
            }
            Command::Destroy(body) => {
                self.destroy_client(body.fd, false);
                None
            }
            Command::UpdateSession(body) => {
                let mut tables = self.tables.lock();
                if let Some(entry) = tables.clients.get_mut(body.fd as usize) {
                    for (key, value) in body.session {
                        entry.session.insert(key, value);
                    }
                }
                None
            }
            Command::SetSession(body) => {
                let mut tables = self.tables.lock();
                if let Some(entry) = tables.clients.get_mut(body.fd as usize) {
                    entry.session = body.session;
                }
                None
            }
            Command::BindUid(body) => {
                let mut tables = self.tables.lock();
                let key = body.fd as usize;
                if !tables.clients.contains(key) {
                    return None;
                }
                // A connection holds at most one uid; rebinding moves it.
                if let Some(previous) = tables.clients[key].uid.take() {
                    if let Some(fds) = tables.uids.get_mut(&previous) {
                        fds.remove(&key);
                        if fds.is_empty() {
                            tables.uids.remove(&previous);
                        }
                    }
                }
                tables.clients[key].uid = Some(body.uid.clone());
                tables.uids.entry(body.uid).or_default().insert(key);
                None
            }
            Command::UnbindUid(body) => {
                let mut tables = self.tables.lock();
                let key = body.fd as usize;
                if let Some(entry) = tables.clients.get_mut(key) {
                    if let Some(uid) = entry.uid.take() {
                        if let Some(fds) = tables.uids.get_mut(&uid) {
                            fds.remove(&key);
                            if fds.is_empty() {
                                tables.uids.remove(&uid);
                            }
                        }
                    }
                }
                None
            }
            Command::JoinGroup(body) => {
                let mut tables = self.tables.lock();
                let key = body.fd as usize;
                if !tables.clients.contains(key) {
                    return None;
                }
                tables.clients[key].groups.insert(body.group.clone());
                tables.groups.entry(body.group).or_default().insert(key);
                None
            }
            Command::LeaveGroup(body) => {
                let mut tables = self.tables.lock();
                let key = body.fd as usize;
                if let Some(entry) = tables.clients.get_mut(key) {
                    entry.groups.remove(&body.group);
                }
                if let Some(members) = tables.groups.get_mut(&body.group) {
                    members.remove(&key);
                    if members.is_empty() {
                        tables.groups.remove(&body.group);
                    }
                }
                None
            }
            Command::Ungroup(body) => {
                let mut tables = self.tables.lock();
                if let Some(members) = tables.groups.remove(&body.group) {
                    for fd in members {
                        if let Some(entry) = tables.clients.get_mut(fd) {
                            entry.groups.remove(&body.group);
                        }
                    }
                }
                None
            }
            Command::IsOnline(body) => {
                let tables = self.tables.lock();
                Some(Command::IsOnlineResult(IsOnlineResult {
                    online: tables.clients.contains(body.fd as usize),
                }))
            }
            Command::GetAllSessions => {
                let tables = self.tables.lock();
                let sessions: BTreeMap<u64, Session> = tables
                    .clients
                    .iter()
                    .map(|(fd, entry)| (fd as u64, entry.session.clone()))
                    .collect();
                Some(Command::AllSessions(AllSessions { sessions }))
            }
            Command::GetSessionByClientId(body) => {
                let tables = self.tables.lock();
                Some(Command::SessionByClientId(SessionByClientId {
                    session: tables
                        .clients
                        .get(body.fd as usize)
                        .map(|entry| entry.session.clone()),
                }))
            }
            Command::GetClientIdsByUid(body) => {
                let tables = self.tables.lock();
                let mut fds: Vec<u64> = tables
                    .uids
                    .get(&body.uid)
                    .map(|fds| fds.iter().map(|fd| *fd as u64).collect())
                    .unwrap_or_default();
                fds.sort_unstable();
                Some(Command::ClientIdsByUid(ClientIdsByUid { fds }))
            }
            Command::GetSessionsByGroup(body) => {
                let tables = self.tables.lock();
                let sessions: BTreeMap<u64, Session> = tables
                    .groups
                    .get(&body.group)
                    .map(|fds| {
                        fds.iter()
                            .filter_map(|fd| {
                                tables
                                    .clients
                                    .get(*fd)
                                    .map(|entry| (*fd as u64, entry.session.clone()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Some(Command::SessionsByGroup(SessionsByGroup { sessions }))
            }
            Command::GetClientCountByGroup(body) => {
                let tables = self.tables.lock();
                let count = tables
                    .groups
                    .get(&body.group)
                    .map(|fds| fds.len() as u64)
                    .unwrap_or(0);
                Some(Command::ClientCountByGroup(ClientCountByGroup { count }))
            }
            Command::GetGroupIdList => {
                let tables = self.tables.lock();
                let mut groups: Vec<String> = tables.groups.keys().cloned().collect();
                groups.sort_unstable();
                Some(Command::GroupIdList(GroupIdList { groups }))
            }
            Command::Select(body) => Some(Command::SelectResult(self.select(body))),
            Command::Ping => Some(Command::Pong),
            other => {
                tracing::warn!(cmd = other.code(), "unexpected command from worker");
                None
            }
        }
    }

    fn select(&self, query: Select) -> SelectResult {
        let tables = self.tables.lock();
        let filter = &query.filter;
        let unfiltered =
            filter.fds.is_empty() && filter.uids.is_empty() && filter.groups.is_empty();
        let selected: BTreeSet<usize> = if unfiltered {
            tables.clients.iter().map(|(fd, _)| fd).collect()
        } else {
            let mut selected = BTreeSet::new();
            for fd in &filter.fds {
                if tables.clients.contains(*fd as usize) {
                    selected.insert(*fd as usize);
                }
            }
            for uid in &filter.uids {
                if let Some(fds) = tables.uids.get(uid) {
                    selected.extend(fds.iter().copied());
                }
            }
            for group in &filter.groups {
                if let Some(fds) = tables.groups.get(group) {
                    selected.extend(fds.iter().copied());
                }
            }
            selected
        };
        let want = |field: SelectField| query.fields.contains(&field);
        let rows = selected
            .into_iter()
            .filter_map(|fd| tables.clients.get(fd).map(|entry| (fd, entry)))
            .map(|(fd, entry)| SelectRow {
                fd: fd as u64,
                uid: want(SelectField::Uid)
                    .then(|| entry.uid.clone())
                    .flatten(),
                session: want(SelectField::Session).then(|| entry.session.clone()),
                groups: want(SelectField::Groups).then(|| {
                    let mut groups: Vec<String> = entry.groups.iter().cloned().collect();
                    groups.sort_unstable();
                    groups
                }),
            })
            .collect();
        SelectResult { rows }
    }
}
