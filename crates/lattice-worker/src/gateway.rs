// One link per discovered gateway: handshake on the internal listener,
// then turn routed frames into events and answer keepalive pings.
use lattice_common::framed::{read_command, run_writer, write_command};
use lattice_wire::{
    BindUid, Command, Destroy, JoinGroup, Kick, LeaveGroup, SendToAll, SendToGroup, SendToOne,
    SendToUid, SetSession, UnbindUid, Ungroup, UpdateSession, WorkerConnect,
};
use lattice_wire::Session;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::{Event, EventKind, Links, WorkerConfig};

const WRITER_QUEUE_DEPTH: usize = 256;

/// Cheap clonable handle for pushing control commands to one gateway.
/// Sends fail (return false) once the link is gone.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    address: Arc<str>,
    tx: mpsc::Sender<Command>,
}

impl GatewayHandle {
    pub(crate) fn new(address: &str, tx: mpsc::Sender<Command>) -> Self {
        Self {
            address: Arc::from(address),
            tx,
        }
    }

    /// The gateway's advertised internal address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Queues a raw command on the link.
    pub async fn send(&self, command: Command) -> bool {
        self.tx.send(command).await.is_ok()
    }

    pub async fn send_to_one(&self, fd: u64, payload: Vec<u8>) -> bool {
        self.send(Command::SendToOne(SendToOne { fd, payload })).await
    }

    pub async fn send_to_all(&self, payload: Vec<u8>, exclude: Vec<u64>) -> bool {
        self.send(Command::SendToAll(SendToAll { payload, exclude }))
            .await
    }

    pub async fn send_to_uid(&self, uid: impl Into<String>, payload: Vec<u8>) -> bool {
        self.send(Command::SendToUid(SendToUid {
            uid: uid.into(),
            payload,
        }))
        .await
    }

    pub async fn send_to_group(
        &self,
        group: impl Into<String>,
        payload: Vec<u8>,
        exclude: Vec<u64>,
    ) -> bool {
        self.send(Command::SendToGroup(SendToGroup {
            group: group.into(),
            payload,
            exclude,
        }))
        .await
    }

    pub async fn kick(&self, fd: u64) -> bool {
        self.send(Command::Kick(Kick { fd })).await
    }

    pub async fn destroy(&self, fd: u64) -> bool {
        self.send(Command::Destroy(Destroy { fd })).await
    }

    pub async fn bind_uid(&self, fd: u64, uid: impl Into<String>) -> bool {
        self.send(Command::BindUid(BindUid { fd, uid: uid.into() })).await
    }

    pub async fn unbind_uid(&self, fd: u64) -> bool {
        self.send(Command::UnbindUid(UnbindUid { fd })).await
    }

    pub async fn join_group(&self, fd: u64, group: impl Into<String>) -> bool {
        self.send(Command::JoinGroup(JoinGroup {
            fd,
            group: group.into(),
        }))
        .await
    }

    pub async fn leave_group(&self, fd: u64, group: impl Into<String>) -> bool {
        self.send(Command::LeaveGroup(LeaveGroup {
            fd,
            group: group.into(),
        }))
        .await
    }

    pub async fn ungroup(&self, group: impl Into<String>) -> bool {
        self.send(Command::Ungroup(Ungroup {
            group: group.into(),
        }))
        .await
    }

    pub async fn update_session(&self, fd: u64, session: Session) -> bool {
        self.send(Command::UpdateSession(UpdateSession { fd, session }))
            .await
    }

    pub async fn set_session(&self, fd: u64, session: Session) -> bool {
        self.send(Command::SetSession(SetSession { fd, session })).await
    }
}

/// Dials one gateway and drives the link until it drops. The handle is
/// published in `links` only after a successful handshake write; a dead
/// address stays absent until the register broadcasts it again.
pub(crate) async fn run_gateway_link(
    address: String,
    config: WorkerConfig,
    links: Arc<Links>,
    events: mpsc::Sender<Event>,
) {
    match dial(&address, &config, &links, &events).await {
        Ok(()) => tracing::info!(gateway = %address, "gateway link closed"),
        Err(crate::WorkerError::Link(link)) if link.is_malformed() => {
            tracing::error!(gateway = %address, error = %link, "gateway link sent a bad frame");
        }
        Err(err) => tracing::warn!(gateway = %address, error = %err, "gateway link failed"),
    }
    links.detach(&address);
}

async fn dial(
    address: &str,
    config: &WorkerConfig,
    links: &Links,
    events: &mpsc::Sender<Event>,
) -> crate::Result<()> {
    let stream = TcpStream::connect(address).await?;
    let (mut reader, mut writer) = stream.into_split();
    write_command(
        &mut writer,
        &Command::WorkerConnect(WorkerConnect {
            secret_key: config.gateway_secret_key.clone(),
        }),
    )
    .await?;

    let (tx, rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
    let writer_task = tokio::spawn(run_writer(writer, rx));
    let handle = GatewayHandle::new(address, tx.clone());
    links.attach(address, handle.clone());
    tracing::info!(gateway = %address, "gateway link up");

    let result = event_loop(config, &mut reader, &tx, &handle, events).await;
    writer_task.abort();
    result
}

async fn event_loop(
    config: &WorkerConfig,
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    tx: &mpsc::Sender<Command>,
    handle: &GatewayHandle,
    events: &mpsc::Sender<Event>,
) -> crate::Result<()> {
    let mut ticker = tokio::time::interval(config.ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        let frame = tokio::select! {
            _ = ticker.tick() => {
                if tx.try_send(Command::Ping).is_err() {
                    tracing::warn!(gateway = %handle.address(), "writer queue full, ping dropped");
                }
                continue;
            }
            frame = read_command(reader, config.max_frame_bytes) => frame?,
        };
        let kind = match frame {
            Some(Command::OnConnect(body)) => EventKind::Connect {
                fd: body.fd,
                ext_data: body.ext_data,
            },
            Some(Command::OnMessage(body)) => EventKind::Message {
                fd: body.fd,
                payload: body.payload,
                ext_data: body.ext_data,
            },
            Some(Command::OnWebsocketConnect(body)) => EventKind::WebsocketConnect {
                fd: body.fd,
                payload: body.payload,
                ext_data: body.ext_data,
            },
            Some(Command::OnClose(body)) => EventKind::Close {
                fd: body.fd,
                ext_data: body.ext_data,
            },
            Some(Command::Ping) => {
                if tx.try_send(Command::Pong).is_err() {
                    tracing::warn!(gateway = %handle.address(), "writer queue full, pong dropped");
                }
                continue;
            }
            Some(Command::Pong) => continue,
            Some(command) => {
                tracing::debug!(
                    gateway = %handle.address(),
                    cmd = command.code(),
                    "ignoring frame from gateway"
                );
                continue;
            }
            None => return Ok(()),
        };
        metrics::counter!("lattice_worker_events").increment(1);
        // Awaiting here pauses the reader, so a slow handler turns into
        // TCP backpressure towards the gateway.
        if events
            .send(Event {
                gateway: handle.clone(),
                kind,
            })
            .await
            .is_err()
        {
            return Ok(());
        }
    }
}
