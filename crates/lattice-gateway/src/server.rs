// Internal listener: worker connections authenticate here and join the
// routing pool; control-only peers authenticate with a separate
// handshake and may issue commands without receiving routed events.
use lattice_wire::Command;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::core::GatewayCore;
use crate::{GatewayConfig, Result};

const WRITER_QUEUE_DEPTH: usize = 256;

/// Accept loop for the internal listener, plus the two periodic sweeps
/// that belong to this gateway: the client heartbeat and the worker
/// keepalive. The caller binds the listener so tests can use an
/// ephemeral port.
pub async fn serve(
    listener: TcpListener,
    core: Arc<GatewayCore>,
    config: GatewayConfig,
) -> Result<()> {
    {
        let core = Arc::clone(&core);
        let interval = config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                core.heartbeat_tick();
            }
        });
    }
    {
        let core = Arc::clone(&core);
        let interval = config.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                core.ping_workers();
            }
        });
    }
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        tracing::debug!(%peer_addr, "internal connection accepted");
        let core = Arc::clone(&core);
        let config = config.clone();
        tokio::spawn(async move {
            handle_conn(core, stream, config).await;
        });
    }
}

async fn handle_conn(core: Arc<GatewayCore>, stream: TcpStream, config: GatewayConfig) {
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
    let writer_task = tokio::spawn(lattice_common::framed::run_writer(writer, rx));

    // The first frame must be a handshake; anything else (or silence past
    // the grace window) drops the connection.
    let auth_deadline = tokio::time::sleep(config.auth_timeout);
    tokio::pin!(auth_deadline);
    let handshake = tokio::select! {
        _ = &mut auth_deadline => {
            tracing::warn!("internal connection auth timeout");
            None
        }
        frame = lattice_common::framed::read_command(&mut reader, config.max_frame_bytes) => {
            match frame {
                Ok(command) => command,
                Err(err) => {
                    tracing::debug!(error = %err, "internal connection error during auth");
                    None
                }
            }
        }
    };

    match handshake {
        Some(Command::WorkerConnect(body)) if body.secret_key == config.secret_key => {
            let worker_id = core.add_worker(tx.clone());
            tracing::info!(worker = worker_id, "worker attached");
            command_loop(&core, &mut reader, &tx, config.max_frame_bytes).await;
            core.remove_worker(worker_id);
            tracing::info!(worker = worker_id, "worker detached");
        }
        Some(Command::GatewayClientConnect(body)) if body.secret_key == config.secret_key => {
            tracing::debug!("control peer attached");
            command_loop(&core, &mut reader, &tx, config.max_frame_bytes).await;
        }
        Some(command) => {
            tracing::warn!(cmd = command.code(), "internal handshake rejected");
        }
        None => {}
    }
    writer_task.abort();
}

async fn command_loop(
    core: &GatewayCore,
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    tx: &mpsc::Sender<Command>,
    max_frame_bytes: usize,
) {
    loop {
        match lattice_common::framed::read_command(reader, max_frame_bytes).await {
            Ok(Some(Command::Pong)) => {}
            Ok(Some(command)) => {
                if let Some(reply) = core.handle_worker_command(command) {
                    if tx.try_send(reply).is_err() {
                        tracing::warn!("internal writer queue full, dropping reply");
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(error = %err, "internal connection error");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ClientSink;
    use crate::router::RoundRobinRouter;
    use bytes::Bytes;
    use lattice_common::framed::{read_command_default, write_command};
    use lattice_wire::{GatewayClientConnect, IsOnline, IsOnlineResult, WorkerConnect};
    use std::time::Duration;

    struct NullSink;

    impl ClientSink for NullSink {
        fn send(&self, _payload: Bytes) -> bool {
            true
        }

        fn ping(&self) -> bool {
            true
        }

        fn close(&self, _graceful: bool) {}
    }

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            secret_key: "gw-secret".to_string(),
            auth_timeout: Duration::from_millis(200),
            ..GatewayConfig::default()
        }
    }

    fn spawn_server(config: GatewayConfig) -> (Arc<GatewayCore>, std::net::SocketAddr) {
        let core = Arc::new(GatewayCore::new(
            &config,
            Box::new(RoundRobinRouter::default()),
        ));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.set_nonblocking(true).expect("nonblocking");
        let addr = listener.local_addr().expect("addr");
        let listener = TcpListener::from_std(listener).expect("tokio listener");
        tokio::spawn(serve(listener, Arc::clone(&core), config));
        (core, addr)
    }

    #[tokio::test]
    async fn worker_handshake_joins_pool_and_receives_events() {
        let (core, addr) = spawn_server(test_config());
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (mut read_half, mut write_half) = stream.into_split();
        write_command(
            &mut write_half,
            &Command::WorkerConnect(WorkerConnect {
                secret_key: "gw-secret".to_string(),
            }),
        )
        .await
        .expect("handshake");
        tokio::time::timeout(Duration::from_secs(1), async {
            while core.worker_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker attached");

        let fd = core.client_connected(Arc::new(NullSink));
        // The worker keepalive ticker may interleave Ping frames with the
        // routed event; skip keepalives until the first real frame.
        let event = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match read_command_default(&mut read_half)
                    .await
                    .expect("read")
                    .expect("frame")
                {
                    Command::Ping | Command::Pong => continue,
                    other => break other,
                }
            }
        })
        .await
        .expect("event in time");
        match event {
            Command::OnConnect(body) => assert_eq!(body.fd, fd),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let (core, addr) = spawn_server(test_config());
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (mut read_half, mut write_half) = stream.into_split();
        write_command(
            &mut write_half,
            &Command::WorkerConnect(WorkerConnect {
                secret_key: "nope".to_string(),
            }),
        )
        .await
        .expect("handshake");
        let eof = tokio::time::timeout(Duration::from_secs(1), read_command_default(&mut read_half))
            .await
            .expect("closed in time")
            .expect("read");
        assert!(eof.is_none());
        assert_eq!(core.worker_count(), 0);
    }

    #[tokio::test]
    async fn silent_connection_is_dropped_after_auth_timeout() {
        let (_core, addr) = spawn_server(test_config());
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (mut read_half, _write_half) = stream.into_split();
        let eof = tokio::time::timeout(Duration::from_secs(2), read_command_default(&mut read_half))
            .await
            .expect("closed in time")
            .expect("read");
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn control_peer_can_query_without_joining_pool() {
        let (core, addr) = spawn_server(test_config());
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (mut read_half, mut write_half) = stream.into_split();
        write_command(
            &mut write_half,
            &Command::GatewayClientConnect(GatewayClientConnect {
                secret_key: "gw-secret".to_string(),
            }),
        )
        .await
        .expect("handshake");
        write_command(&mut write_half, &Command::IsOnline(IsOnline { fd: 7 }))
            .await
            .expect("query");
        let reply = tokio::time::timeout(Duration::from_secs(1), read_command_default(&mut read_half))
            .await
            .expect("reply in time")
            .expect("read")
            .expect("frame");
        assert_eq!(
            reply,
            Command::IsOnlineResult(IsOnlineResult { online: false })
        );
        assert_eq!(core.worker_count(), 0);
    }

    #[tokio::test]
    async fn worker_detach_leaves_pool() {
        let (core, addr) = spawn_server(test_config());
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (_read_half, mut write_half) = stream.into_split();
        write_command(
            &mut write_half,
            &Command::WorkerConnect(WorkerConnect {
                secret_key: "gw-secret".to_string(),
            }),
        )
        .await
        .expect("handshake");
        tokio::time::timeout(Duration::from_secs(1), async {
            while core.worker_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker attached");
        drop(write_half);
        drop(_read_half);
        tokio::time::timeout(Duration::from_secs(1), async {
            while core.worker_count() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker detached");
    }
}
