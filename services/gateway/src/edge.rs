// Client-facing listener: a plain length-framed TCP transport behind
// the core's `ClientSink` seam.
//
// Client frames are `[u32 len BE][payload]` with `len` counting the
// payload only. A zero-length frame is transport keepalive: the gateway
// pings with one, and any inbound frame (empty included) counts as
// liveness. Payload bytes are opaque to the gateway.
use bytes::Bytes;
use lattice_gateway::{ClientSink, GatewayCore};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};

const EDGE_QUEUE_DEPTH: usize = 128;

enum Outbound {
    Frame(Bytes),
    // Flush everything queued before it, then close.
    Shutdown,
}

/// `ClientSink` over one client socket: sends queue on the writer task,
/// graceful close drains the queue first, immediate close wakes the
/// reader so the connection task exits now.
struct EdgeSink {
    tx: mpsc::Sender<Outbound>,
    abort: Arc<Notify>,
}

impl ClientSink for EdgeSink {
    fn send(&self, payload: Bytes) -> bool {
        self.tx.try_send(Outbound::Frame(payload)).is_ok()
    }

    fn ping(&self) -> bool {
        self.tx.try_send(Outbound::Frame(Bytes::new())).is_ok()
    }

    fn close(&self, graceful: bool) {
        if graceful {
            let _ = self.tx.try_send(Outbound::Shutdown);
        } else {
            self.abort.notify_one();
        }
    }
}

/// Accept loop for the client-facing listener.
pub async fn serve(
    listener: TcpListener,
    core: Arc<GatewayCore>,
    max_frame_bytes: usize,
) -> std::io::Result<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        tracing::debug!(%peer_addr, "client connection accepted");
        let core = Arc::clone(&core);
        tokio::spawn(async move {
            handle_client(core, stream, max_frame_bytes).await;
        });
    }
}

async fn handle_client(core: Arc<GatewayCore>, stream: TcpStream, max_frame_bytes: usize) {
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(EDGE_QUEUE_DEPTH);
    let abort = Arc::new(Notify::new());
    let writer_task = tokio::spawn(run_edge_writer(writer, rx, Arc::clone(&abort)));
    // The core's table entry owns the only sink; once destroyed, the
    // writer channel closes and the writer task winds down.
    let fd = core.client_connected(Arc::new(EdgeSink {
        tx,
        abort: Arc::clone(&abort),
    }));

    loop {
        tokio::select! {
            _ = abort.notified() => break,
            frame = read_edge_frame(&mut reader, max_frame_bytes) => {
                match frame {
                    Ok(Some(payload)) if payload.is_empty() => core.client_heard_from(fd),
                    Ok(Some(payload)) => core.client_message(fd, payload),
                    Ok(None) => {
                        core.client_closed(fd);
                        break;
                    }
                    Err(err) => {
                        tracing::debug!(fd, error = %err, "client connection error");
                        core.client_closed(fd);
                        break;
                    }
                }
            }
        }
    }
    writer_task.abort();
}

async fn read_edge_frame(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    max_frame_bytes: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let declared = u32::from_be_bytes(header) as usize;
    if declared > max_frame_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {declared} bytes exceeds cap"),
        ));
    }
    let mut payload = vec![0u8; declared];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

async fn run_edge_writer(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outbound>,
    abort: Arc<Notify>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(payload) => {
                let header = (payload.len() as u32).to_be_bytes();
                if writer.write_all(&header).await.is_err()
                    || writer.write_all(&payload).await.is_err()
                {
                    break;
                }
            }
            Outbound::Shutdown => break,
        }
    }
    let _ = writer.shutdown().await;
    // Wake the reader so the connection task exits with the writer.
    abort.notify_one();
}
