// Supervised link to the register: authenticate, then treat every
// address broadcast as the authoritative gateway set and dial whatever
// this worker is not yet connected to.
use lattice_common::framed::{read_command, write_command};
use lattice_wire::{Command, WorkerConnect};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::gateway::run_gateway_link;
use crate::{Event, Links, WorkerConfig};

/// Runs forever. Dropped gateway links are not redialed here; they come
/// back when a later broadcast lists them again.
pub(crate) async fn run_register_link(
    config: WorkerConfig,
    links: Arc<Links>,
    events: mpsc::Sender<Event>,
) {
    loop {
        match TcpStream::connect(&config.register_address).await {
            Ok(stream) => {
                tracing::info!(register = %config.register_address, "register link up");
                if let Err(err) = drive_session(stream, &config, &links, &events).await {
                    match &err {
                        crate::WorkerError::Link(link) if link.is_malformed() => {
                            tracing::error!(error = %err, "register link sent a bad frame");
                        }
                        _ => tracing::warn!(error = %err, "register link lost"),
                    }
                }
            }
            Err(err) => {
                tracing::warn!(register = %config.register_address, error = %err, "register dial failed");
            }
        }
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

async fn drive_session(
    stream: TcpStream,
    config: &WorkerConfig,
    links: &Arc<Links>,
    events: &mpsc::Sender<Event>,
) -> crate::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    write_command(
        &mut writer,
        &Command::WorkerConnect(WorkerConnect {
            secret_key: config.register_secret_key.clone(),
        }),
    )
    .await?;

    let mut ticker = tokio::time::interval(config.ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                write_command(&mut writer, &Command::Ping).await?;
            }
            frame = read_command(&mut reader, config.max_frame_bytes) => {
                match frame? {
                    Some(Command::BroadcastAddresses(body)) => {
                        reconcile(&body.addresses, config, links, events);
                    }
                    Some(Command::Pong) | Some(Command::Ping) => {}
                    Some(command) => {
                        tracing::debug!(cmd = command.code(), "ignoring frame from register");
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}

fn reconcile(
    addresses: &[String],
    config: &WorkerConfig,
    links: &Arc<Links>,
    events: &mpsc::Sender<Event>,
) {
    tracing::debug!(gateways = addresses.len(), "gateway address broadcast");
    for address in links.missing(addresses) {
        tokio::spawn(run_gateway_link(
            address,
            config.clone(),
            Arc::clone(links),
            events.clone(),
        ));
    }
}
