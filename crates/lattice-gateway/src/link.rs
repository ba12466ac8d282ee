// Supervised link to the register: announce this gateway's internal
// address, keep the connection alive with periodic pings, and redial
// after a fixed delay whenever the link drops.
use lattice_common::framed::{read_command, write_command};
use lattice_wire::{Command, GatewayConnect};
use tokio::net::TcpStream;

use crate::GatewayConfig;

/// Runs forever. Each session registers the advertised address and then
/// pings until the connection fails; registration state on the register
/// side is tied to the connection, so a redial re-announces implicitly.
pub async fn run_register_link(config: GatewayConfig) {
    loop {
        match TcpStream::connect(&config.register_address).await {
            Ok(stream) => {
                tracing::info!(register = %config.register_address, "register link up");
                if let Err(err) = drive_session(stream, &config).await {
                    if err.is_malformed() {
                        tracing::error!(error = %err, "register link sent a bad frame");
                    } else {
                        tracing::warn!(error = %err, "register link lost");
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

async fn drive_session(stream: TcpStream, config: &GatewayConfig) -> lattice_common::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    write_command(
        &mut writer,
        &Command::GatewayConnect(GatewayConnect {
            address: config.lan_address.clone(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::framed::read_command_default;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn link_config(register_address: String) -> GatewayConfig {
        GatewayConfig {
            register_secret_key: "reg-secret".to_string(),
            register_address,
            lan_address: "10.1.1.1:2300".to_string(),
            ping_interval: Duration::from_millis(20),
            reconnect_delay: Duration::from_millis(20),
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn link_registers_and_pings() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(run_register_link(link_config(addr.to_string())));

        let (stream, _) = listener.accept().await.expect("accept");
        let (mut reader, _writer) = stream.into_split();
        let handshake = tokio::time::timeout(Duration::from_secs(1), read_command_default(&mut reader))
            .await
            .expect("handshake in time")
            .expect("read")
            .expect("frame");
        assert_eq!(
            handshake,
            Command::GatewayConnect(GatewayConnect {
                address: "10.1.1.1:2300".to_string(),
                secret_key: "reg-secret".to_string(),
            })
        );
        let ping = tokio::time::timeout(Duration::from_secs(1), read_command_default(&mut reader))
            .await
            .expect("ping in time")
            .expect("read")
            .expect("frame");
        assert_eq!(ping, Command::Ping);
    }

    #[tokio::test]
    async fn link_redials_after_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(run_register_link(link_config(addr.to_string())));

        // First session: accept and immediately drop.
        let (stream, _) = listener.accept().await.expect("accept");
        drop(stream);

        // The link comes back and re-announces.
        let (stream, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("redial in time")
            .expect("accept");
        let (mut reader, _writer) = stream.into_split();
        let handshake = tokio::time::timeout(Duration::from_secs(1), read_command_default(&mut reader))
            .await
            .expect("handshake in time")
            .expect("read")
            .expect("frame");
        assert!(matches!(handshake, Command::GatewayConnect(_)));
    }
}
