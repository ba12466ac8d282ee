// End-to-end rendezvous over real sockets: a gateway registers, a
// worker discovers it, and the gateway's departure converges the
// worker's view back to empty.
use lattice_common::framed::{read_command_default, write_command};
use lattice_register::{RegisterConfig, serve};
use lattice_wire::{BroadcastAddresses, Command, GatewayConnect, WorkerConnect};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

async fn start_register(secret: &str) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(serve(
        listener,
        RegisterConfig {
            secret_key: secret.to_string(),
            ..RegisterConfig::default()
        },
    ));
    addr
}

async fn read_frame(reader: &mut (impl tokio::io::AsyncRead + Unpin)) -> Command {
    tokio::time::timeout(Duration::from_secs(2), read_command_default(reader))
        .await
        .expect("frame in time")
        .expect("read")
        .expect("frame")
}

fn broadcast(addresses: &[&str]) -> Command {
    Command::BroadcastAddresses(BroadcastAddresses {
        addresses: addresses.iter().map(|s| s.to_string()).collect(),
    })
}

#[tokio::test]
async fn gateway_registration_reaches_worker_and_converges_on_departure() {
    let register = start_register("s1").await;

    // Gateway registers its internal address.
    let gateway = TcpStream::connect(register).await.expect("connect");
    let (_gw_reader, mut gw_writer) = gateway.into_split();
    write_command(
        &mut gw_writer,
        &Command::GatewayConnect(GatewayConnect {
            address: "10.0.0.1:2000".to_string(),
            secret_key: "s1".to_string(),
        }),
    )
    .await
    .expect("register gateway");

    // Worker joins and is bootstrapped with the current set.
    let worker = TcpStream::connect(register).await.expect("connect");
    let (mut wk_reader, mut wk_writer) = worker.into_split();
    write_command(
        &mut wk_writer,
        &Command::WorkerConnect(WorkerConnect {
            secret_key: "s1".to_string(),
        }),
    )
    .await
    .expect("register worker");
    assert_eq!(read_frame(&mut wk_reader).await, broadcast(&["10.0.0.1:2000"]));

    // Gateway disconnect triggers an empty broadcast.
    drop(gw_writer);
    drop(_gw_reader);
    assert_eq!(read_frame(&mut wk_reader).await, broadcast(&[]));
}

#[tokio::test]
async fn second_gateway_extends_the_broadcast_set() {
    let register = start_register("s1").await;

    let worker = TcpStream::connect(register).await.expect("connect");
    let (mut wk_reader, mut wk_writer) = worker.into_split();
    write_command(
        &mut wk_writer,
        &Command::WorkerConnect(WorkerConnect {
            secret_key: "s1".to_string(),
        }),
    )
    .await
    .expect("register worker");
    assert_eq!(read_frame(&mut wk_reader).await, broadcast(&[]));

    let mut gateways = Vec::new();
    for address in ["10.0.0.1:2000", "10.0.0.2:2000"] {
        let gateway = TcpStream::connect(register).await.expect("connect");
        let (reader, mut writer) = gateway.into_split();
        write_command(
            &mut writer,
            &Command::GatewayConnect(GatewayConnect {
                address: address.to_string(),
                secret_key: "s1".to_string(),
            }),
        )
        .await
        .expect("register gateway");
        gateways.push((reader, writer));
    }

    assert_eq!(read_frame(&mut wk_reader).await, broadcast(&["10.0.0.1:2000"]));
    assert_eq!(
        read_frame(&mut wk_reader).await,
        broadcast(&["10.0.0.1:2000", "10.0.0.2:2000"])
    );
}

#[tokio::test]
async fn wrong_secret_connection_is_closed() {
    let register = start_register("s1").await;
    let stream = TcpStream::connect(register).await.expect("connect");
    let (mut reader, mut writer) = stream.into_split();
    write_command(
        &mut writer,
        &Command::WorkerConnect(WorkerConnect {
            secret_key: "wrong".to_string(),
        }),
    )
    .await
    .expect("handshake");
    let eof = tokio::time::timeout(Duration::from_secs(2), read_command_default(&mut reader))
        .await
        .expect("closed in time")
        .expect("read");
    assert!(eof.is_none());
}

#[tokio::test]
async fn ping_keeps_an_authenticated_worker_alive() {
    let register = start_register("s1").await;
    let worker = TcpStream::connect(register).await.expect("connect");
    let (mut reader, mut writer) = worker.into_split();
    write_command(
        &mut writer,
        &Command::WorkerConnect(WorkerConnect {
            secret_key: "s1".to_string(),
        }),
    )
    .await
    .expect("register worker");
    assert_eq!(read_frame(&mut reader).await, broadcast(&[]));
    write_command(&mut writer, &Command::Ping).await.expect("ping");
    assert_eq!(read_frame(&mut reader).await, Command::Pong);
}
