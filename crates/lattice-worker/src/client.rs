// Control-only connection to one gateway, used for synchronous queries
// against its tables. Authenticates with the control handshake, so the
// gateway never routes client events here and every read is a reply to
// the query just written.
use lattice_common::framed::{read_command, write_command};
use lattice_wire::{
    Command, GatewayClientConnect, GetClientCountByGroup, GetClientIdsByUid,
    GetSessionByClientId, GetSessionsByGroup, IsOnline, Select, SelectField, SelectFilter,
    SelectResult, Session,
};
use std::collections::BTreeMap;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::{Result, WorkerError};

pub struct GatewayClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    max_frame_bytes: usize,
}

impl GatewayClient {
    /// Dials a gateway's internal address and sends the control
    /// handshake. An invalid secret surfaces as a closed connection on
    /// the first query.
    pub async fn connect(address: &str, secret_key: &str) -> Result<Self> {
        Self::connect_with_cap(address, secret_key, lattice_wire::DEFAULT_MAX_FRAME_BYTES).await
    }

    pub async fn connect_with_cap(
        address: &str,
        secret_key: &str,
        max_frame_bytes: usize,
    ) -> Result<Self> {
        let stream = TcpStream::connect(address).await?;
        let (reader, mut writer) = stream.into_split();
        write_command(
            &mut writer,
            &Command::GatewayClientConnect(GatewayClientConnect {
                secret_key: secret_key.to_string(),
            }),
        )
        .await?;
        Ok(Self {
            reader,
            writer,
            max_frame_bytes,
        })
    }

    /// One request/reply round trip.
    pub async fn query(&mut self, command: Command) -> Result<Command> {
        write_command(&mut self.writer, &command).await?;
        match read_command(&mut self.reader, self.max_frame_bytes).await? {
            Some(reply) => Ok(reply),
            None => Err(WorkerError::HandshakeRejected),
        }
    }

    pub async fn is_online(&mut self, fd: u64) -> Result<bool> {
        match self.query(Command::IsOnline(IsOnline { fd })).await? {
            Command::IsOnlineResult(body) => Ok(body.online),
            other => Err(WorkerError::UnexpectedReply(other.code())),
        }
    }

    pub async fn get_all_sessions(&mut self) -> Result<BTreeMap<u64, Session>> {
        match self.query(Command::GetAllSessions).await? {
            Command::AllSessions(body) => Ok(body.sessions),
            other => Err(WorkerError::UnexpectedReply(other.code())),
        }
    }

    pub async fn get_session_by_client_id(&mut self, fd: u64) -> Result<Option<Session>> {
        match self
            .query(Command::GetSessionByClientId(GetSessionByClientId { fd }))
            .await?
        {
            Command::SessionByClientId(body) => Ok(body.session),
            other => Err(WorkerError::UnexpectedReply(other.code())),
        }
    }

    pub async fn get_client_ids_by_uid(&mut self, uid: &str) -> Result<Vec<u64>> {
        match self
            .query(Command::GetClientIdsByUid(GetClientIdsByUid {
                uid: uid.to_string(),
            }))
            .await?
        {
            Command::ClientIdsByUid(body) => Ok(body.fds),
            other => Err(WorkerError::UnexpectedReply(other.code())),
        }
    }

    pub async fn get_sessions_by_group(&mut self, group: &str) -> Result<BTreeMap<u64, Session>> {
        match self
            .query(Command::GetSessionsByGroup(GetSessionsByGroup {
                group: group.to_string(),
            }))
            .await?
        {
            Command::SessionsByGroup(body) => Ok(body.sessions),
            other => Err(WorkerError::UnexpectedReply(other.code())),
        }
    }

    pub async fn get_client_count_by_group(&mut self, group: &str) -> Result<u64> {
        match self
            .query(Command::GetClientCountByGroup(GetClientCountByGroup {
                group: group.to_string(),
            }))
            .await?
        {
            Command::ClientCountByGroup(body) => Ok(body.count),
            other => Err(WorkerError::UnexpectedReply(other.code())),
        }
    }

    pub async fn get_group_id_list(&mut self) -> Result<Vec<String>> {
        match self.query(Command::GetGroupIdList).await? {
            Command::GroupIdList(body) => Ok(body.groups),
            other => Err(WorkerError::UnexpectedReply(other.code())),
        }
    }

    pub async fn select(
        &mut self,
        fields: Vec<SelectField>,
        filter: SelectFilter,
    ) -> Result<SelectResult> {
        match self.query(Command::Select(Select { fields, filter })).await? {
            Command::SelectResult(body) => Ok(body),
            other => Err(WorkerError::UnexpectedReply(other.code())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::framed::read_command_default;
    use lattice_wire::{AllSessions, IsOnlineResult};
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn query_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (mut reader, mut writer) = stream.into_split();
            let handshake = read_command_default(&mut reader)
                .await
                .expect("read")
                .expect("frame");
            assert_eq!(
                handshake,
                Command::GatewayClientConnect(GatewayClientConnect {
                    secret_key: "gw-secret".to_string(),
                })
            );
            let query = read_command_default(&mut reader)
                .await
                .expect("read")
                .expect("frame");
            assert_eq!(query, Command::IsOnline(IsOnline { fd: 3 }));
            write_command(
                &mut writer,
                &Command::IsOnlineResult(IsOnlineResult { online: true }),
            )
            .await
            .expect("reply");
        });

        let mut client = GatewayClient::connect(&addr, "gw-secret")
            .await
            .expect("connect");
        let online = tokio::time::timeout(Duration::from_secs(1), client.is_online(3))
            .await
            .expect("reply in time")
            .expect("query");
        assert!(online);
        server.await.expect("server");
    }

    #[tokio::test]
    async fn mismatched_reply_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (mut reader, mut writer) = stream.into_split();
            let _handshake = read_command_default(&mut reader).await.expect("read");
            let _query = read_command_default(&mut reader).await.expect("read");
            write_command(
                &mut writer,
                &Command::AllSessions(AllSessions {
                    sessions: BTreeMap::new(),
                }),
            )
            .await
            .expect("reply");
        });

        let mut client = GatewayClient::connect(&addr, "gw-secret")
            .await
            .expect("connect");
        let err = tokio::time::timeout(Duration::from_secs(1), client.is_online(3))
            .await
            .expect("reply in time")
            .expect_err("mismatch");
        assert!(matches!(err, WorkerError::UnexpectedReply(_)));
    }

    #[tokio::test]
    async fn closed_connection_surfaces_as_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            drop(stream);
        });
        let mut client = GatewayClient::connect(&addr, "nope").await.expect("connect");
        let err = client.is_online(1).await.expect_err("closed");
        assert!(matches!(
            err,
            WorkerError::HandshakeRejected | WorkerError::Io(_) | WorkerError::Link(_)
        ));
    }
}
