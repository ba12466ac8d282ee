// Binary wire protocol shared by the register, gateway and worker roles.
//
// Every frame is `[u32 length][u16 command][body]`, both integers
// big-endian, where `length` counts the whole frame including the 6-byte
// header. The body is a JSON document whose shape is fixed per command
// code; raw byte payloads travel base64-encoded inside it.
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fixed frame header size; never extended. Per-message metadata such as
/// session data travels inside the body, not the header.
pub const HEAD_LEN: usize = 6;

/// Default cap enforced by the framed readers before allocating a body.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("incomplete frame")]
    Incomplete,
    #[error("frame length mismatch (declared {declared}, buffer {actual})")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("frame too large ({0} bytes)")]
    FrameTooLarge(usize),
    #[error("unknown command code {0}")]
    UnknownCommand(u16),
    #[error("failed to serialize command body")]
    Serialize(#[source] serde_json::Error),
    #[error("malformed body for command {cmd}")]
    Body {
        cmd: u16,
        #[source]
        source: serde_json::Error,
    },
}

/// Command codes, fixed for interoperability with any peer implementing
/// this protocol.
pub mod code {
    pub const ON_CONNECT: u16 = 1;
    pub const ON_MESSAGE: u16 = 3;
    pub const ON_CLOSE: u16 = 4;
    pub const SEND_TO_ONE: u16 = 5;
    pub const SEND_TO_ALL: u16 = 6;
    pub const KICK: u16 = 7;
    pub const DESTROY: u16 = 8;
    pub const UPDATE_SESSION: u16 = 9;
    pub const GET_ALL_SESSIONS: u16 = 10;
    pub const IS_ONLINE: u16 = 11;
    pub const BIND_UID: u16 = 12;
    pub const UNBIND_UID: u16 = 13;
    pub const SEND_TO_UID: u16 = 14;
    pub const GET_CLIENT_IDS_BY_UID: u16 = 15;
    pub const JOIN_GROUP: u16 = 20;
    pub const LEAVE_GROUP: u16 = 21;
    pub const SEND_TO_GROUP: u16 = 22;
    pub const GET_SESSIONS_BY_GROUP: u16 = 23;
    pub const GET_CLIENT_COUNT_BY_GROUP: u16 = 24;
    pub const SELECT: u16 = 25;
    pub const GET_GROUP_ID_LIST: u16 = 26;
    pub const UNGROUP: u16 = 27;
    pub const WORKER_CONNECT: u16 = 200;
    pub const PING: u16 = 201;
    pub const GATEWAY_CLIENT_CONNECT: u16 = 202;
    pub const GET_SESSION_BY_CLIENT_ID: u16 = 203;
    pub const SET_SESSION: u16 = 204;
    pub const ON_WEBSOCKET_CONNECT: u16 = 205;
    pub const GATEWAY_CONNECT: u16 = 206;
    pub const BROADCAST_ADDRESSES: u16 = 207;
    pub const PONG: u16 = 208;
}

/// Arbitrary key/value bag attached to a client connection and carried as
/// `ext_data` on client-originated events. The gateway never interprets it.
pub type Session = serde_json::Map<String, serde_json::Value>;

/// Returns the declared length of the frame at the head of `buffer`, or 0
/// when fewer than `HEAD_LEN` bytes are available. The caller's transport
/// is responsible for buffering until that many bytes have arrived.
pub fn frame_length(buffer: &[u8]) -> usize {
    if buffer.len() < HEAD_LEN {
        return 0;
    }
    u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize
}

// Lifecycle events pushed to a worker.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnConnect {
    pub fd: u64,
    pub ext_data: Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnMessage {
    pub fd: u64,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub ext_data: Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnClose {
    pub fd: u64,
    pub ext_data: Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnWebsocketConnect {
    pub fd: u64,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub ext_data: Session,
}

// Control commands pushed to a gateway.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendToOne {
    pub fd: u64,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendToAll {
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub exclude: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kick {
    pub fd: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destroy {
    pub fd: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSession {
    pub fd: u64,
    pub session: Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetSession {
    pub fd: u64,
    pub session: Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsOnline {
    pub fd: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsOnlineResult {
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindUid {
    pub fd: u64,
    pub uid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbindUid {
    pub fd: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendToUid {
    pub uid: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetClientIdsByUid {
    pub uid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdsByUid {
    pub fds: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinGroup {
    pub fd: u64,
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveGroup {
    pub fd: u64,
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendToGroup {
    pub group: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub exclude: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSessionsByGroup {
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionsByGroup {
    pub sessions: BTreeMap<u64, Session>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetClientCountByGroup {
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCountByGroup {
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllSessions {
    pub sessions: BTreeMap<u64, Session>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupIdList {
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ungroup {
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSessionByClientId {
    pub fd: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionByClientId {
    pub session: Option<Session>,
}

/// Field selector for `Select` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectField {
    Uid,
    Session,
    Groups,
}

/// Match criteria for `Select`. Empty criteria match every client;
/// otherwise a client matches when it appears in any listed fd, uid or
/// group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectFilter {
    #[serde(default)]
    pub fds: Vec<u64>,
    #[serde(default)]
    pub uids: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Select {
    pub fields: Vec<SelectField>,
    pub filter: SelectFilter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectRow {
    pub fd: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectResult {
    pub rows: Vec<SelectRow>,
}

// Coordination commands shared by all roles.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConnect {
    pub secret_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayClientConnect {
    pub secret_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConnect {
    pub address: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastAddresses {
    pub addresses: Vec<String>,
}

/// One decoded frame: the command taxonomy shared by all three roles,
/// keyed by the fixed u16 codes in [`code`]. Query codes carry both a
/// request and a response shape; `decode` disambiguates by body shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    OnConnect(OnConnect),
    OnMessage(OnMessage),
    OnClose(OnClose),
    OnWebsocketConnect(OnWebsocketConnect),
    SendToOne(SendToOne),
    SendToAll(SendToAll),
    Kick(Kick),
    Destroy(Destroy),
    UpdateSession(UpdateSession),
    SetSession(SetSession),
    GetAllSessions,
    AllSessions(AllSessions),
    IsOnline(IsOnline),
    IsOnlineResult(IsOnlineResult),
    BindUid(BindUid),
    UnbindUid(UnbindUid),
    SendToUid(SendToUid),
    GetClientIdsByUid(GetClientIdsByUid),
    ClientIdsByUid(ClientIdsByUid),
    JoinGroup(JoinGroup),
    LeaveGroup(LeaveGroup),
    SendToGroup(SendToGroup),
    GetSessionsByGroup(GetSessionsByGroup),
    SessionsByGroup(SessionsByGroup),
    GetClientCountByGroup(GetClientCountByGroup),
    ClientCountByGroup(ClientCountByGroup),
    Select(Select),
    SelectResult(SelectResult),
    GetGroupIdList,
    GroupIdList(GroupIdList),
    Ungroup(Ungroup),
    GetSessionByClientId(GetSessionByClientId),
    SessionByClientId(SessionByClientId),
    WorkerConnect(WorkerConnect),
    GatewayClientConnect(GatewayClientConnect),
    GatewayConnect(GatewayConnect),
    BroadcastAddresses(BroadcastAddresses),
    Ping,
    Pong,
}

impl Command {
    /// The on-wire command code for this frame.
    pub fn code(&self) -> u16 {
        match self {
            Command::OnConnect(_) => code::ON_CONNECT,
            Command::OnMessage(_) => code::ON_MESSAGE,
            Command::OnClose(_) => code::ON_CLOSE,
            Command::OnWebsocketConnect(_) => code::ON_WEBSOCKET_CONNECT,
            Command::SendToOne(_) => code::SEND_TO_ONE,
            Command::SendToAll(_) => code::SEND_TO_ALL,
            Command::Kick(_) => code::KICK,
            Command::Destroy(_) => code::DESTROY,
            Command::UpdateSession(_) => code::UPDATE_SESSION,
            Command::SetSession(_) => code::SET_SESSION,
            Command::GetAllSessions | Command::AllSessions(_) => code::GET_ALL_SESSIONS,
            Command::IsOnline(_) | Command::IsOnlineResult(_) => code::IS_ONLINE,
            Command::BindUid(_) => code::BIND_UID,
            Command::UnbindUid(_) => code::UNBIND_UID,
            Command::SendToUid(_) => code::SEND_TO_UID,
            Command::GetClientIdsByUid(_) | Command::ClientIdsByUid(_) => {
                code::GET_CLIENT_IDS_BY_UID
            }
            Command::JoinGroup(_) => code::JOIN_GROUP,
            Command::LeaveGroup(_) => code::LEAVE_GROUP,
            Command::SendToGroup(_) => code::SEND_TO_GROUP,
            Command::GetSessionsByGroup(_) | Command::SessionsByGroup(_) => {
                code::GET_SESSIONS_BY_GROUP
            }
            Command::GetClientCountByGroup(_) | Command::ClientCountByGroup(_) => {
                code::GET_CLIENT_COUNT_BY_GROUP
            }
            Command::Select(_) | Command::SelectResult(_) => code::SELECT,
            Command::GetGroupIdList | Command::GroupIdList(_) => code::GET_GROUP_ID_LIST,
            Command::Ungroup(_) => code::UNGROUP,
            Command::GetSessionByClientId(_) | Command::SessionByClientId(_) => {
                code::GET_SESSION_BY_CLIENT_ID
            }
            Command::WorkerConnect(_) => code::WORKER_CONNECT,
            Command::GatewayClientConnect(_) => code::GATEWAY_CLIENT_CONNECT,
            Command::GatewayConnect(_) => code::GATEWAY_CONNECT,
            Command::BroadcastAddresses(_) => code::BROADCAST_ADDRESSES,
            Command::Ping => code::PING,
            Command::Pong => code::PONG,
        }
    }

    /// Serializes this command into a complete frame.
    pub fn encode(&self) -> Result<Bytes> {
        let body = self.encode_body()?;
        let length = HEAD_LEN + body.len();
        if length > u32::MAX as usize {
            return Err(Error::FrameTooLarge(length));
        }
        let mut buf = BytesMut::with_capacity(length);
        buf.put_u32(length as u32);
        buf.put_u16(self.code());
        buf.extend_from_slice(&body);
        Ok(buf.freeze())
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        let json = |value: serde_json::Result<Vec<u8>>| value.map_err(Error::Serialize);
        match self {
            Command::OnConnect(body) => json(serde_json::to_vec(body)),
            Command::OnMessage(body) => json(serde_json::to_vec(body)),
            Command::OnClose(body) => json(serde_json::to_vec(body)),
            Command::OnWebsocketConnect(body) => json(serde_json::to_vec(body)),
            Command::SendToOne(body) => json(serde_json::to_vec(body)),
            Command::SendToAll(body) => json(serde_json::to_vec(body)),
            Command::Kick(body) => json(serde_json::to_vec(body)),
            Command::Destroy(body) => json(serde_json::to_vec(body)),
            Command::UpdateSession(body) => json(serde_json::to_vec(body)),
            Command::SetSession(body) => json(serde_json::to_vec(body)),
            Command::AllSessions(body) => json(serde_json::to_vec(body)),
            Command::IsOnline(body) => json(serde_json::to_vec(body)),
            Command::IsOnlineResult(body) => json(serde_json::to_vec(body)),
            Command::BindUid(body) => json(serde_json::to_vec(body)),
            Command::UnbindUid(body) => json(serde_json::to_vec(body)),
            Command::SendToUid(body) => json(serde_json::to_vec(body)),
            Command::GetClientIdsByUid(body) => json(serde_json::to_vec(body)),
            Command::ClientIdsByUid(body) => json(serde_json::to_vec(body)),
            Command::JoinGroup(body) => json(serde_json::to_vec(body)),
            Command::LeaveGroup(body) => json(serde_json::to_vec(body)),
            Command::SendToGroup(body) => json(serde_json::to_vec(body)),
            Command::GetSessionsByGroup(body) => json(serde_json::to_vec(body)),
            Command::SessionsByGroup(body) => json(serde_json::to_vec(body)),
            Command::GetClientCountByGroup(body) => json(serde_json::to_vec(body)),
            Command::ClientCountByGroup(body) => json(serde_json::to_vec(body)),
            Command::Select(body) => json(serde_json::to_vec(body)),
            Command::SelectResult(body) => json(serde_json::to_vec(body)),
            Command::GroupIdList(body) => json(serde_json::to_vec(body)),
            Command::Ungroup(body) => json(serde_json::to_vec(body)),
            Command::GetSessionByClientId(body) => json(serde_json::to_vec(body)),
            Command::SessionByClientId(body) => json(serde_json::to_vec(body)),
            Command::WorkerConnect(body) => json(serde_json::to_vec(body)),
            Command::GatewayClientConnect(body) => json(serde_json::to_vec(body)),
            Command::GatewayConnect(body) => json(serde_json::to_vec(body)),
            Command::BroadcastAddresses(body) => json(serde_json::to_vec(body)),
            Command::GetAllSessions
            | Command::GetGroupIdList
            | Command::Ping
            | Command::Pong => Ok(b"{}".to_vec()),
        }
    }

    /// Decodes one complete frame. The buffer must hold exactly one frame;
    /// any header/body inconsistency is a malformed-frame condition and the
    /// caller is expected to close the connection.
    pub fn decode(buffer: &[u8]) -> Result<Command> {
        if buffer.len() < HEAD_LEN {
            return Err(Error::Incomplete);
        }
        let declared = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        if declared as usize != buffer.len() {
            return Err(Error::LengthMismatch {
                declared,
                actual: buffer.len(),
            });
        }
        let cmd = u16::from_be_bytes([buffer[4], buffer[5]]);
        let body = &buffer[HEAD_LEN..];
        Self::decode_body(cmd, body)
    }

    fn decode_body(cmd: u16, body: &[u8]) -> Result<Command> {
        fn parse<T: for<'de> Deserialize<'de>>(cmd: u16, body: &[u8]) -> Result<T> {
            serde_json::from_slice(body).map_err(|source| Error::Body { cmd, source })
        }
        // Query codes are shared between a request and a response body;
        // whichever shape deserializes wins, response first where the
        // request shape would also accept the response document. Codes
        // whose request body carries no fields still require a JSON
        // body; anything undeserializable is a malformed frame.
        let command = match cmd {
            code::ON_CONNECT => Command::OnConnect(parse(cmd, body)?),
            code::ON_MESSAGE => Command::OnMessage(parse(cmd, body)?),
            code::ON_CLOSE => Command::OnClose(parse(cmd, body)?),
            code::ON_WEBSOCKET_CONNECT => Command::OnWebsocketConnect(parse(cmd, body)?),
            code::SEND_TO_ONE => Command::SendToOne(parse(cmd, body)?),
            code::SEND_TO_ALL => Command::SendToAll(parse(cmd, body)?),
            code::KICK => Command::Kick(parse(cmd, body)?),
            code::DESTROY => Command::Destroy(parse(cmd, body)?),
            code::UPDATE_SESSION => Command::UpdateSession(parse(cmd, body)?),
            code::SET_SESSION => Command::SetSession(parse(cmd, body)?),
            code::GET_ALL_SESSIONS => match parse::<AllSessions>(cmd, body) {
                Ok(reply) => Command::AllSessions(reply),
                Err(_) => {
                    parse::<serde_json::Value>(cmd, body)?;
                    Command::GetAllSessions
                }
            },
            code::IS_ONLINE => match parse::<IsOnlineResult>(cmd, body) {
                Ok(reply) => Command::IsOnlineResult(reply),
                Err(_) => Command::IsOnline(parse(cmd, body)?),
            },
            code::BIND_UID => Command::BindUid(parse(cmd, body)?),
            code::UNBIND_UID => Command::UnbindUid(parse(cmd, body)?),
            code::SEND_TO_UID => Command::SendToUid(parse(cmd, body)?),
            code::GET_CLIENT_IDS_BY_UID => match parse::<ClientIdsByUid>(cmd, body) {
                Ok(reply) => Command::ClientIdsByUid(reply),
                Err(_) => Command::GetClientIdsByUid(parse(cmd, body)?),
            },
            code::JOIN_GROUP => Command::JoinGroup(parse(cmd, body)?),
            code::LEAVE_GROUP => Command::LeaveGroup(parse(cmd, body)?),
            code::SEND_TO_GROUP => Command::SendToGroup(parse(cmd, body)?),
            code::GET_SESSIONS_BY_GROUP => match parse::<SessionsByGroup>(cmd, body) {
                Ok(reply) => Command::SessionsByGroup(reply),
                Err(_) => Command::GetSessionsByGroup(parse(cmd, body)?),
            },
            code::GET_CLIENT_COUNT_BY_GROUP => match parse::<ClientCountByGroup>(cmd, body) {
                Ok(reply) => Command::ClientCountByGroup(reply),
                Err(_) => Command::GetClientCountByGroup(parse(cmd, body)?),
            },
            code::SELECT => match parse::<SelectResult>(cmd, body) {
                Ok(reply) => Command::SelectResult(reply),
                Err(_) => Command::Select(parse(cmd, body)?),
            },
            code::GET_GROUP_ID_LIST => match parse::<GroupIdList>(cmd, body) {
                Ok(reply) => Command::GroupIdList(reply),
                Err(_) => {
                    parse::<serde_json::Value>(cmd, body)?;
                    Command::GetGroupIdList
                }
            },
            code::UNGROUP => Command::Ungroup(parse(cmd, body)?),
            // Request first: the reply's only field is optional, so it
            // would otherwise swallow request bodies.
            code::GET_SESSION_BY_CLIENT_ID => match parse::<GetSessionByClientId>(cmd, body) {
                Ok(request) => Command::GetSessionByClientId(request),
                Err(_) => Command::SessionByClientId(parse(cmd, body)?),
            },
            code::WORKER_CONNECT => Command::WorkerConnect(parse(cmd, body)?),
            code::GATEWAY_CLIENT_CONNECT => Command::GatewayClientConnect(parse(cmd, body)?),
            code::GATEWAY_CONNECT => Command::GatewayConnect(parse(cmd, body)?),
            code::BROADCAST_ADDRESSES => Command::BroadcastAddresses(parse(cmd, body)?),
            code::PING => {
                parse::<serde_json::Value>(cmd, body)?;
                Command::Ping
            }
            code::PONG => {
                parse::<serde_json::Value>(cmd, body)?;
                Command::Pong
            }
            other => return Err(Error::UnknownCommand(other)),
        };
        Ok(command)
    }
}

mod base64_bytes {
    use super::*;
    use serde::de::Error;

    // Encode Vec<u8> as base64 string for JSON bodies.
    pub fn serialize<S>(value: &Vec<u8>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    // Decode base64 string into Vec<u8>.
    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(pairs: &[(&str, &str)]) -> Session {
        let mut map = Session::new();
        for (key, value) in pairs {
            map.insert((*key).to_string(), serde_json::json!(value));
        }
        map
    }

    #[test]
    fn round_trip_preserves_command() {
        let commands = vec![
            Command::OnConnect(OnConnect {
                fd: 7,
                ext_data: session(&[("room", "lobby")]),
            }),
            Command::OnMessage(OnMessage {
                fd: 7,
                payload: b"hello".to_vec(),
                ext_data: Session::new(),
            }),
            Command::SendToGroup(SendToGroup {
                group: "g1".to_string(),
                payload: vec![0, 159, 146, 150],
                exclude: vec![3],
            }),
            Command::BindUid(BindUid {
                fd: 9,
                uid: "u-42".to_string(),
            }),
            Command::GatewayConnect(GatewayConnect {
                address: "10.0.0.1:2000".to_string(),
                secret_key: "s1".to_string(),
            }),
            Command::BroadcastAddresses(BroadcastAddresses {
                addresses: vec!["10.0.0.1:2000".to_string()],
            }),
            Command::Ping,
            Command::Pong,
        ];
        for command in commands {
            let encoded = command.encode().expect("encode");
            let decoded = Command::decode(&encoded).expect("decode");
            assert_eq!(decoded, command);
        }
    }

    #[test]
    fn frame_length_matches_encoded_length() {
        let frame = Command::Ping.encode().expect("encode");
        assert_eq!(frame_length(&frame), frame.len());
    }

    #[test]
    fn frame_length_needs_six_bytes() {
        assert_eq!(frame_length(b""), 0);
        assert_eq!(frame_length(b"\x00\x00\x00\x08\x00"), 0);
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut frame = Command::Ping.encode().expect("encode").to_vec();
        frame.push(0);
        let err = Command::decode(&frame).expect_err("length mismatch");
        assert!(matches!(err, Error::LengthMismatch { .. }));
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let err = Command::decode(b"\x00\x00").expect_err("incomplete");
        assert!(matches!(err, Error::Incomplete));
    }

    #[test]
    fn decode_rejects_unknown_command() {
        let mut buf = BytesMut::new();
        buf.put_u32((HEAD_LEN + 2) as u32);
        buf.put_u16(999);
        buf.extend_from_slice(b"{}");
        let err = Command::decode(&buf).expect_err("unknown");
        assert!(matches!(err, Error::UnknownCommand(999)));
    }

    #[test]
    fn decode_rejects_garbage_body() {
        let mut buf = BytesMut::new();
        buf.put_u32((HEAD_LEN + 4) as u32);
        buf.put_u16(code::SEND_TO_ONE);
        buf.extend_from_slice(b"zzzz");
        let err = Command::decode(&buf).expect_err("bad body");
        assert!(matches!(err, Error::Body { cmd, .. } if cmd == code::SEND_TO_ONE));
    }

    #[test]
    fn field_less_codes_still_require_a_json_body() {
        for cmd in [code::GET_ALL_SESSIONS, code::GET_GROUP_ID_LIST, code::PING, code::PONG] {
            let mut buf = BytesMut::new();
            buf.put_u32((HEAD_LEN + 4) as u32);
            buf.put_u16(cmd);
            buf.extend_from_slice(b"zzzz");
            let err = Command::decode(&buf).expect_err("bad body");
            assert!(matches!(err, Error::Body { cmd: got, .. } if got == cmd));
        }
        // The empty-object body every peer actually sends stays valid.
        let frame = Command::GetAllSessions.encode().expect("encode");
        assert_eq!(Command::decode(&frame).expect("decode"), Command::GetAllSessions);
        let frame = Command::GetGroupIdList.encode().expect("encode");
        assert_eq!(Command::decode(&frame).expect("decode"), Command::GetGroupIdList);
    }

    #[test]
    fn query_codes_disambiguate_request_and_reply() {
        let request = Command::IsOnline(IsOnline { fd: 3 });
        let reply = Command::IsOnlineResult(IsOnlineResult { online: true });
        assert_eq!(request.code(), reply.code());
        assert_eq!(
            Command::decode(&request.encode().expect("encode")).expect("decode"),
            request
        );
        assert_eq!(
            Command::decode(&reply.encode().expect("encode")).expect("decode"),
            reply
        );
    }

    #[test]
    fn session_query_prefers_request_shape() {
        let request = Command::GetSessionByClientId(GetSessionByClientId { fd: 11 });
        let reply = Command::SessionByClientId(SessionByClientId {
            session: Some(session(&[("k", "v")])),
        });
        assert_eq!(
            Command::decode(&request.encode().expect("encode")).expect("decode"),
            request
        );
        assert_eq!(
            Command::decode(&reply.encode().expect("encode")).expect("decode"),
            reply
        );
    }

    #[test]
    fn unit_queries_round_trip() {
        for command in [Command::GetAllSessions, Command::GetGroupIdList] {
            let encoded = command.encode().expect("encode");
            assert_eq!(Command::decode(&encoded).expect("decode"), command);
        }
        let reply = Command::AllSessions(AllSessions {
            sessions: BTreeMap::from([(4, session(&[("a", "b")]))]),
        });
        assert_eq!(
            Command::decode(&reply.encode().expect("encode")).expect("decode"),
            reply
        );
    }

    #[test]
    fn payload_survives_base64_round_trip() {
        let payload: Vec<u8> = (0u8..=255).collect();
        let command = Command::SendToOne(SendToOne { fd: 1, payload });
        let decoded = Command::decode(&command.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, command);
    }

    #[test]
    fn header_is_big_endian_and_six_bytes() {
        let frame = Command::SendToOne(SendToOne {
            fd: 1,
            payload: b"x".to_vec(),
        })
        .encode()
        .expect("encode");
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let cmd = u16::from_be_bytes([frame[4], frame[5]]);
        assert_eq!(declared, frame.len());
        assert_eq!(cmd, code::SEND_TO_ONE);
    }
}
