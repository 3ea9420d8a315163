//! Message catalogue and inbound envelope.
//!
//! Every protocol message is a one-byte tag followed by its payload:
//!
//! ```text
//! [Tag(1)] [Payload(N)]
//! ```
//!
//! The transport collaborator frames messages this way; [`decode_frame`] and
//! [`encode_frame`] convert between frames and [`InboundMessage`]s.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Transport-assigned peer identifier.
pub type ClientId = u64;
/// Replicated object identifier, assigned by the server.
pub type NetworkId = u64;
/// Correlates an RPC request with its response.
pub type ResponseId = u64;

/// Identifier the server uses for itself.
pub const SERVER_CLIENT_ID: ClientId = 0;

/// Channel used for every internal protocol message.
pub const INTERNAL_CHANNEL: &str = "INTERNAL";

/// Which side of the connection an engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

/// Wire tag of a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    HailRequest = 0,
    HailResponse = 1,
    Greeting = 2,
    ConnectionRequest = 3,
    ConnectionApproved = 4,
    AddObject = 5,
    AddObjects = 6,
    DestroyObject = 7,
    DestroyObjects = 8,
    SwitchScene = 9,
    ClientSwitchSceneCompleted = 10,
    ChangeOwner = 11,
    TimeSync = 12,
    NetworkedVarDelta = 13,
    NetworkedVarUpdate = 14,
    ServerRpc = 15,
    ServerRpcRequest = 16,
    ServerRpcResponse = 17,
    ClientRpc = 18,
    ClientRpcRequest = 19,
    ClientRpcResponse = 20,
    UnnamedMessage = 21,
    NamedMessage = 22,
}

impl MessageType {
    pub const ALL: [MessageType; 23] = [
        MessageType::HailRequest,
        MessageType::HailResponse,
        MessageType::Greeting,
        MessageType::ConnectionRequest,
        MessageType::ConnectionApproved,
        MessageType::AddObject,
        MessageType::AddObjects,
        MessageType::DestroyObject,
        MessageType::DestroyObjects,
        MessageType::SwitchScene,
        MessageType::ClientSwitchSceneCompleted,
        MessageType::ChangeOwner,
        MessageType::TimeSync,
        MessageType::NetworkedVarDelta,
        MessageType::NetworkedVarUpdate,
        MessageType::ServerRpc,
        MessageType::ServerRpcRequest,
        MessageType::ServerRpcResponse,
        MessageType::ClientRpc,
        MessageType::ClientRpcRequest,
        MessageType::ClientRpcResponse,
        MessageType::UnnamedMessage,
        MessageType::NamedMessage,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(usize::from(tag)).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::HailRequest => "hail-request",
            MessageType::HailResponse => "hail-response",
            MessageType::Greeting => "greeting",
            MessageType::ConnectionRequest => "connection-request",
            MessageType::ConnectionApproved => "connection-approved",
            MessageType::AddObject => "add-object",
            MessageType::AddObjects => "add-objects",
            MessageType::DestroyObject => "destroy-object",
            MessageType::DestroyObjects => "destroy-objects",
            MessageType::SwitchScene => "switch-scene",
            MessageType::ClientSwitchSceneCompleted => "client-switch-scene-completed",
            MessageType::ChangeOwner => "change-owner",
            MessageType::TimeSync => "time-sync",
            MessageType::NetworkedVarDelta => "networked-var-delta",
            MessageType::NetworkedVarUpdate => "networked-var-update",
            MessageType::ServerRpc => "server-rpc",
            MessageType::ServerRpcRequest => "server-rpc-request",
            MessageType::ServerRpcResponse => "server-rpc-response",
            MessageType::ClientRpc => "client-rpc",
            MessageType::ClientRpcRequest => "client-rpc-request",
            MessageType::ClientRpcResponse => "client-rpc-response",
            MessageType::UnnamedMessage => "unnamed-message",
            MessageType::NamedMessage => "named-message",
        }
    }

    /// Whether an engine running `role` accepts this message.
    pub fn handled_by(self, role: Role) -> bool {
        use MessageType::*;
        match self {
            NetworkedVarDelta | NetworkedVarUpdate | UnnamedMessage | NamedMessage => true,
            HailResponse | ConnectionRequest | ClientSwitchSceneCompleted | ServerRpc
            | ServerRpcRequest | ClientRpcResponse => role == Role::Server,
            HailRequest | Greeting | ConnectionApproved | AddObject | AddObjects
            | DestroyObject | DestroyObjects | SwitchScene | ChangeOwner | TimeSync
            | ClientRpc | ClientRpcRequest | ServerRpcResponse => role == Role::Client,
        }
    }

    /// Messages a server accepts from a peer that has not finished connecting.
    pub fn allowed_while_pending(self) -> bool {
        matches!(
            self,
            MessageType::HailResponse | MessageType::ConnectionRequest
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self> {
        Self::from_tag(tag).ok_or(ProtocolError::UnknownMessageType(tag))
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Send flags carried alongside a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SecurityFlags(u8);

impl SecurityFlags {
    pub const NONE: SecurityFlags = SecurityFlags(0);
    pub const ENCRYPTED: SecurityFlags = SecurityFlags(0b01);
    pub const AUTHENTICATED: SecurityFlags = SecurityFlags(0b10);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        SecurityFlags(bits & 0b11)
    }

    pub fn contains(self, other: SecurityFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the payload is sealed with the session cipher.
    pub fn is_sealed(self) -> bool {
        self.0 != 0
    }
}

impl std::ops::BitOr for SecurityFlags {
    type Output = SecurityFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        SecurityFlags(self.0 | rhs.0)
    }
}

/// One message handed to the engine by the transport collaborator.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub sender: ClientId,
    pub message_type: MessageType,
    pub channel: String,
    pub security: SecurityFlags,
    pub payload: Bytes,
    /// Local time (seconds) at which the transport received the message
    pub receive_time: f32,
}

impl InboundMessage {
    pub fn new(sender: ClientId, message_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            sender,
            message_type,
            channel: INTERNAL_CHANNEL.to_string(),
            security: SecurityFlags::NONE,
            payload: payload.into(),
            receive_time: 0.0,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_security(mut self, security: SecurityFlags) -> Self {
        self.security = security;
        self
    }

    pub fn with_receive_time(mut self, receive_time: f32) -> Self {
        self.receive_time = receive_time;
        self
    }
}

/// Split a `[tag][payload]` frame into an inbound message.
pub fn decode_frame(sender: ClientId, mut frame: Bytes) -> Result<InboundMessage> {
    if frame.is_empty() {
        return Err(ProtocolError::TruncatedInput {
            needed: 1,
            remaining: 0,
        });
    }
    let tag = frame.split_to(1)[0];
    let message_type = MessageType::try_from(tag)?;
    Ok(InboundMessage::new(sender, message_type, frame))
}

/// Prefix a payload with its tag.
pub fn encode_frame(message_type: MessageType, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(1 + payload.len());
    frame.put_u8(message_type.tag());
    frame.put_slice(payload);
    frame.freeze()
}
