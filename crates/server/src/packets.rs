//! Wire packets and the kind tree they hang off.
//!
//! ```text
//! any
//! ├── client
//! │   ├── ping
//! │   ├── hello
//! │   └── room
//! │       ├── join_room
//! │       └── send_message
//! └── server
//! ```

use std::sync::Arc;

use chatfront_common::GatewayResult;
use chatfront_pipeline::{AnyPacket, Packet, PacketKind, PacketType};
use serde::{Deserialize, Serialize};

/// Everything a client may send.
pub struct ClientPacket;
impl PacketType for ClientPacket {
    const KIND: PacketKind = PacketKind::child("client", &AnyPacket::KIND);
}

/// Client packets addressed to a room.
pub struct RoomPacket;
impl PacketType for RoomPacket {
    const KIND: PacketKind = PacketKind::child("room", &ClientPacket::KIND);
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ping {
    #[serde(default)]
    pub nonce: Option<u64>,
}
impl PacketType for Ping {
    const KIND: PacketKind = PacketKind::child("ping", &ClientPacket::KIND);
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    pub name: String,
}
impl PacketType for Hello {
    const KIND: PacketKind = PacketKind::child("hello", &ClientPacket::KIND);
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinRoom {
    pub room: String,
}
impl PacketType for JoinRoom {
    const KIND: PacketKind = PacketKind::child("join_room", &RoomPacket::KIND);
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessage {
    pub room: String,
    pub text: String,
}
impl PacketType for SendMessage {
    const KIND: PacketKind = PacketKind::child("send_message", &RoomPacket::KIND);
}

/// Inbound frame: one JSON object per line, tagged by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Ping(Ping),
    Hello(Hello),
    JoinRoom(JoinRoom),
    SendMessage(SendMessage),
}

impl Inbound {
    pub fn into_packet(self) -> Arc<dyn Packet> {
        match self {
            Inbound::Ping(p) => Arc::new(p),
            Inbound::Hello(p) => Arc::new(p),
            Inbound::JoinRoom(p) => Arc::new(p),
            Inbound::SendMessage(p) => Arc::new(p),
        }
    }
}

/// Parse one frame, without its trailing newline.
pub fn decode_frame(line: &str) -> GatewayResult<Arc<dyn Packet>> {
    let inbound: Inbound = serde_json::from_str(line)?;
    Ok(inbound.into_packet())
}

/// Frames the server sends back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Pong {
        nonce: Option<u64>,
    },
    Welcome {
        client_id: String,
        name: String,
    },
    Joined {
        room: String,
        members: usize,
        /// Latest message in the room, if it is still remembered.
        #[serde(skip_serializing_if = "Option::is_none")]
        last_message: Option<Box<Outbound>>,
    },
    Message {
        room: String,
        from: String,
        text: String,
        sent_at: String,
    },
    RateLimited {
        retry_after_ms: u64,
    },
    Error {
        message: String,
    },
}

impl PacketType for Outbound {
    const KIND: PacketKind = PacketKind::child("server", &AnyPacket::KIND);
}

impl Outbound {
    pub fn error(message: impl Into<String>) -> Self {
        Outbound::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> GatewayResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
