//! Wire frames.
//!
//! Every frame is a MessagePack map whose `type` key names the variant in
//! snake case, e.g. `{"type": "batch", "room": "lobby", "payload": <bin>}`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Version announced in [`Frame::Connected`].
pub const PROTOCOL_VERSION: u8 = 1;

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// The frame could not be decoded or is not accepted from clients.
    pub const INVALID_FRAME: u16 = 1001;
    /// The room could not be joined.
    pub const SUBSCRIBE_FAILED: u16 = 1002;
    /// The publication was rejected.
    pub const PUBLISH_FAILED: u16 = 1003;
    /// The connection was not in the room.
    pub const UNSUBSCRIBE_FAILED: u16 = 1008;
    /// The server refused to register the connection.
    pub const CONNECTION_REFUSED: u16 = 1009;
}

/// Numeric frame kinds, for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Subscribe = 0x01,
    Unsubscribe = 0x02,
    Publish = 0x03,
    Batch = 0x04,
    Ack = 0x05,
    Error = 0x06,
    Ping = 0x07,
    Pong = 0x08,
    Connected = 0x0A,
}

impl FrameType {
    const ALL: [FrameType; 9] = [
        FrameType::Subscribe,
        FrameType::Unsubscribe,
        FrameType::Publish,
        FrameType::Batch,
        FrameType::Ack,
        FrameType::Error,
        FrameType::Ping,
        FrameType::Pong,
        FrameType::Connected,
    ];

    /// The `type` tag used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            FrameType::Subscribe => "subscribe",
            FrameType::Unsubscribe => "unsubscribe",
            FrameType::Publish => "publish",
            FrameType::Batch => "batch",
            FrameType::Ack => "ack",
            FrameType::Error => "error",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
            FrameType::Connected => "connected",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FrameType> for u8 {
    fn from(kind: FrameType) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = u8;

    /// Returns the unknown code back on failure.
    fn try_from(code: u8) -> Result<Self, u8> {
        FrameType::ALL
            .into_iter()
            .find(|kind| *kind as u8 == code)
            .ok_or(code)
    }
}

/// A protocol frame.
///
/// Clients send `subscribe`, `unsubscribe`, `publish` and `ping`. The
/// server sends everything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Join a room. Answered with `ack` or `error` carrying the same id.
    Subscribe { id: u64, room: String },

    /// Leave a room. Answered with `ack` or `error` carrying the same id.
    Unsubscribe { id: u64, room: String },

    /// Add a payload to the room's current window.
    ///
    /// Only acknowledged when `id` is present; failures are always reported.
    Publish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        room: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// One flushed window of a room: every payload published during the
    /// window, in order, minus the recipient's own.
    Batch {
        room: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Request succeeded.
    Ack { id: u64 },

    /// Request failed. `id` is 0 when no request is being answered.
    Error { id: u64, code: u16, message: String },

    /// Application-level keepalive.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Answer to `ping`, echoing its timestamp.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// First frame on every connection.
    Connected {
        /// Identity the server uses for this connection.
        connection_id: String,
        version: u8,
        /// Interval in milliseconds at which the client should send traffic.
        heartbeat: u32,
    },
}

impl Frame {
    /// Kind of this frame.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Unsubscribe { .. } => FrameType::Unsubscribe,
            Frame::Publish { .. } => FrameType::Publish,
            Frame::Batch { .. } => FrameType::Batch,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Connected { .. } => FrameType::Connected,
        }
    }

    #[must_use]
    pub fn subscribe(id: u64, room: impl Into<String>) -> Self {
        Frame::Subscribe { id, room: room.into() }
    }

    #[must_use]
    pub fn unsubscribe(id: u64, room: impl Into<String>) -> Self {
        Frame::Unsubscribe { id, room: room.into() }
    }

    /// Fire-and-forget publication.
    #[must_use]
    pub fn publish(room: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Frame::Publish {
            id: None,
            room: room.into(),
            payload: payload.into(),
        }
    }

    /// Publication answered with `ack { id }`.
    #[must_use]
    pub fn publish_with_ack(id: u64, room: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Frame::Publish {
            id: Some(id),
            room: room.into(),
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn batch(room: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Frame::Batch {
            room: room.into(),
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Greeting for a freshly registered connection.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version: PROTOCOL_VERSION,
            heartbeat,
        }
    }
}
