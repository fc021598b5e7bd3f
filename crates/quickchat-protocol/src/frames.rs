//! Frame types for the QuickChat protocol.
//!
//! Frames are the unit of communication on a chat connection. The same
//! `type`-tagged shape is used for MessagePack (binary) and JSON (text).

use serde::{Deserialize, Serialize};

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// The frame could not be decoded.
    pub const MALFORMED_FRAME: u16 = 1001;
    /// The client asked for a protocol version the server does not speak.
    pub const UNSUPPORTED_VERSION: u16 = 1002;
    /// The token does not name a registered user.
    pub const UNKNOWN_USER: u16 = 1003;
    /// The request was rejected by validation.
    pub const VALIDATION: u16 = 1004;
    /// A request arrived before the `connect` handshake.
    pub const NOT_CONNECTED: u16 = 1005;
    /// Something went wrong on the server.
    pub const INTERNAL: u16 = 1500;
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Send = 0x03,
    Sent = 0x04,
    Message = 0x05,
    Fetch = 0x06,
    Pending = 0x07,
    Open = 0x08,
    Conversation = 0x09,
    Close = 0x0A,
    Presence = 0x0B,
    Unseen = 0x0C,
    Seen = 0x0D,
    Ack = 0x0E,
    Error = 0x0F,
    Ping = 0x10,
    Pong = 0x11,
}

impl FrameType {
    /// Wire name, as used in the `type` tag.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Connect => "connect",
            FrameType::Connected => "connected",
            FrameType::Send => "send",
            FrameType::Sent => "sent",
            FrameType::Message => "message",
            FrameType::Fetch => "fetch",
            FrameType::Pending => "pending",
            FrameType::Open => "open",
            FrameType::Conversation => "conversation",
            FrameType::Close => "close",
            FrameType::Presence => "presence",
            FrameType::Unseen => "unseen",
            FrameType::Seen => "seen",
            FrameType::Ack => "ack",
            FrameType::Error => "error",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
        }
    }
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Send),
            0x04 => Ok(FrameType::Sent),
            0x05 => Ok(FrameType::Message),
            0x06 => Ok(FrameType::Fetch),
            0x07 => Ok(FrameType::Pending),
            0x08 => Ok(FrameType::Open),
            0x09 => Ok(FrameType::Conversation),
            0x0A => Ok(FrameType::Close),
            0x0B => Ok(FrameType::Presence),
            0x0C => Ok(FrameType::Unseen),
            0x0D => Ok(FrameType::Seen),
            0x0E => Ok(FrameType::Ack),
            0x0F => Ok(FrameType::Error),
            0x10 => Ok(FrameType::Ping),
            0x11 => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Delivery state of a message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    Pending,
    Delivered,
    Seen,
}

/// A chat message on the wire.
///
/// Exactly one of `text` and `image` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: u64,
    pub sender: String,
    pub recipient: String,
    /// Milliseconds since the UNIX epoch.
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub state: MessageState,
}

/// A protocol frame.
///
/// Client frames: `connect`, `send`, `fetch`, `open`, `close`, `ping`, `pong`.
/// Everything else is sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial connection handshake.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol major version.
        version: u8,
        /// Identity of the connecting user.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Connection established response.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// The authenticated user.
        user_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Send a message.
    #[serde(rename = "send")]
    Send {
        /// Optional request ID, echoed in `sent`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        recipient: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },

    /// The message from a `send` was accepted.
    #[serde(rename = "sent")]
    Sent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        message: WireMessage,
    },

    /// A message addressed to this connection's user.
    #[serde(rename = "message")]
    Message { message: WireMessage },

    /// Ask for every pending message.
    #[serde(rename = "fetch")]
    Fetch { id: u64 },

    /// Answer to `fetch`, oldest first.
    #[serde(rename = "pending")]
    Pending { id: u64, messages: Vec<WireMessage> },

    /// Open the conversation with `peer`.
    #[serde(rename = "open")]
    Open { id: u64, peer: String },

    /// Answer to `open`: the full history.
    #[serde(rename = "conversation")]
    Conversation {
        id: u64,
        peer: String,
        /// Unseen count cleared by opening.
        unseen: u64,
        messages: Vec<WireMessage>,
    },

    /// Close the conversation with `peer`.
    #[serde(rename = "close")]
    Close { id: u64, peer: String },

    /// The online user set.
    #[serde(rename = "presence")]
    Presence {
        /// Snapshot version; newer snapshots replace older ones.
        version: u64,
        online: Vec<String>,
    },

    /// Unseen count from one sender changed.
    #[serde(rename = "unseen")]
    Unseen { sender: String, count: u64 },

    /// The peer `by` has seen messages this user sent.
    #[serde(rename = "seen")]
    Seen { by: String, message_ids: Vec<u64> },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Send { .. } => FrameType::Send,
            Frame::Sent { .. } => FrameType::Sent,
            Frame::Message { .. } => FrameType::Message,
            Frame::Fetch { .. } => FrameType::Fetch,
            Frame::Pending { .. } => FrameType::Pending,
            Frame::Open { .. } => FrameType::Open,
            Frame::Conversation { .. } => FrameType::Conversation,
            Frame::Close { .. } => FrameType::Close,
            Frame::Presence { .. } => FrameType::Presence,
            Frame::Unseen { .. } => FrameType::Unseen,
            Frame::Seen { .. } => FrameType::Seen,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Request ID, for frames that carry one.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::Send { id, .. } | Frame::Sent { id, .. } => *id,
            Frame::Fetch { id }
            | Frame::Pending { id, .. }
            | Frame::Open { id, .. }
            | Frame::Conversation { id, .. }
            | Frame::Close { id, .. }
            | Frame::Ack { id }
            | Frame::Error { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, token: Option<String>) -> Self {
        Frame::Connect { version, token }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        version: u8,
        heartbeat: u32,
    ) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a text Send frame.
    #[must_use]
    pub fn send_text(recipient: impl Into<String>, text: impl Into<String>) -> Self {
        Frame::Send {
            id: None,
            recipient: recipient.into(),
            text: Some(text.into()),
            image: None,
        }
    }

    /// Create an image Send frame.
    #[must_use]
    pub fn send_image(recipient: impl Into<String>, image: impl Into<String>) -> Self {
        Frame::Send {
            id: None,
            recipient: recipient.into(),
            text: None,
            image: Some(image.into()),
        }
    }

    /// Create a new Fetch frame.
    #[must_use]
    pub fn fetch(id: u64) -> Self {
        Frame::Fetch { id }
    }

    /// Create a new Open frame.
    #[must_use]
    pub fn open(id: u64, peer: impl Into<String>) -> Self {
        Frame::Open {
            id,
            peer: peer.into(),
        }
    }

    /// Create a new Close frame.
    #[must_use]
    pub fn close(id: u64, peer: impl Into<String>) -> Self {
        Frame::Close {
            id,
            peer: peer.into(),
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Ping frame with timestamp.
    #[must_use]
    pub fn ping_with_timestamp(timestamp: u64) -> Self {
        Frame::Ping {
            timestamp: Some(timestamp),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}
