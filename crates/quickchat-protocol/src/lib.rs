//! # quickchat-protocol
//!
//! Wire protocol definitions for QuickChat.
//!
//! This crate defines the frames exchanged between chat clients and the
//! server, their binary (MessagePack) and text (JSON) codecs, and protocol
//! versioning.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Handshake
//! - `Send` / `Sent` / `Message` - Messaging
//! - `Fetch` / `Pending` - Retrieving queued messages
//! - `Open` / `Conversation` / `Close` - Conversation focus
//! - `Presence` / `Unseen` / `Seen` - Server pushes
//! - `Ack` / `Error` - Acknowledgments and errors
//!
//! ## Example
//!
//! ```rust
//! use quickchat_protocol::{Frame, codec};
//!
//! let frame = Frame::send_text("user_b", "Hello, world!");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, Encoded, FrameCodec, ProtocolError, WireFormat};
pub use frames::{codes, Frame, FrameType, MessageState, WireMessage};
pub use version::{negotiate, Version, PROTOCOL_VERSION, SUPPORTED_MAJORS};
