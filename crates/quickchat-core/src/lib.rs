//! # quickchat-core
//!
//! Messaging and presence core for QuickChat.
//!
//! This crate provides the shared state behind every chat connection:
//!
//! - **ConnectionRegistry** - Which users hold a live channel (last connect wins)
//! - **PresenceTracker** - The online user set, broadcast on every change
//! - **MessageRouter** - Live delivery or per-conversation queueing
//! - **UnseenCounter** - Unread counts per (recipient, sender)
//! - **ChatCore** - The coordinator that owns all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌─────────────────┐
//! │  ChatCore   │────▶│ ConnectionRegistry│────▶│ PresenceTracker │
//! └─────────────┘     └──────────────────┘     └─────────────────┘
//!        │                     ▲
//!        ▼                     │
//! ┌─────────────┐     ┌──────────────────┐
//! │UnseenCounter│◀────│  MessageRouter   │────▶ MessageStore
//! └─────────────┘     └──────────────────┘
//! ```

pub mod channel;
pub mod chat;
pub mod message;
pub mod presence;
pub mod registry;
pub mod router;
pub mod store;
pub mod unseen;
pub mod users;

pub use channel::{Channel, ChannelError, ConnectionId, MpscChannel, Push, SharedChannel};
pub use chat::{ChatCore, ChatError, ConnectOutcome, Contact, Conversation, CoreConfig};
pub use message::{Content, DeliveryState, Message, MessageId, Payload, ValidationError};
pub use presence::{PresenceSnapshot, PresenceState, PresenceTracker};
pub use registry::{ConnectionRegistry, RegistryEvent, RegistryListener};
pub use router::{MessageRouter, RouterConfig, RouterError, RouterStats};
pub use store::{InMemoryStore, MessageStore, StoreError};
pub use unseen::{UnseenChange, UnseenCounter};
pub use users::{DirectoryError, NewUser, ProfileUpdate, User, UserDirectory, UserId};
