//! Live channel capability.
//!
//! A channel is the core's only view of a transport: it can push events to
//! one connected user and be closed. The transport side owns the receiving
//! end and tears the socket down once the channel closes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::message::{Message, MessageId};
use crate::users::UserId;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An event pushed to a connected user.
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    /// A message addressed to the user.
    Message(Message),
    /// Unseen count for one sender changed.
    Unseen { sender: UserId, count: u64 },
    /// The recipient `by` has seen messages this user sent.
    Seen {
        by: UserId,
        message_ids: Vec<MessageId>,
    },
}

/// Channel errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel was closed or its receiver went away.
    #[error("Channel closed")]
    Closed,
}

/// A live, push-capable binding to one user.
pub trait Channel: Send + Sync {
    /// The connection this channel belongs to.
    fn id(&self) -> &ConnectionId;

    /// Push an event without waiting for the transport.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the channel can no longer deliver.
    fn send(&self, push: Push) -> Result<(), ChannelError>;

    /// Close the channel. Idempotent.
    fn close(&self);

    /// Check if the channel is still open.
    fn is_open(&self) -> bool;
}

/// Shared handle to a channel.
pub type SharedChannel = Arc<dyn Channel>;

/// Channel backed by an unbounded tokio mpsc queue.
///
/// Closing drops the sender, so the receiver drains what was already queued
/// and then yields `None`.
pub struct MpscChannel {
    id: ConnectionId,
    sender: Mutex<Option<mpsc::UnboundedSender<Push>>>,
}

impl MpscChannel {
    /// Create a channel and the receiver the transport should drain.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Push>) {
        Self::with_id(ConnectionId::generate())
    }

    /// Create a channel with a specific connection ID.
    #[must_use]
    pub fn with_id(id: ConnectionId) -> (Arc<Self>, mpsc::UnboundedReceiver<Push>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            id,
            sender: Mutex::new(Some(tx)),
        });
        (channel, rx)
    }
}

impl Channel for MpscChannel {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn send(&self, push: Push) -> Result<(), ChannelError> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => {
                trace!(connection = %self.id, "Pushing event");
                tx.send(push).map_err(|_| ChannelError::Closed)
            }
            None => Err(ChannelError::Closed),
        }
    }

    fn close(&self) {
        let mut guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            debug!(connection = %self.id, "Channel closed");
        }
    }

    fn is_open(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl fmt::Debug for MpscChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpscChannel")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}
