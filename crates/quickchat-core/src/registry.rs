//! Connection registry.
//!
//! Maps each user to at most one live channel. Registering a user that is
//! already connected swaps in the new channel and closes the old one.
//! Mutations go through a single writer lock and listeners are notified
//! while it is held, so every listener sees events in mutation order.

use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::channel::{ConnectionId, SharedChannel};
use crate::users::UserId;

/// A change in connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A channel was bound to `user`.
    Connected {
        seq: u64,
        user: UserId,
        connection: ConnectionId,
        /// Connection that was evicted by this one, if any.
        replaced: Option<ConnectionId>,
    },
    /// The binding for `user` was removed.
    Disconnected {
        seq: u64,
        user: UserId,
        connection: ConnectionId,
    },
}

impl RegistryEvent {
    #[must_use]
    pub fn seq(&self) -> u64 {
        match self {
            RegistryEvent::Connected { seq, .. } | RegistryEvent::Disconnected { seq, .. } => *seq,
        }
    }

    #[must_use]
    pub fn user(&self) -> &UserId {
        match self {
            RegistryEvent::Connected { user, .. } | RegistryEvent::Disconnected { user, .. } => {
                user
            }
        }
    }
}

/// Receives registry events.
///
/// Called with the registry's writer lock held: implementations must not
/// call back into mutating registry methods.
pub trait RegistryListener: Send + Sync {
    fn on_registry_event(&self, event: &RegistryEvent);
}

#[derive(Default)]
struct Writer {
    seq: u64,
    listeners: Vec<Arc<dyn RegistryListener>>,
}

impl Writer {
    fn emit(&mut self, make: impl FnOnce(u64) -> RegistryEvent) -> RegistryEvent {
        self.seq += 1;
        let event = make(self.seq);
        for listener in &self.listeners {
            listener.on_registry_event(&event);
        }
        event
    }
}

/// Registry of live channels, one per user.
#[derive(Default)]
pub struct ConnectionRegistry {
    channels: DashMap<UserId, SharedChannel>,
    writer: Mutex<Writer>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn writer(&self) -> MutexGuard<'_, Writer> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe a listener to all future events.
    pub fn add_listener(&self, listener: Arc<dyn RegistryListener>) {
        self.writer().listeners.push(listener);
    }

    /// Bind `channel` to `user`.
    ///
    /// Any previous channel for the user is closed and returned.
    pub fn register(&self, user: &UserId, channel: SharedChannel) -> Option<SharedChannel> {
        let mut writer = self.writer();

        let connection = channel.id().clone();
        let previous = self.channels.insert(user.clone(), channel);

        if let Some(old) = &previous {
            old.close();
            info!(
                user = %user,
                old = %old.id(),
                new = %connection,
                "Replaced existing connection"
            );
        } else {
            debug!(user = %user, connection = %connection, "Registered connection");
        }

        let replaced = previous.as_ref().map(|old| old.id().clone());
        writer.emit(|seq| RegistryEvent::Connected {
            seq,
            user: user.clone(),
            connection,
            replaced,
        });

        previous
    }

    /// Remove the binding for `user` if it still belongs to `connection`.
    ///
    /// Returns `true` if a binding was removed. Calling this for an evicted
    /// or already-removed connection is a no-op.
    pub fn unregister(&self, user: &UserId, connection: &ConnectionId) -> bool {
        let mut writer = self.writer();

        let Some((_, channel)) = self
            .channels
            .remove_if(user, |_, channel| channel.id() == connection)
        else {
            return false;
        };

        channel.close();
        debug!(user = %user, connection = %connection, "Unregistered connection");

        writer.emit(|seq| RegistryEvent::Disconnected {
            seq,
            user: user.clone(),
            connection: connection.clone(),
        });

        true
    }

    /// Get the active channel for a user.
    #[must_use]
    pub fn lookup(&self, user: &UserId) -> Option<SharedChannel> {
        self.channels.get(user).map(|c| Arc::clone(c.value()))
    }

    #[must_use]
    pub fn is_connected(&self, user: &UserId) -> bool {
        self.channels.contains_key(user)
    }

    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn connected_users(&self) -> Vec<UserId> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Close and remove every channel. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let mut writer = self.writer();

        let users = self.connected_users();
        let mut closed = 0;
        for user in users {
            if let Some((_, channel)) = self.channels.remove(&user) {
                channel.close();
                let connection = channel.id().clone();
                writer.emit(|seq| RegistryEvent::Disconnected {
                    seq,
                    user: user.clone(),
                    connection,
                });
                closed += 1;
            }
        }

        info!(closed, "Closed all connections");
        closed
    }
}
