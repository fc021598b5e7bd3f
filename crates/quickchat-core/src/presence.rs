//! Presence tracking for QuickChat.
//!
//! The tracker listens to the connection registry and keeps the set of
//! online users. Every change produces a versioned snapshot on a broadcast
//! channel; versions strictly increase in send order.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::channel::ConnectionId;
use crate::message::now_millis;
use crate::registry::{RegistryEvent, RegistryListener};
use crate::users::UserId;

/// Default broadcast capacity for presence snapshots.
pub const DEFAULT_PRESENCE_CAPACITY: usize = 256;

/// Presence state for a single online user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceState {
    /// Connection currently serving the user.
    pub connection_id: ConnectionId,
    /// When the user came online (ms since epoch).
    pub online_since: u64,
}

/// The online set at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceSnapshot {
    pub version: u64,
    /// Online users, sorted.
    pub online: Vec<UserId>,
}

impl PresenceSnapshot {
    #[must_use]
    pub fn contains(&self, user: &UserId) -> bool {
        self.online.binary_search(user).is_ok()
    }
}

#[derive(Default)]
struct Inner {
    members: HashMap<UserId, PresenceState>,
    version: u64,
}

impl Inner {
    fn snapshot(&self) -> PresenceSnapshot {
        let mut online: Vec<UserId> = self.members.keys().cloned().collect();
        online.sort();
        PresenceSnapshot {
            version: self.version,
            online,
        }
    }
}

/// Tracks which users are online.
pub struct PresenceTracker {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<Arc<PresenceSnapshot>>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PRESENCE_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: RwLock::new(Inner::default()),
            sender,
        }
    }

    /// Check whether a user is online.
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .contains_key(user)
    }

    #[must_use]
    pub fn get(&self, user: &UserId) -> Option<PresenceState> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .get(user)
            .cloned()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .len()
    }

    /// Current online set.
    #[must_use]
    pub fn online_snapshot(&self) -> PresenceSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Receive a snapshot after every change.
    ///
    /// Subscribers that also need the current state should subscribe first,
    /// then read [`online_snapshot`](Self::online_snapshot), and ignore
    /// received snapshots whose version is not newer.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PresenceSnapshot>> {
        self.sender.subscribe()
    }

    /// Apply a registry event.
    ///
    /// Returns the new snapshot if the online set changed.
    pub fn apply(&self, event: &RegistryEvent) -> Option<Arc<PresenceSnapshot>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let changed = match event {
            RegistryEvent::Connected {
                user, connection, ..
            } => {
                let previous = inner.members.insert(
                    user.clone(),
                    PresenceState {
                        connection_id: connection.clone(),
                        online_since: now_millis(),
                    },
                );
                match previous {
                    // Swapped connection: keep the original online_since.
                    Some(prev) => {
                        if let Some(state) = inner.members.get_mut(user) {
                            state.online_since = prev.online_since;
                        }
                        false
                    }
                    None => true,
                }
            }
            RegistryEvent::Disconnected {
                user, connection, ..
            } => {
                let owned = inner
                    .members
                    .get(user)
                    .is_some_and(|s| &s.connection_id == connection);
                if owned {
                    inner.members.remove(user);
                }
                owned
            }
        };

        if !changed {
            trace!(seq = event.seq(), "Presence unchanged");
            return None;
        }

        inner.version += 1;
        let snapshot = Arc::new(inner.snapshot());
        debug!(
            version = snapshot.version,
            online = snapshot.online.len(),
            user = %event.user(),
            "Presence changed"
        );

        // Sent under the write lock so broadcasts leave in version order.
        let _ = self.sender.send(Arc::clone(&snapshot));
        Some(snapshot)
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryListener for PresenceTracker {
    fn on_registry_event(&self, event: &RegistryEvent) {
        self.apply(event);
    }
}
