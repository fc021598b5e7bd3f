//! The QuickChat coordinator.
//!
//! [`ChatCore`] owns the user directory, connection registry, presence
//! tracker, router and unseen counters, and applies every connection event
//! against them as one unit of work. Transports hold an `Arc<ChatCore>`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::{ConnectionId, Push, SharedChannel};
use crate::message::{
    DeliveryState, Message, MessageId, Payload, ValidationError, DEFAULT_MAX_TEXT_LENGTH,
};
use crate::presence::{PresenceTracker, DEFAULT_PRESENCE_CAPACITY};
use crate::registry::ConnectionRegistry;
use crate::router::{MessageRouter, RouterConfig, RouterError};
use crate::store::{InMemoryStore, MessageStore, StoreError};
use crate::unseen::{UnseenCounter, DEFAULT_UNSEEN_CAPACITY};
use crate::users::{DirectoryError, NewUser, ProfileUpdate, User, UserDirectory, UserId};

/// Errors returned by [`ChatCore`] operations.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The core is shutting down and accepts no new connections.
    #[error("Shutting down")]
    ShuttingDown,
}

impl From<RouterError> for ChatError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::Validation(e) => ChatError::Validation(e),
            RouterError::Store(e) => ChatError::Store(e),
        }
    }
}

/// Core configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Maximum message text length, in characters.
    pub max_text_length: usize,
    /// Presence broadcast buffer per subscriber.
    pub presence_capacity: usize,
    /// Unseen-change broadcast buffer per subscriber.
    pub unseen_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_text_length: DEFAULT_MAX_TEXT_LENGTH,
            presence_capacity: DEFAULT_PRESENCE_CAPACITY,
            unseen_capacity: DEFAULT_UNSEEN_CAPACITY,
        }
    }
}

/// A sidebar entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contact {
    #[serde(flatten)]
    pub user: User,
    pub online: bool,
    pub unseen: u64,
}

/// An opened conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub peer: UserId,
    /// Unseen count that was cleared by opening.
    pub unseen_before: u64,
    /// Full history, oldest first.
    pub messages: Vec<Message>,
}

/// Result of a successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub connection: ConnectionId,
    /// Whether an existing connection was evicted.
    pub replaced: bool,
    /// Pending messages pushed over the new channel.
    pub flushed: usize,
}

/// Messaging and presence coordinator.
pub struct ChatCore {
    users: UserDirectory,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    router: MessageRouter,
    unseen: UnseenCounter,
    store: Arc<dyn MessageStore>,
    shutting_down: AtomicBool,
}

impl ChatCore {
    /// Create a core backed by an [`InMemoryStore`].
    #[must_use]
    pub fn new(config: CoreConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryStore::new()))
    }

    /// Create a core backed by `store`.
    #[must_use]
    pub fn with_store(config: CoreConfig, store: Arc<dyn MessageStore>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = Arc::new(PresenceTracker::with_capacity(config.presence_capacity));
        registry.add_listener(presence.clone());

        let router = MessageRouter::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            RouterConfig {
                max_text_length: config.max_text_length,
            },
        );

        info!("Chat core initialized");

        Self {
            users: UserDirectory::new(),
            registry,
            presence,
            router,
            unseen: UnseenCounter::with_capacity(config.unseen_capacity),
            store,
            shutting_down: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn users(&self) -> &UserDirectory {
        &self.users
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    #[must_use]
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    #[must_use]
    pub fn unseen(&self) -> &UnseenCounter {
        &self.unseen
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Register a new user.
    ///
    /// # Errors
    ///
    /// Returns an error if the display name is invalid.
    pub fn register_user(&self, new_user: NewUser) -> Result<User, ChatError> {
        Ok(self.users.register(new_user)?)
    }

    /// Update a user's profile.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown users or an invalid display name.
    pub fn update_profile(&self, user: &UserId, update: ProfileUpdate) -> Result<User, ChatError> {
        Ok(self.users.update_profile(user, update)?)
    }

    #[must_use]
    pub fn user(&self, id: &UserId) -> Option<User> {
        self.users.get(id)
    }

    /// Bind `channel` to `user` and flush everything queued for them.
    ///
    /// # Errors
    ///
    /// Fails for unknown users and once [`shutdown`](Self::shutdown) has run.
    pub async fn connect(
        &self,
        user: &UserId,
        channel: SharedChannel,
    ) -> Result<ConnectOutcome, ChatError> {
        if self.is_shutting_down() {
            return Err(ChatError::ShuttingDown);
        }
        self.users.require(user)?;

        let connection = channel.id().clone();
        let replaced = self.registry.register(user, Arc::clone(&channel)).is_some();

        // Lost the race with shutdown; don't leave a binding behind.
        if self.is_shutting_down() {
            self.registry.unregister(user, &connection);
            return Err(ChatError::ShuttingDown);
        }

        let flushed = self.router.deliver_pending(user).await.len();

        for (sender, count) in self.unseen.counts_for(user) {
            if channel.send(Push::Unseen { sender, count }).is_err() {
                break;
            }
        }

        info!(
            user = %user,
            connection = %connection,
            replaced,
            flushed,
            "User connected"
        );

        Ok(ConnectOutcome {
            connection,
            replaced,
            flushed,
        })
    }

    /// Drop the binding for `user` if it still belongs to `connection`.
    ///
    /// Idempotent. Returns `true` if a binding was removed.
    pub fn disconnect(&self, user: &UserId, connection: &ConnectionId) -> bool {
        let removed = self.registry.unregister(user, connection);

        // A failed push may already have removed the binding.
        if !self.registry.is_connected(user) {
            self.unseen.close_all(user);
        }

        if removed {
            info!(user = %user, connection = %connection, "User disconnected");
        }
        removed
    }

    /// Drop the user's live connection, whichever it is.
    pub fn logout(&self, user: &UserId) -> bool {
        match self.registry.lookup(user) {
            Some(channel) => self.disconnect(user, channel.id()),
            None => {
                self.unseen.close_all(user);
                false
            }
        }
    }

    /// Send a message.
    ///
    /// The returned message is `pending`; it becomes `delivered` (or `seen`,
    /// if the recipient has the conversation open) once the recipient's
    /// transport calls [`confirm_delivered`](Self::confirm_delivered).
    ///
    /// # Errors
    ///
    /// Fails for unknown users, invalid payloads and storage errors.
    pub async fn submit(
        &self,
        sender: &UserId,
        recipient: &UserId,
        payload: Payload,
    ) -> Result<Message, ChatError> {
        self.users.require(sender)?;
        self.users.require(recipient)?;

        let message = self.router.submit(sender, recipient, payload).await?;

        if let Some(count) = self.unseen.on_message_routed(&message) {
            self.push_to(
                recipient,
                Push::Unseen {
                    sender: sender.clone(),
                    count,
                },
            );
        }

        Ok(message)
    }

    /// `user`'s transport wrote message `id` from `sender` to the socket.
    ///
    /// Records the message delivered, or seen with a receipt to the sender
    /// when `user` has the conversation open. Returns `None` if the message
    /// was already confirmed, fetched or seen.
    ///
    /// # Errors
    ///
    /// Fails if the seen state cannot be recorded.
    pub async fn confirm_delivered(
        &self,
        user: &UserId,
        sender: &UserId,
        id: MessageId,
    ) -> Result<Option<DeliveryState>, ChatError> {
        if !self.router.confirm_delivered(sender, user, id).await {
            return Ok(None);
        }

        if !self.unseen.is_open(user, sender) {
            return Ok(Some(DeliveryState::Delivered));
        }

        let state = self.router.mark_message_seen(id).await?;
        self.push_to(
            sender,
            Push::Seen {
                by: user.clone(),
                message_ids: vec![id],
            },
        );
        Ok(Some(state))
    }

    /// Retrieve every message still pending for `user`.
    ///
    /// # Errors
    ///
    /// Fails for unknown users.
    pub async fn fetch_pending(&self, user: &UserId) -> Result<Vec<Message>, ChatError> {
        self.users.require(user)?;
        Ok(self.router.fetch_pending(user).await)
    }

    /// Open the conversation with `peer`: reset the unseen count, mark the
    /// peer's messages seen and return the history.
    ///
    /// # Errors
    ///
    /// Fails for unknown users, `user == peer` and storage errors.
    pub async fn open_conversation(
        &self,
        user: &UserId,
        peer: &UserId,
    ) -> Result<Conversation, ChatError> {
        if user == peer {
            return Err(ValidationError::SelfAddressed.into());
        }
        self.users.require(user)?;
        self.users.require(peer)?;

        let unseen_before = self.unseen.mark_open(user, peer);

        let seen = self.router.mark_seen(user, peer).await?;
        if !seen.is_empty() {
            self.push_to(
                peer,
                Push::Seen {
                    by: user.clone(),
                    message_ids: seen,
                },
            );
        }

        let messages = self.store.load_conversation(user, peer).await?;
        debug!(
            user = %user,
            peer = %peer,
            unseen_before,
            messages = messages.len(),
            "Conversation opened"
        );

        Ok(Conversation {
            peer: peer.clone(),
            unseen_before,
            messages,
        })
    }

    /// Close the conversation with `peer`. Returns `true` if it was open.
    pub fn close_conversation(&self, user: &UserId, peer: &UserId) -> bool {
        self.unseen.mark_closed(user, peer)
    }

    /// Every other user, with online flag and unseen count.
    ///
    /// # Errors
    ///
    /// Fails for unknown users.
    pub fn sidebar(&self, user: &UserId) -> Result<Vec<Contact>, ChatError> {
        self.users.require(user)?;
        let counts = self.unseen.counts_for(user);

        Ok(self
            .users
            .list()
            .into_iter()
            .filter(|u| &u.id != user)
            .map(|u| Contact {
                online: self.presence.is_online(&u.id),
                unseen: counts.get(&u.id).copied().unwrap_or(0),
                user: u,
            })
            .collect())
    }

    /// Stop accepting connections and close every channel.
    ///
    /// Returns the number of channels closed.
    pub fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::Release);
        let closed = self.registry.close_all();
        info!(closed, "Chat core shut down");
        closed
    }

    fn push_to(&self, user: &UserId, push: Push) {
        let Some(channel) = self.registry.lookup(user) else {
            return;
        };
        if let Err(e) = channel.send(push) {
            warn!(user = %user, connection = %channel.id(), error = %e, "Push failed");
            self.disconnect(user, channel.id());
        }
    }
}

impl Default for ChatCore {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, MpscChannel};
    use tokio::sync::mpsc;

    fn core_with_users(names: &[&str]) -> (ChatCore, Vec<UserId>) {
        let core = ChatCore::default();
        let ids = names
            .iter()
            .map(|n| core.register_user(NewUser::named(*n)).unwrap().id)
            .collect();
        (core, ids)
    }

    async fn connect(core: &ChatCore, user: &UserId) -> mpsc::UnboundedReceiver<Push> {
        let (channel, rx) = MpscChannel::new();
        core.connect(user, channel).await.unwrap();
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Push>) -> Vec<Push> {
        let mut out = Vec::new();
        while let Ok(push) = rx.try_recv() {
            out.push(push);
        }
        out
    }

    /// Drain `rx` as a transport would, confirming every message written.
    async fn drain_confirmed(
        core: &ChatCore,
        user: &UserId,
        rx: &mut mpsc::UnboundedReceiver<Push>,
    ) -> Vec<Push> {
        let pushes = drain(rx);
        for push in &pushes {
            if let Push::Message(m) = push {
                core.confirm_delivered(user, &m.sender, m.id).await.unwrap();
            }
        }
        pushes
    }

    #[tokio::test]
    async fn test_offline_recipient_gets_pending_on_fetch() {
        let (core, ids) = core_with_users(&["Alice", "Bob"]);
        let (a, b) = (&ids[0], &ids[1]);
        let _a_rx = connect(&core, a).await;

        let message = core.submit(a, b, Payload::text("hi")).await.unwrap();
        assert_eq!(message.state, DeliveryState::Pending);
        assert_eq!(core.unseen().count(b, a), 1);

        let fetched = core.fetch_pending(b).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].id, message.id);
        assert_eq!(fetched[0].text(), Some("hi"));
        assert_eq!(core.unseen().count(b, a), 1);

        assert!(core.fetch_pending(b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_flushed_on_connect() {
        let (core, ids) = core_with_users(&["Alice", "Bob"]);
        let (a, b) = (&ids[0], &ids[1]);

        let message = core.submit(a, b, Payload::text("hi")).await.unwrap();

        let (channel, mut rx) = MpscChannel::new();
        let outcome = core.connect(b, channel).await.unwrap();
        assert_eq!(outcome.flushed, 1);
        assert!(!outcome.replaced);

        let pushes = drain(&mut rx);
        assert!(matches!(&pushes[0], Push::Message(m) if m.id == message.id));
        assert_eq!(
            pushes[1],
            Push::Unseen {
                sender: a.clone(),
                count: 1
            }
        );
    }

    #[tokio::test]
    async fn test_open_conversation_delivers_as_seen() {
        let (core, ids) = core_with_users(&["Alice", "Bob"]);
        let (a, b) = (&ids[0], &ids[1]);
        let mut a_rx = connect(&core, a).await;
        let mut b_rx = connect(&core, b).await;

        core.open_conversation(a, b).await.unwrap();
        core.open_conversation(b, a).await.unwrap();

        let message = core.submit(a, b, Payload::text("hello")).await.unwrap();
        assert_eq!(message.state, DeliveryState::Pending);
        assert_eq!(core.unseen().count(b, a), 0);
        assert!(drain(&mut a_rx).is_empty());

        let to_bob = drain(&mut b_rx);
        assert_eq!(to_bob.len(), 1);
        assert!(matches!(&to_bob[0], Push::Message(m) if m.text() == Some("hello")));

        assert_eq!(
            core.confirm_delivered(b, a, message.id).await.unwrap(),
            Some(DeliveryState::Seen)
        );
        assert_eq!(
            drain(&mut a_rx),
            vec![Push::Seen {
                by: b.clone(),
                message_ids: vec![message.id]
            }]
        );
        assert_eq!(core.confirm_delivered(b, a, message.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_confirm_closed_conversation_is_delivered() {
        let (core, ids) = core_with_users(&["Alice", "Bob"]);
        let (a, b) = (&ids[0], &ids[1]);
        let mut a_rx = connect(&core, a).await;
        let mut b_rx = connect(&core, b).await;

        let message = core.submit(a, b, Payload::text("hello")).await.unwrap();
        drain_confirmed(&core, b, &mut b_rx).await;

        let stored = core.store().load_conversation(a, b).await.unwrap();
        assert_eq!(stored[0].id, message.id);
        assert_eq!(stored[0].state, DeliveryState::Delivered);
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(core.unseen().count(b, a), 1);
    }

    #[tokio::test]
    async fn test_unwritten_push_resent_after_reconnect() {
        let (core, ids) = core_with_users(&["Alice", "Bob"]);
        let (a, b) = (&ids[0], &ids[1]);

        let (channel, rx) = MpscChannel::new();
        let connection = channel.id().clone();
        core.connect(b, channel).await.unwrap();
        let message = core.submit(a, b, Payload::text("don't lose me")).await.unwrap();

        // The socket died before the writer got to the message.
        drop(rx);
        core.disconnect(b, &connection);

        let stored = core.store().load_conversation(a, b).await.unwrap();
        assert_eq!(stored[0].state, DeliveryState::Pending);

        let (channel, mut rx) = MpscChannel::new();
        let outcome = core.connect(b, channel).await.unwrap();
        assert_eq!(outcome.flushed, 1);

        let pushes = drain_confirmed(&core, b, &mut rx).await;
        assert!(matches!(&pushes[0], Push::Message(m) if m.id == message.id));

        let stored = core.store().load_conversation(a, b).await.unwrap();
        assert_eq!(stored[0].state, DeliveryState::Delivered);
        assert!(core.fetch_pending(b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unconfirmed_push_still_fetchable() {
        let (core, ids) = core_with_users(&["Alice", "Bob"]);
        let (a, b) = (&ids[0], &ids[1]);

        let (channel, rx) = MpscChannel::new();
        let connection = channel.id().clone();
        core.connect(b, channel).await.unwrap();
        let message = core.submit(a, b, Payload::text("hi")).await.unwrap();
        drop(rx);
        core.disconnect(b, &connection);

        let fetched = core.fetch_pending(b).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].id, message.id);
        assert_eq!(fetched[0].state, DeliveryState::Delivered);
        assert_eq!(core.confirm_delivered(b, a, message.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_open_conversation_resets_count_and_sends_receipt() {
        let (core, ids) = core_with_users(&["Alice", "Bob"]);
        let (a, b) = (&ids[0], &ids[1]);
        let mut a_rx = connect(&core, a).await;
        let _b_rx = connect(&core, b).await;

        let m1 = core.submit(a, b, Payload::text("one")).await.unwrap();
        let m2 = core.submit(a, b, Payload::image("https://cdn/cat.png")).await.unwrap();
        assert_eq!(core.unseen().count(b, a), 2);

        let conversation = core.open_conversation(b, a).await.unwrap();
        assert_eq!(conversation.unseen_before, 2);
        assert_eq!(core.unseen().count(b, a), 0);
        assert_eq!(conversation.messages.len(), 2);
        assert!(conversation
            .messages
            .iter()
            .all(|m| m.state == DeliveryState::Seen));

        assert_eq!(
            drain(&mut a_rx),
            vec![Push::Seen {
                by: b.clone(),
                message_ids: vec![m1.id, m2.id]
            }]
        );
    }

    #[tokio::test]
    async fn test_rapid_reconnects_keep_second_channel() {
        let (core, ids) = core_with_users(&["Alice", "Bob"]);
        let (a, b) = (&ids[0], &ids[1]);

        let (first, _first_rx) = MpscChannel::new();
        let first_id = first.id().clone();
        core.connect(b, first.clone()).await.unwrap();
        core.disconnect(b, &first_id);

        let (second, mut second_rx) = MpscChannel::new();
        let (third, mut third_rx) = MpscChannel::new();
        let second_id = second.id().clone();
        core.connect(b, second.clone()).await.unwrap();
        let outcome = core.connect(b, third.clone()).await.unwrap();
        assert!(outcome.replaced);

        // The evicted connection's teardown runs late.
        assert!(!core.disconnect(b, &second_id));
        assert_eq!(core.registry().connected_count(), 1);
        assert!(!second.is_open());

        core.submit(a, b, Payload::text("still here?")).await.unwrap();
        assert!(drain(&mut second_rx).is_empty());
        assert!(drain(&mut third_rx)
            .iter()
            .any(|p| matches!(p, Push::Message(_))));
    }

    #[tokio::test]
    async fn test_disconnect_closes_open_conversations() {
        let (core, ids) = core_with_users(&["Alice", "Bob"]);
        let (a, b) = (&ids[0], &ids[1]);

        let (channel, _rx) = MpscChannel::new();
        let connection = channel.id().clone();
        core.connect(b, channel).await.unwrap();
        core.open_conversation(b, a).await.unwrap();
        assert!(core.unseen().is_open(b, a));

        assert!(core.disconnect(b, &connection));
        assert!(!core.disconnect(b, &connection));
        assert!(!core.unseen().is_open(b, a));

        core.submit(a, b, Payload::text("later")).await.unwrap();
        assert_eq!(core.unseen().count(b, a), 1);
    }

    #[tokio::test]
    async fn test_unknown_users_rejected() {
        let (core, ids) = core_with_users(&["Alice"]);
        let ghost = UserId::new("ghost");

        assert!(matches!(
            core.submit(&ids[0], &ghost, Payload::text("boo")).await,
            Err(ChatError::Directory(DirectoryError::UnknownUser(_)))
        ));

        let (channel, _rx) = MpscChannel::new();
        assert!(matches!(
            core.connect(&ghost, channel).await,
            Err(ChatError::Directory(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_payload_rejected() {
        let (core, ids) = core_with_users(&["Alice", "Bob"]);
        let (a, b) = (&ids[0], &ids[1]);

        let both = Payload {
            text: Some("hi".into()),
            image: Some("x.png".into()),
        };
        assert!(matches!(
            core.submit(a, b, both).await,
            Err(ChatError::Validation(ValidationError::BothTextAndImage))
        ));
        assert!(matches!(
            core.submit(a, b, Payload::default()).await,
            Err(ChatError::Validation(ValidationError::Empty))
        ));
        assert!(core.store().load_conversation(a, b).await.unwrap().is_empty());
        assert_eq!(core.unseen().count(b, a), 0);
    }

    #[tokio::test]
    async fn test_sidebar_lists_others_with_state() {
        let (core, ids) = core_with_users(&["Carol", "alice", "Bob"]);
        let (carol, alice, bob) = (&ids[0], &ids[1], &ids[2]);
        let _bob_rx = connect(&core, bob).await;

        core.submit(bob, carol, Payload::text("hey")).await.unwrap();
        core.submit(bob, carol, Payload::text("you there?")).await.unwrap();

        let sidebar = core.sidebar(carol).unwrap();
        assert_eq!(sidebar.len(), 2);
        assert_eq!(&sidebar[0].user.id, alice);
        assert!(!sidebar[0].online);
        assert_eq!(sidebar[0].unseen, 0);
        assert_eq!(&sidebar[1].user.id, bob);
        assert!(sidebar[1].online);
        assert_eq!(sidebar[1].unseen, 2);
    }

    #[tokio::test]
    async fn test_logout_drops_connection() {
        let (core, ids) = core_with_users(&["Alice"]);
        let a = &ids[0];
        let mut rx = connect(&core, a).await;

        assert!(core.presence().is_online(a));
        assert!(core.logout(a));
        assert!(!core.presence().is_online(a));
        assert!(!core.logout(a));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_connects() {
        let (core, ids) = core_with_users(&["Alice", "Bob"]);
        let mut rx = connect(&core, &ids[0]).await;

        assert_eq!(core.shutdown(), 1);
        assert_eq!(rx.recv().await, None);

        let (channel, _rx) = MpscChannel::new();
        assert!(matches!(
            core.connect(&ids[1], channel).await,
            Err(ChatError::ShuttingDown)
        ));
        assert_eq!(core.registry().connected_count(), 0);
    }

    #[tokio::test]
    async fn test_presence_follows_connections() {
        let (core, ids) = core_with_users(&["Alice", "Bob"]);
        let mut presence = core.presence().subscribe();

        let (channel, _rx) = MpscChannel::new();
        let connection = channel.id().clone();
        core.connect(&ids[0], channel).await.unwrap();
        core.disconnect(&ids[0], &connection);

        let online = presence.recv().await.unwrap();
        let offline = presence.recv().await.unwrap();
        assert!(online.contains(&ids[0]));
        assert!(!offline.contains(&ids[0]));
        assert!(online.version < offline.version);
    }

    #[tokio::test]
    async fn test_self_conversation_rejected() {
        let (core, ids) = core_with_users(&["Alice"]);
        assert!(matches!(
            core.open_conversation(&ids[0], &ids[0]).await,
            Err(ChatError::Validation(ValidationError::SelfAddressed))
        ));
    }
}
