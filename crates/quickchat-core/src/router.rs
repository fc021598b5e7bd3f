//! Message router for QuickChat.
//!
//! Every (sender, recipient) pair owns an outbox behind an async mutex.
//! New messages are appended to the store and the outbox under that lock,
//! then pushed in queue order over the recipient's channel.
//!
//! A pushed message stays in the outbox, in flight, until the transport
//! confirms it wrote the message out. Only then is it recorded `delivered`.
//! If the transport dies first, the message is still `pending` and goes out
//! again on the next connection or fetch, so nothing is lost with a closed
//! channel and per-pair order holds on every path.

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::channel::{ConnectionId, Push, SharedChannel};
use crate::message::{
    DeliveryState, Message, MessageId, Payload, ValidationError, DEFAULT_MAX_TEXT_LENGTH,
};
use crate::registry::ConnectionRegistry;
use crate::store::{MessageStore, StoreError};
use crate::users::UserId;

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The payload was rejected; no message was created.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The message could not be persisted.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum text length, in characters.
    pub max_text_length: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_text_length: DEFAULT_MAX_TEXT_LENGTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PairKey {
    sender: UserId,
    recipient: UserId,
}

impl PairKey {
    fn new(sender: &UserId, recipient: &UserId) -> Self {
        Self {
            sender: sender.clone(),
            recipient: recipient.clone(),
        }
    }
}

/// A queued message and the connection it was last pushed to.
#[derive(Debug)]
struct Outgoing {
    message: Message,
    /// Set once pushed; cleared only by confirmation removing the entry.
    in_flight: Option<ConnectionId>,
}

type Outbox = Arc<Mutex<VecDeque<Outgoing>>>;

/// Routes messages between users.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn MessageStore>,
    outboxes: DashMap<PairKey, Outbox>,
    /// recipient -> senders that have an outbox to them.
    inbound: DashMap<UserId, DashSet<UserId>>,
    queued: AtomicUsize,
    config: RouterConfig,
}

impl MessageRouter {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn MessageStore>,
        config: RouterConfig,
    ) -> Self {
        info!("Creating message router with config: {:?}", config);
        Self {
            registry,
            store,
            outboxes: DashMap::new(),
            inbound: DashMap::new(),
            queued: AtomicUsize::new(0),
            config,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            conversation_count: self.outboxes.len(),
            queued_messages: self.queued.load(Ordering::Relaxed),
        }
    }

    fn outbox(&self, key: &PairKey) -> Outbox {
        if let Some(outbox) = self.outboxes.get(key) {
            return Arc::clone(outbox.value());
        }

        // `inbound` is only touched while the outbox shard is write-locked,
        // so it never disagrees with `outboxes` for long enough to matter.
        Arc::clone(
            self.outboxes
                .entry(key.clone())
                .or_insert_with(|| {
                    self.inbound
                        .entry(key.recipient.clone())
                        .or_default()
                        .insert(key.sender.clone());
                    Arc::new(Mutex::new(VecDeque::new()))
                })
                .value(),
        )
    }

    /// Drop the outbox for `key` if it is empty and nobody else holds it.
    ///
    /// Callers must have released their own handle first.
    fn prune(&self, key: &PairKey) {
        let Entry::Occupied(entry) = self.outboxes.entry(key.clone()) else {
            return;
        };
        let idle = Arc::strong_count(entry.get()) == 1
            && entry.get().try_lock().is_ok_and(|queue| queue.is_empty());
        if !idle {
            return;
        }

        if let Some(senders) = self.inbound.get(&key.recipient) {
            senders.remove(&key.sender);
        }
        self.inbound
            .remove_if(&key.recipient, |_, senders| senders.is_empty());
        entry.remove();
        trace!(sender = %key.sender, recipient = %key.recipient, "Outbox pruned");
    }

    fn senders_to(&self, recipient: &UserId) -> Vec<UserId> {
        self.inbound
            .get(recipient)
            .map(|senders| senders.iter().map(|s| s.key().clone()).collect())
            .unwrap_or_default()
    }

    /// Submit a message from `sender` to `recipient`.
    ///
    /// The message is stored and queued as `pending`, then pushed if the
    /// recipient is connected. It stays queued until the recipient's
    /// transport confirms it with [`confirm_delivered`](Self::confirm_delivered)
    /// or the recipient fetches it.
    ///
    /// # Errors
    ///
    /// Returns a validation error (and creates nothing) for a bad payload, or a
    /// store error if the message could not be persisted.
    pub async fn submit(
        &self,
        sender: &UserId,
        recipient: &UserId,
        payload: Payload,
    ) -> Result<Message, RouterError> {
        if sender == recipient {
            return Err(ValidationError::SelfAddressed.into());
        }
        let content = payload.validate(self.config.max_text_length)?;

        let key = PairKey::new(sender, recipient);
        let outbox = self.outbox(&key);
        let mut queue = outbox.lock().await;

        let message = Message::new(sender.clone(), recipient.clone(), content);
        self.store.append_message(&message).await?;
        queue.push_back(Outgoing {
            message: message.clone(),
            in_flight: None,
        });
        self.queued.fetch_add(1, Ordering::Relaxed);

        let pushed = match self.registry.lookup(recipient) {
            Some(channel) => self.drain(recipient, &channel, &mut queue).contains(&message.id),
            None => false,
        };

        debug!(
            message_id = message.id,
            sender = %sender,
            recipient = %recipient,
            pushed,
            "Message routed"
        );

        Ok(message)
    }

    /// Push every queued message not yet handed to `channel`, oldest first,
    /// stopping at the first failure. Returns the ids that were pushed.
    fn drain(
        &self,
        recipient: &UserId,
        channel: &SharedChannel,
        queue: &mut VecDeque<Outgoing>,
    ) -> Vec<MessageId> {
        let mut pushed = Vec::new();

        for entry in queue.iter_mut() {
            if entry.in_flight.as_ref() == Some(channel.id()) {
                continue;
            }

            let mut message = entry.message.clone();
            message.state.advance(DeliveryState::Delivered);

            if let Err(e) = channel.send(Push::Message(message)) {
                warn!(
                    recipient = %recipient,
                    connection = %channel.id(),
                    error = %e,
                    "Push failed, message stays pending"
                );
                self.registry.unregister(recipient, channel.id());
                break;
            }

            entry.in_flight = Some(channel.id().clone());
            pushed.push(entry.message.id);
        }

        pushed
    }

    async fn record_state(&self, id: MessageId, state: DeliveryState) {
        if let Err(e) = self.store.set_delivery_state(id, state).await {
            warn!(message_id = id, state = %state, error = %e, "Failed to record delivery state");
        }
    }

    /// The recipient's transport wrote message `id` out.
    ///
    /// Removes it from the outbox and records it `delivered`. Returns `false`
    /// if the message was no longer queued (already confirmed, fetched or
    /// seen).
    pub async fn confirm_delivered(
        &self,
        sender: &UserId,
        recipient: &UserId,
        id: MessageId,
    ) -> bool {
        let key = PairKey::new(sender, recipient);
        let Some(outbox) = self.outboxes.get(&key).map(|o| Arc::clone(o.value())) else {
            return false;
        };

        let confirmed = {
            let mut queue = outbox.lock().await;
            match queue.iter().position(|entry| entry.message.id == id) {
                Some(position) => {
                    queue.remove(position);
                    self.queued.fetch_sub(1, Ordering::Relaxed);
                    self.record_state(id, DeliveryState::Delivered).await;
                    true
                }
                None => false,
            }
        };

        drop(outbox);
        self.prune(&key);
        confirmed
    }

    /// Push every outbox addressed to `recipient` over its live channel.
    ///
    /// Called after a (re)connect. Messages still in flight to an earlier
    /// connection are pushed again. Returns the ids that were pushed.
    pub async fn deliver_pending(&self, recipient: &UserId) -> Vec<MessageId> {
        let Some(channel) = self.registry.lookup(recipient) else {
            return Vec::new();
        };

        let mut pushed = Vec::new();
        for sender in self.senders_to(recipient) {
            let key = PairKey::new(&sender, recipient);
            let outbox = self.outbox(&key);
            {
                let mut queue = outbox.lock().await;
                pushed.extend(self.drain(recipient, &channel, &mut queue));
            }
            drop(outbox);
            self.prune(&key);

            if !channel.is_open() {
                break;
            }
        }

        if !pushed.is_empty() {
            info!(recipient = %recipient, count = pushed.len(), "Flushed pending messages");
        }
        pushed
    }

    async fn take_outbox(&self, key: &PairKey) -> Vec<Message> {
        let outbox = self.outbox(key);
        let mut fetched = Vec::new();
        {
            let mut queue = outbox.lock().await;
            self.queued.fetch_sub(queue.len(), Ordering::Relaxed);

            for Outgoing { mut message, .. } in queue.drain(..) {
                message.state.advance(DeliveryState::Delivered);
                self.record_state(message.id, DeliveryState::Delivered).await;
                fetched.push(message);
            }
        }
        drop(outbox);
        self.prune(key);
        fetched
    }

    /// Hand every queued message addressed to `recipient` to the caller,
    /// marking them delivered. Oldest first.
    ///
    /// This includes messages in flight to a live connection, which may then
    /// reach the recipient twice; their confirmation becomes a no-op.
    pub async fn fetch_pending(&self, recipient: &UserId) -> Vec<Message> {
        let mut fetched = Vec::new();
        for sender in self.senders_to(recipient) {
            fetched.extend(self.take_outbox(&PairKey::new(&sender, recipient)).await);
        }
        fetched.sort_by_key(Message::order_key);

        trace!(recipient = %recipient, count = fetched.len(), "Fetched pending messages");
        fetched
    }

    /// Mark everything `sender` sent to `recipient` as seen.
    ///
    /// Still-queued messages are taken out of the outbox first, so states
    /// only ever move forward. Returns the ids that changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the conversation cannot be loaded.
    pub async fn mark_seen(
        &self,
        recipient: &UserId,
        sender: &UserId,
    ) -> Result<Vec<MessageId>, RouterError> {
        let key = PairKey::new(sender, recipient);
        let outbox = self.outbox(&key);
        let seen = {
            let mut queue = outbox.lock().await;
            self.queued.fetch_sub(queue.len(), Ordering::Relaxed);
            queue.clear();
            self.seen_in_store(recipient, sender).await
        };
        drop(outbox);
        self.prune(&key);

        let seen = seen?;
        if !seen.is_empty() {
            debug!(recipient = %recipient, sender = %sender, count = seen.len(), "Messages seen");
        }
        Ok(seen)
    }

    async fn seen_in_store(
        &self,
        recipient: &UserId,
        sender: &UserId,
    ) -> Result<Vec<MessageId>, RouterError> {
        let conversation = self.store.load_conversation(recipient, sender).await?;
        let mut seen = Vec::new();
        for message in conversation
            .iter()
            .filter(|m| &m.sender == sender && m.state < DeliveryState::Seen)
        {
            let state = self
                .store
                .set_delivery_state(message.id, DeliveryState::Seen)
                .await?;
            if state == DeliveryState::Seen {
                seen.push(message.id);
            }
        }
        Ok(seen)
    }

    /// Mark a single message as seen.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is unknown to the store.
    pub async fn mark_message_seen(&self, id: MessageId) -> Result<DeliveryState, RouterError> {
        Ok(self.store.set_delivery_state(id, DeliveryState::Seen).await?)
    }

    /// Number of messages queued or in flight from `sender` to `recipient`.
    pub async fn queued_between(&self, sender: &UserId, recipient: &UserId) -> usize {
        let outbox = self
            .outboxes
            .get(&PairKey::new(sender, recipient))
            .map(|o| Arc::clone(o.value()));
        match outbox {
            Some(outbox) => outbox.lock().await.len(),
            None => 0,
        }
    }
}

/// Router statistics.
#[derive(Debug, Clone)]
pub struct RouterStats {
    /// (sender, recipient) pairs with a non-empty or busy outbox.
    pub conversation_count: usize,
    /// Messages queued or in flight, not yet confirmed.
    pub queued_messages: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ConnectionId, MpscChannel};
    use crate::store::InMemoryStore;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<ConnectionRegistry>, Arc<InMemoryStore>, MessageRouter) {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(InMemoryStore::new());
        let router = MessageRouter::new(
            Arc::clone(&registry),
            store.clone(),
            RouterConfig::default(),
        );
        (registry, store, router)
    }

    fn connect(registry: &ConnectionRegistry, user: &UserId) -> mpsc::UnboundedReceiver<Push> {
        let (channel, rx) = MpscChannel::new();
        registry.register(user, channel);
        rx
    }

    fn texts(rx: &mut mpsc::UnboundedReceiver<Push>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(push) = rx.try_recv() {
            if let Push::Message(m) = push {
                out.push(m.text().unwrap_or_default().to_string());
            }
        }
        out
    }

    #[tokio::test]
    async fn test_submit_live_delivery() {
        let (registry, store, router) = setup();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        let mut rx = connect(&registry, &bob);

        let message = router
            .submit(&alice, &bob, Payload::text("hello"))
            .await
            .unwrap();
        assert_eq!(message.state, DeliveryState::Pending);

        match rx.try_recv().unwrap() {
            Push::Message(pushed) => {
                assert_eq!(pushed.id, message.id);
                assert_eq!(pushed.state, DeliveryState::Delivered);
            }
            other => panic!("unexpected push: {other:?}"),
        }

        // Pushed but not yet written out by the transport.
        let stored = store.load_conversation(&alice, &bob).await.unwrap();
        assert_eq!(stored[0].state, DeliveryState::Pending);
        assert_eq!(router.queued_between(&alice, &bob).await, 1);

        assert!(router.confirm_delivered(&alice, &bob, message.id).await);
        let stored = store.load_conversation(&alice, &bob).await.unwrap();
        assert_eq!(stored[0].state, DeliveryState::Delivered);
        assert_eq!(router.queued_between(&alice, &bob).await, 0);
        assert!(!router.confirm_delivered(&alice, &bob, message.id).await);
    }

    #[tokio::test]
    async fn test_submit_offline_stays_pending() {
        let (_registry, store, router) = setup();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let message = router.submit(&alice, &bob, Payload::text("hi")).await.unwrap();
        assert_eq!(message.state, DeliveryState::Pending);
        assert_eq!(router.queued_between(&alice, &bob).await, 1);
        assert_eq!(router.stats().queued_messages, 1);

        let stored = store.load_conversation(&bob, &alice).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, DeliveryState::Pending);
    }

    #[tokio::test]
    async fn test_invalid_payload_creates_nothing() {
        let (_registry, store, router) = setup();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let both = Payload {
            text: Some("hi".into()),
            image: Some("x.png".into()),
        };
        assert!(matches!(
            router.submit(&alice, &bob, both).await,
            Err(RouterError::Validation(ValidationError::BothTextAndImage))
        ));
        assert!(matches!(
            router.submit(&alice, &bob, Payload::default()).await,
            Err(RouterError::Validation(ValidationError::Empty))
        ));
        assert!(matches!(
            router.submit(&alice, &alice, Payload::text("me")).await,
            Err(RouterError::Validation(ValidationError::SelfAddressed))
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_failed_push_keeps_pending_and_unbinds() {
        let (registry, _store, router) = setup();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        let rx = connect(&registry, &bob);
        drop(rx);

        let message = router.submit(&alice, &bob, Payload::text("lost?")).await.unwrap();
        assert_eq!(message.state, DeliveryState::Pending);
        assert!(!registry.is_connected(&bob));
        assert_eq!(router.queued_between(&alice, &bob).await, 1);
    }

    #[tokio::test]
    async fn test_reconnect_flushes_in_order() {
        let (registry, _store, router) = setup();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        for text in ["one", "two", "three"] {
            router.submit(&alice, &bob, Payload::text(text)).await.unwrap();
        }

        let mut rx = connect(&registry, &bob);
        let flushed = router.deliver_pending(&bob).await;
        assert_eq!(flushed.len(), 3);

        router.submit(&alice, &bob, Payload::text("four")).await.unwrap();
        assert_eq!(texts(&mut rx), vec!["one", "two", "three", "four"]);
        assert_eq!(router.stats().queued_messages, 4);

        for id in flushed {
            assert!(router.confirm_delivered(&alice, &bob, id).await);
        }
        assert_eq!(router.queued_between(&alice, &bob).await, 1);
    }

    #[tokio::test]
    async fn test_unconfirmed_push_resent_on_reconnect() {
        let (registry, store, router) = setup();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let (first, first_rx) = MpscChannel::with_id(ConnectionId::from("c1"));
        registry.register(&bob, first);
        let message = router.submit(&alice, &bob, Payload::text("hi")).await.unwrap();

        // The push was queued on the channel, but the socket never wrote it.
        drop(first_rx);
        registry.unregister(&bob, &ConnectionId::from("c1"));

        let (second, mut second_rx) = MpscChannel::with_id(ConnectionId::from("c2"));
        registry.register(&bob, second);
        assert_eq!(router.deliver_pending(&bob).await, vec![message.id]);
        assert_eq!(texts(&mut second_rx), vec!["hi"]);

        // Already in flight on this connection: not pushed twice.
        assert!(router.deliver_pending(&bob).await.is_empty());
        assert!(texts(&mut second_rx).is_empty());

        let stored = store.load_conversation(&alice, &bob).await.unwrap();
        assert_eq!(stored[0].state, DeliveryState::Pending);

        assert!(router.confirm_delivered(&alice, &bob, message.id).await);
        assert_eq!(router.stats().queued_messages, 0);
    }

    #[tokio::test]
    async fn test_idle_outboxes_pruned() {
        let (registry, _store, router) = setup();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        let carol = UserId::new("carol");
        let _rx = connect(&registry, &bob);

        let live = router.submit(&alice, &bob, Payload::text("a")).await.unwrap();
        router.submit(&carol, &bob, Payload::text("c")).await.unwrap();
        assert_eq!(router.stats().conversation_count, 2);

        assert!(router.confirm_delivered(&alice, &bob, live.id).await);
        assert_eq!(router.stats().conversation_count, 1);
        assert_eq!(router.senders_to(&bob), vec![carol.clone()]);

        router.fetch_pending(&bob).await;
        assert_eq!(router.stats().conversation_count, 0);
        assert!(router.senders_to(&bob).is_empty());
        assert!(router.inbound.is_empty());

        // A fresh outbox works after pruning.
        router.submit(&alice, &bob, Payload::text("again")).await.unwrap();
        assert_eq!(router.queued_between(&alice, &bob).await, 1);
    }

    #[tokio::test]
    async fn test_fetch_pending_marks_delivered() {
        let (_registry, store, router) = setup();
        let alice = UserId::new("alice");
        let carol = UserId::new("carol");
        let bob = UserId::new("bob");

        router.submit(&alice, &bob, Payload::text("a1")).await.unwrap();
        router.submit(&carol, &bob, Payload::text("c1")).await.unwrap();
        router.submit(&alice, &bob, Payload::text("a2")).await.unwrap();

        let fetched = router.fetch_pending(&bob).await;
        let order: Vec<_> = fetched.iter().filter_map(|m| m.text()).collect();
        assert_eq!(order, vec!["a1", "c1", "a2"]);
        assert!(fetched.iter().all(|m| m.state == DeliveryState::Delivered));

        let stored = store.load_conversation(&alice, &bob).await.unwrap();
        assert!(stored.iter().all(|m| m.state == DeliveryState::Delivered));
        assert!(router.fetch_pending(&bob).await.is_empty());
        assert_eq!(router.stats().conversation_count, 0);
    }

    #[tokio::test]
    async fn test_mark_seen_only_for_sender_direction() {
        let (_registry, store, router) = setup();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let to_bob = router.submit(&alice, &bob, Payload::text("hi")).await.unwrap();
        let to_alice = router.submit(&bob, &alice, Payload::text("yo")).await.unwrap();

        let seen = router.mark_seen(&bob, &alice).await.unwrap();
        assert_eq!(seen, vec![to_bob.id]);
        assert_eq!(router.queued_between(&alice, &bob).await, 0);

        let conversation = store.load_conversation(&alice, &bob).await.unwrap();
        let state_of = |id| conversation.iter().find(|m| m.id == id).unwrap().state;
        assert_eq!(state_of(to_bob.id), DeliveryState::Seen);
        assert_eq!(state_of(to_alice.id), DeliveryState::Pending);

        assert!(router.mark_seen(&bob, &alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_submits_keep_pair_order() {
        let (registry, _store, router) = setup();
        let router = Arc::new(router);
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        let mut rx = connect(&registry, &bob);

        // Submissions from one task complete in order; a second sender's
        // traffic interleaves freely.
        let a = {
            let router = Arc::clone(&router);
            let (alice, bob) = (alice.clone(), bob.clone());
            tokio::spawn(async move {
                for i in 0..100 {
                    router
                        .submit(&alice, &bob, Payload::text(format!("a{i}")))
                        .await
                        .unwrap();
                }
            })
        };
        let c = {
            let router = Arc::clone(&router);
            let bob = bob.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    router
                        .submit(&UserId::new("carol"), &bob, Payload::text(format!("c{i}")))
                        .await
                        .unwrap();
                }
            })
        };
        a.await.unwrap();
        c.await.unwrap();

        let from_alice: Vec<String> = texts(&mut rx)
            .into_iter()
            .filter(|t| t.starts_with('a'))
            .collect();
        let expected: Vec<String> = (0..100).map(|i| format!("a{i}")).collect();
        assert_eq!(from_alice, expected);
    }

    #[tokio::test]
    async fn test_evicted_channel_not_used() {
        let (registry, _store, router) = setup();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let (first, mut first_rx) = MpscChannel::with_id(ConnectionId::from("c1"));
        let (second, mut second_rx) = MpscChannel::with_id(ConnectionId::from("c2"));
        registry.register(&bob, first.clone());
        registry.register(&bob, second);
        assert!(!first.is_open());

        router.submit(&alice, &bob, Payload::text("hi")).await.unwrap();
        assert!(texts(&mut first_rx).is_empty());
        assert_eq!(texts(&mut second_rx), vec!["hi"]);
    }
}
