//! Unseen message counters.
//!
//! One inbox per recipient holds the per-sender counts and the set of
//! conversations the recipient currently has open. Each inbox is mutated
//! under its map entry lock, so `mark_open` reads and resets atomically with
//! respect to concurrent increments.

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use tokio::sync::broadcast;
use tracing::trace;

use crate::message::Message;
use crate::users::UserId;

/// Default broadcast capacity for unseen changes.
pub const DEFAULT_UNSEEN_CAPACITY: usize = 1024;

/// Notification that a count changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnseenChange {
    pub recipient: UserId,
    pub sender: UserId,
    pub count: u64,
}

#[derive(Debug, Default)]
struct Inbox {
    counts: HashMap<UserId, u64>,
    open: HashSet<UserId>,
}

/// Per-(recipient, sender) unread counts.
pub struct UnseenCounter {
    inboxes: DashMap<UserId, Inbox>,
    sender: broadcast::Sender<UnseenChange>,
}

impl UnseenCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_UNSEEN_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inboxes: DashMap::new(),
            sender,
        }
    }

    /// Receive a notification for every count change.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<UnseenChange> {
        self.sender.subscribe()
    }

    fn notify(&self, recipient: &UserId, sender: &UserId, count: u64) {
        let _ = self.sender.send(UnseenChange {
            recipient: recipient.clone(),
            sender: sender.clone(),
            count,
        });
    }

    /// Count a routed message.
    ///
    /// Returns the new count, or `None` if the recipient has the sender's
    /// conversation open and nothing was counted.
    pub fn on_message_routed(&self, message: &Message) -> Option<u64> {
        let mut inbox = self.inboxes.entry(message.recipient.clone()).or_default();

        if inbox.open.contains(&message.sender) {
            trace!(
                recipient = %message.recipient,
                sender = %message.sender,
                "Conversation open, not counted"
            );
            return None;
        }

        let count = inbox.counts.entry(message.sender.clone()).or_insert(0);
        *count = count.saturating_add(1);
        let count = *count;

        self.notify(&message.recipient, &message.sender, count);
        Some(count)
    }

    /// Mark a conversation open and reset its count.
    ///
    /// Returns the count before the reset.
    pub fn mark_open(&self, recipient: &UserId, sender: &UserId) -> u64 {
        let mut inbox = self.inboxes.entry(recipient.clone()).or_default();
        inbox.open.insert(sender.clone());
        let prior = inbox.counts.remove(sender).unwrap_or(0);

        if prior > 0 {
            self.notify(recipient, sender, 0);
        }
        prior
    }

    /// Mark a conversation closed. Returns `true` if it was open.
    pub fn mark_closed(&self, recipient: &UserId, sender: &UserId) -> bool {
        self.inboxes
            .get_mut(recipient)
            .is_some_and(|mut inbox| inbox.open.remove(sender))
    }

    /// Close every conversation the recipient has open.
    pub fn close_all(&self, recipient: &UserId) {
        if let Some(mut inbox) = self.inboxes.get_mut(recipient) {
            inbox.open.clear();
        }
    }

    #[must_use]
    pub fn is_open(&self, recipient: &UserId, sender: &UserId) -> bool {
        self.inboxes
            .get(recipient)
            .is_some_and(|inbox| inbox.open.contains(sender))
    }

    #[must_use]
    pub fn count(&self, recipient: &UserId, sender: &UserId) -> u64 {
        self.inboxes
            .get(recipient)
            .and_then(|inbox| inbox.counts.get(sender).copied())
            .unwrap_or(0)
    }

    /// All non-zero counts for a recipient, keyed by sender.
    #[must_use]
    pub fn counts_for(&self, recipient: &UserId) -> HashMap<UserId, u64> {
        self.inboxes
            .get(recipient)
            .map(|inbox| inbox.counts.clone())
            .unwrap_or_default()
    }
}

impl Default for UnseenCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Content;
    use std::sync::Arc;

    fn message(from: &str, to: &str) -> Message {
        Message::new(
            UserId::new(from),
            UserId::new(to),
            Content::Text("hi".into()),
        )
    }

    #[test]
    fn test_counts_until_opened() {
        let counter = UnseenCounter::new();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        assert_eq!(counter.on_message_routed(&message("alice", "bob")), Some(1));
        assert_eq!(counter.on_message_routed(&message("alice", "bob")), Some(2));
        assert_eq!(counter.count(&bob, &alice), 2);

        assert_eq!(counter.mark_open(&bob, &alice), 2);
        assert_eq!(counter.count(&bob, &alice), 0);
        assert_eq!(counter.mark_open(&bob, &alice), 0);
    }

    #[test]
    fn test_open_conversation_not_counted() {
        let counter = UnseenCounter::new();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        counter.mark_open(&bob, &alice);
        assert_eq!(counter.on_message_routed(&message("alice", "bob")), None);
        assert_eq!(counter.count(&bob, &alice), 0);

        assert!(counter.mark_closed(&bob, &alice));
        assert!(!counter.mark_closed(&bob, &alice));
        assert_eq!(counter.on_message_routed(&message("alice", "bob")), Some(1));
    }

    #[test]
    fn test_counts_are_per_sender() {
        let counter = UnseenCounter::new();
        let bob = UserId::new("bob");

        counter.on_message_routed(&message("alice", "bob"));
        counter.on_message_routed(&message("carol", "bob"));
        counter.on_message_routed(&message("carol", "bob"));
        counter.mark_open(&bob, &UserId::new("alice"));

        let counts = counter.counts_for(&bob);
        assert_eq!(counts.len(), 1);
        assert_eq!(counts.get(&UserId::new("carol")), Some(&2));
    }

    #[test]
    fn test_close_all() {
        let counter = UnseenCounter::new();
        let bob = UserId::new("bob");
        counter.mark_open(&bob, &UserId::new("alice"));
        counter.mark_open(&bob, &UserId::new("carol"));

        counter.close_all(&bob);
        assert!(!counter.is_open(&bob, &UserId::new("alice")));
        assert!(!counter.is_open(&bob, &UserId::new("carol")));
    }

    #[test]
    fn test_subscribe_receives_changes() {
        let counter = UnseenCounter::new();
        let mut rx = counter.subscribe();

        counter.on_message_routed(&message("alice", "bob"));
        counter.mark_open(&UserId::new("bob"), &UserId::new("alice"));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.count, 1);
        let reset = rx.try_recv().unwrap();
        assert_eq!(reset.count, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_concurrent_open_and_increment_never_loses_count() {
        let counter = Arc::new(UnseenCounter::new());
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let writer = {
            let counter = Arc::clone(&counter);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    counter.on_message_routed(&message("alice", "bob"));
                }
            })
        };

        let mut drained = 0;
        for _ in 0..100 {
            drained += counter.mark_open(&bob, &alice);
            counter.mark_closed(&bob, &alice);
        }
        writer.join().unwrap();
        drained += counter.count(&bob, &alice);

        // Every increment is either drained by mark_open, still counted, or
        // skipped because the conversation was open at that moment.
        assert!(drained <= 1000);
    }
}
