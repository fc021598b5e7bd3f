//! Message persistence.
//!
//! The core only talks to storage through [`MessageStore`]; the storage
//! format is up to the implementation. [`InMemoryStore`] keeps everything
//! in process memory.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::trace;

use crate::message::{conversation_key, DeliveryState, Message, MessageId};
use crate::users::UserId;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No message with this id.
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// A message with this id already exists.
    #[error("Duplicate message: {0}")]
    Duplicate(MessageId),

    /// Backend-specific failure.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Persistence seam for messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a newly created message.
    async fn append_message(&self, message: &Message) -> Result<(), StoreError>;

    /// All messages between two users, oldest first.
    async fn load_conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>, StoreError>;

    /// Advance a message's delivery state. Regressions are ignored.
    ///
    /// Returns the state after the update.
    async fn set_delivery_state(
        &self,
        id: MessageId,
        state: DeliveryState,
    ) -> Result<DeliveryState, StoreError>;
}

/// In-memory [`MessageStore`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    conversations: DashMap<(UserId, UserId), Vec<Message>>,
    index: DashMap<MessageId, (UserId, UserId)>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn append_message(&self, message: &Message) -> Result<(), StoreError> {
        let key = conversation_key(&message.sender, &message.recipient);

        match self.index.entry(message.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StoreError::Duplicate(message.id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(key.clone());
            }
        }

        let mut conversation = self.conversations.entry(key).or_default();
        // Keep creation order even if appends from different pairs interleave.
        let position = conversation.partition_point(|m| m.order_key() <= message.order_key());
        conversation.insert(position, message.clone());

        trace!(message_id = message.id, "Message stored");
        Ok(())
    }

    async fn load_conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .conversations
            .get(&conversation_key(a, b))
            .map(|c| c.clone())
            .unwrap_or_default())
    }

    async fn set_delivery_state(
        &self,
        id: MessageId,
        state: DeliveryState,
    ) -> Result<DeliveryState, StoreError> {
        let key = self
            .index
            .get(&id)
            .map(|k| k.clone())
            .ok_or(StoreError::NotFound(id))?;

        let mut conversation = self
            .conversations
            .get_mut(&key)
            .ok_or(StoreError::NotFound(id))?;

        let message = conversation
            .iter_mut()
            .rev()
            .find(|m| m.id == id)
            .ok_or(StoreError::NotFound(id))?;

        message.state.advance(state);
        Ok(message.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Content;

    fn message(from: &str, to: &str, text: &str) -> Message {
        Message::new(
            UserId::new(from),
            UserId::new(to),
            Content::Text(text.into()),
        )
    }

    #[tokio::test]
    async fn test_append_and_load_both_directions() {
        let store = InMemoryStore::new();
        let m1 = message("alice", "bob", "one");
        let m2 = message("bob", "alice", "two");
        store.append_message(&m1).await.unwrap();
        store.append_message(&m2).await.unwrap();
        store
            .append_message(&message("alice", "carol", "other"))
            .await
            .unwrap();

        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        let forward = store.load_conversation(&alice, &bob).await.unwrap();
        let backward = store.load_conversation(&bob, &alice).await.unwrap();

        assert_eq!(forward, backward);
        assert_eq!(forward, vec![m1, m2]);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let store = InMemoryStore::new();
        let m = message("alice", "bob", "one");
        store.append_message(&m).await.unwrap();
        assert!(matches!(
            store.append_message(&m).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_delivery_state_never_regresses() {
        let store = InMemoryStore::new();
        let m = message("alice", "bob", "one");
        store.append_message(&m).await.unwrap();

        assert_eq!(
            store.set_delivery_state(m.id, DeliveryState::Seen).await.unwrap(),
            DeliveryState::Seen
        );
        assert_eq!(
            store
                .set_delivery_state(m.id, DeliveryState::Delivered)
                .await
                .unwrap(),
            DeliveryState::Seen
        );
        assert!(matches!(
            store.set_delivery_state(42, DeliveryState::Seen).await,
            Err(StoreError::NotFound(42))
        ));
    }
}
