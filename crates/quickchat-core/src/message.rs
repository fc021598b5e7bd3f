//! Message types for QuickChat.
//!
//! A [`Message`] carries exactly one of text or an image reference and moves
//! through the delivery states `pending → delivered → seen`, never backwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::users::UserId;

/// Default maximum text length, in characters.
pub const DEFAULT_MAX_TEXT_LENGTH: usize = 4096;

/// A unique message identifier.
pub type MessageId = u64;

/// Last issued id; ids are strictly increasing within a process.
static LAST_ID: AtomicU64 = AtomicU64::new(0);

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();

    let mut last = LAST_ID.load(Ordering::Relaxed);
    loop {
        let next = timestamp.max(last + 1);
        match LAST_ID.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Milliseconds since the UNIX epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Delivery lifecycle of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Seen,
}

impl DeliveryState {
    /// Move forward to `next`.
    ///
    /// Returns `true` if the state changed. Regressions are ignored.
    pub fn advance(&mut self, next: DeliveryState) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Seen => "seen",
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message must carry either text or an image, not both")]
    BothTextAndImage,

    #[error("Message must carry text or an image")]
    Empty,

    #[error("Text is {len} characters, maximum is {max}")]
    TextTooLong { len: usize, max: usize },

    #[error("Cannot send a message to yourself")]
    SelfAddressed,
}

/// A submitted payload, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Payload {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            image: None,
        }
    }

    #[must_use]
    pub fn image(reference: impl Into<String>) -> Self {
        Self {
            text: None,
            image: Some(reference.into()),
        }
    }

    /// Check that exactly one of text or image is set.
    ///
    /// Text is trimmed; whitespace-only text counts as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if both or neither are set, or the text is too long.
    pub fn validate(self, max_text_length: usize) -> Result<Content, ValidationError> {
        let text = self
            .text
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let image = self.image.filter(|i| !i.trim().is_empty());

        match (text, image) {
            (Some(_), Some(_)) => Err(ValidationError::BothTextAndImage),
            (None, None) => Err(ValidationError::Empty),
            (Some(text), None) => {
                let len = text.chars().count();
                if len > max_text_length {
                    return Err(ValidationError::TextTooLong {
                        len,
                        max: max_text_length,
                    });
                }
                Ok(Content::Text(text))
            }
            (None, Some(image)) => Ok(Content::Image(image)),
        }
    }
}

/// Validated message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Content {
    Text(String),
    /// Opaque image reference (URL or data URI).
    Image(String),
}

/// A chat message between two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: UserId,
    pub recipient: UserId,
    /// Creation time (ms since epoch).
    pub created_at: u64,
    pub content: Content,
    pub state: DeliveryState,
}

impl Message {
    /// Create a pending message.
    #[must_use]
    pub fn new(sender: UserId, recipient: UserId, content: Content) -> Self {
        Self {
            id: generate_message_id(),
            sender,
            recipient,
            created_at: now_millis(),
            content,
            state: DeliveryState::Pending,
        }
    }

    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            Content::Text(t) => Some(t),
            Content::Image(_) => None,
        }
    }

    #[must_use]
    pub fn image(&self) -> Option<&str> {
        match &self.content {
            Content::Image(i) => Some(i),
            Content::Text(_) => None,
        }
    }

    /// Whether `user` is one of the two participants.
    #[must_use]
    pub fn involves(&self, user: &UserId) -> bool {
        &self.sender == user || &self.recipient == user
    }

    /// Creation order: timestamp, then id.
    #[must_use]
    pub fn order_key(&self) -> (u64, MessageId) {
        (self.created_at, self.id)
    }
}

/// Direction-independent key for the conversation between two users.
#[must_use]
pub fn conversation_key(a: &UserId, b: &UserId) -> (UserId, UserId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}
