//! Conversions between core types and protocol frames.

use quickchat_core::{
    ChatError, Content, DeliveryState, DirectoryError, Message, PresenceSnapshot, Push,
};
use quickchat_protocol::{codes, Frame, MessageState, WireMessage};

fn wire_state(state: DeliveryState) -> MessageState {
    match state {
        DeliveryState::Pending => MessageState::Pending,
        DeliveryState::Delivered => MessageState::Delivered,
        DeliveryState::Seen => MessageState::Seen,
    }
}

/// Convert a core message to its wire form.
#[must_use]
pub fn to_wire(message: &Message) -> WireMessage {
    let (text, image) = match &message.content {
        Content::Text(t) => (Some(t.clone()), None),
        Content::Image(i) => (None, Some(i.clone())),
    };

    WireMessage {
        id: message.id,
        sender: message.sender.to_string(),
        recipient: message.recipient.to_string(),
        created_at: message.created_at,
        text,
        image,
        state: wire_state(message.state),
    }
}

#[must_use]
pub fn to_wire_all(messages: &[Message]) -> Vec<WireMessage> {
    messages.iter().map(to_wire).collect()
}

/// Frame for a push from the core.
#[must_use]
pub fn push_frame(push: Push) -> Frame {
    match push {
        Push::Message(message) => Frame::Message {
            message: to_wire(&message),
        },
        Push::Unseen { sender, count } => Frame::Unseen {
            sender: sender.to_string(),
            count,
        },
        Push::Seen { by, message_ids } => Frame::Seen {
            by: by.to_string(),
            message_ids,
        },
    }
}

#[must_use]
pub fn presence_frame(snapshot: &PresenceSnapshot) -> Frame {
    Frame::Presence {
        version: snapshot.version,
        online: snapshot.online.iter().map(ToString::to_string).collect(),
    }
}

/// Protocol error code for a core error.
#[must_use]
pub fn error_code(err: &ChatError) -> u16 {
    match err {
        ChatError::Validation(_) | ChatError::Directory(DirectoryError::InvalidDisplayName(_)) => {
            codes::VALIDATION
        }
        ChatError::Directory(DirectoryError::UnknownUser(_)) => codes::UNKNOWN_USER,
        ChatError::Store(_) | ChatError::ShuttingDown => codes::INTERNAL,
    }
}

#[must_use]
pub fn error_frame(id: u64, err: &ChatError) -> Frame {
    Frame::error(id, error_code(err), err.to_string())
}
