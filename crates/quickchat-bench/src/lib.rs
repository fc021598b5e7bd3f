//! Shared fixtures for the QuickChat benchmarks.

use quickchat_core::{ChatCore, CoreConfig, MpscChannel, NewUser, Push, UserId};
use quickchat_protocol::{Frame, MessageState, WireMessage};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::UnboundedReceiver;

/// Single-threaded runtime for driving async core calls from criterion.
pub fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build benchmark runtime")
}

/// A core with `users` registered accounts.
pub fn core_with_users(users: usize) -> (Arc<ChatCore>, Vec<UserId>) {
    let core = Arc::new(ChatCore::new(CoreConfig::default()));
    let ids = (0..users)
        .map(|i| {
            core.register_user(NewUser::named(format!("bench-{i}")))
                .expect("bench user should register")
                .id
        })
        .collect();
    (core, ids)
}

/// Connect every user, returning the receivers so channels stay open.
pub async fn connect_all(core: &ChatCore, users: &[UserId]) -> Vec<UnboundedReceiver<Push>> {
    let mut receivers = Vec::with_capacity(users.len());
    for user in users {
        let (channel, rx) = MpscChannel::new();
        core.connect(user, channel)
            .await
            .expect("bench user should connect");
        receivers.push(rx);
    }
    receivers
}

/// Drain `rx` the way the gateway does after each socket write, confirming
/// every message. Returns the number of pushes drained.
pub async fn confirm_received(
    core: &ChatCore,
    user: &UserId,
    rx: &mut UnboundedReceiver<Push>,
) -> usize {
    let mut drained = 0;
    while let Ok(push) = rx.try_recv() {
        if let Push::Message(message) = &push {
            core.confirm_delivered(user, &message.sender, message.id)
                .await
                .expect("bench confirm should succeed");
        }
        drained += 1;
    }
    drained
}

/// A delivered message frame carrying `text_len` bytes of text.
pub fn message_frame(text_len: usize) -> Frame {
    Frame::Message {
        message: WireMessage {
            id: 1,
            sender: "user_bench_a".into(),
            recipient: "user_bench_b".into(),
            created_at: 1_700_000_000_000,
            text: Some("x".repeat(text_len)),
            image: None,
            state: MessageState::Delivered,
        },
    }
}
