//! WebSocket chat sessions.
//!
//! A session starts with a `connect` handshake that names the user and picks
//! the wire format. After that it multiplexes three sources onto the socket:
//! pushes from the core, presence snapshots, and client requests.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use quickchat_core::message::now_millis;
use quickchat_core::{Channel, ConnectionId, MpscChannel, Payload, PresenceSnapshot, Push, UserId};
use quickchat_protocol::{codes, negotiate, Encoded, Frame, FrameCodec, Version, WireFormat};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::handlers::AppState;
use crate::metrics::{self, Direction, SessionGauge};
use crate::wire::{error_frame, presence_frame, push_frame, to_wire, to_wire_all};

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

enum Handshake {
    Ready {
        user: UserId,
        version: Version,
        /// Frames that arrived in the same binary batch as `connect`.
        pending_frames: Vec<Frame>,
    },
    Rejected(Frame),
    Closed,
}

/// Encode `frame` in the codec's format and send it.
async fn send_frame(
    sender: &mut WsSender,
    codec: &FrameCodec,
    frame: &Frame,
) -> Result<(), axum::Error> {
    let encoded = match codec.encode(frame) {
        Ok(encoded) => encoded,
        Err(e) => {
            warn!(frame_type = frame.frame_type().as_str(), error = %e, "Failed to encode frame");
            metrics::record_error("encode");
            return Ok(());
        }
    };

    metrics::record_frame(Direction::Outbound, encoded.len());
    let message = match encoded {
        Encoded::Binary(data) => Message::Binary(data.to_vec()),
        Encoded::Text(text) => Message::Text(text),
    };
    sender.send(message).await
}

fn authenticate(
    version: u8,
    token: Option<String>,
    state: &AppState,
    pending_frames: Vec<Frame>,
) -> Handshake {
    let Some(version) = negotiate(version) else {
        return Handshake::Rejected(Frame::error(
            0,
            codes::UNSUPPORTED_VERSION,
            format!("Unsupported protocol version {version}"),
        ));
    };

    let Some(token) = token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) else {
        return Handshake::Rejected(Frame::error(0, codes::UNKNOWN_USER, "Missing token"));
    };

    let user = UserId::new(token);
    if !state.core.users().contains(&user) {
        return Handshake::Rejected(Frame::error(
            0,
            codes::UNKNOWN_USER,
            format!("Unknown user: {user}"),
        ));
    }

    Handshake::Ready {
        user,
        version,
        pending_frames,
    }
}

/// Wait for the `connect` frame. The format of the first data message
/// becomes the connection's format. Anything batched after `connect` is
/// handed back for the session to process.
async fn await_connect(
    receiver: &mut WsReceiver,
    codec: &mut FrameCodec,
    state: &AppState,
) -> Handshake {
    while let Some(msg) = receiver.next().await {
        let decoded = match msg {
            Ok(Message::Binary(data)) => {
                codec.set_format(WireFormat::Binary);
                match codec.decode_binary(&data) {
                    Ok(frames) if frames.is_empty() => continue,
                    Ok(frames) => Ok(frames),
                    Err(e) => Err(e),
                }
            }
            Ok(Message::Text(text)) => {
                codec.set_format(WireFormat::Text);
                codec.decode_text(&text).map(|frame| vec![frame])
            }
            Ok(Message::Close(_)) | Err(_) => return Handshake::Closed,
            Ok(_) => continue,
        };

        let mut frames = match decoded {
            Ok(frames) => frames.into_iter(),
            Err(e) => {
                return Handshake::Rejected(Frame::error(0, codes::MALFORMED_FRAME, e.to_string()))
            }
        };

        return match frames.next() {
            Some(Frame::Connect { version, token }) => {
                authenticate(version, token, state, frames.collect())
            }
            Some(other) => Handshake::Rejected(Frame::error(
                other.request_id().unwrap_or(0),
                codes::NOT_CONNECTED,
                "Expected a connect frame",
            )),
            None => continue,
        };
    }

    Handshake::Closed
}

/// Handle a WebSocket connection from upgrade to close.
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let _session_gauge = SessionGauge::open();
    let (mut sender, mut receiver) = socket.split();
    let mut codec = FrameCodec::default();

    let handshake = match tokio::time::timeout(
        state.config.heartbeat.handshake_timeout(),
        await_connect(&mut receiver, &mut codec, &state),
    )
    .await
    {
        Ok(handshake) => handshake,
        Err(_) => {
            debug!("Handshake timed out");
            metrics::record_error("handshake_timeout");
            return;
        }
    };

    let (user, version, pending_frames) = match handshake {
        Handshake::Ready {
            user,
            version,
            pending_frames,
        } => (user, version, pending_frames),
        Handshake::Rejected(frame) => {
            warn!(frame = ?frame, "Handshake rejected");
            metrics::record_error("handshake");
            let _ = send_frame(&mut sender, &codec, &frame).await;
            let _ = sender.close().await;
            return;
        }
        Handshake::Closed => return,
    };

    // Subscribe before connecting so no presence change is missed.
    let presence_rx = state.core.presence().subscribe();

    let (channel, push_rx) = MpscChannel::new();
    let connection = channel.id().clone();

    let outcome = match state.core.connect(&user, channel).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(user = %user, error = %e, "Connect failed");
            let _ = send_frame(&mut sender, &codec, &error_frame(0, &e)).await;
            let _ = sender.close().await;
            return;
        }
    };
    metrics::set_users_online(state.core.presence().count());

    let mut session = Session {
        state: Arc::clone(&state),
        sender,
        codec,
        user: user.clone(),
        connection: connection.clone(),
        last_presence: None,
    };

    let heartbeat_ms = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    let connected = Frame::connected(connection.as_str(), user.as_str(), version.major, heartbeat_ms);

    if session.send(&connected).await.is_ok() {
        info!(
            user = %user,
            connection = %connection,
            format = ?session.codec.format(),
            flushed = outcome.flushed,
            "Session started"
        );

        let snapshot = state.core.presence().online_snapshot();
        if session.send_presence(&snapshot).await.is_ok()
            && session.handle_frames(pending_frames).await.is_ok()
        {
            session.run(receiver, push_rx, presence_rx).await;
        }
    }

    state.core.disconnect(&user, &connection);
    metrics::set_users_online(state.core.presence().count());
    debug!(user = %user, connection = %connection, "Session ended");
}

struct Session {
    state: Arc<AppState>,
    sender: WsSender,
    codec: FrameCodec,
    user: UserId,
    connection: ConnectionId,
    last_presence: Option<u64>,
}

impl Session {
    async fn send(&mut self, frame: &Frame) -> Result<(), axum::Error> {
        send_frame(&mut self.sender, &self.codec, frame).await
    }

    /// Send a snapshot unless the client already has a newer one.
    async fn send_presence(&mut self, snapshot: &PresenceSnapshot) -> Result<(), axum::Error> {
        if self.last_presence.is_some_and(|v| snapshot.version <= v) {
            return Ok(());
        }
        self.last_presence = Some(snapshot.version);
        metrics::record_presence_sent();
        self.send(&presence_frame(snapshot)).await
    }

    async fn run(
        &mut self,
        mut receiver: WsReceiver,
        mut push_rx: mpsc::UnboundedReceiver<Push>,
        mut presence_rx: broadcast::Receiver<Arc<PresenceSnapshot>>,
    ) {
        let mut heartbeat = tokio::time::interval(self.state.config.heartbeat.interval());
        heartbeat.tick().await;
        let timeout = self.state.config.heartbeat.timeout();
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                biased;

                push = push_rx.recv() => {
                    let Some(push) = push else {
                        // Evicted by a newer connection, logged out or shut down.
                        debug!(connection = %self.connection, "Channel closed");
                        break;
                    };
                    if self.write_push(push).await.is_err() {
                        break;
                    }
                }

                snapshot = presence_rx.recv() => {
                    let snapshot = match snapshot {
                        Ok(snapshot) => snapshot,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(connection = %self.connection, skipped, "Presence receiver lagged");
                            Arc::new(self.state.core.presence().online_snapshot())
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    if self.send_presence(&snapshot).await.is_err() {
                        break;
                    }
                }

                msg = receiver.next() => {
                    last_seen = Instant::now();
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            metrics::record_frame(Direction::Inbound, data.len());
                            let result = match self.codec.decode_binary(&data) {
                                Ok(frames) => self.handle_frames(frames).await,
                                Err(e) => self.reject_malformed(&e.to_string()).await,
                            };
                            if result.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            metrics::record_frame(Direction::Inbound, text.len());
                            let result = match self.codec.decode_text(&text) {
                                Ok(frame) => self.handle_frame(frame).await,
                                Err(e) => self.reject_malformed(&e.to_string()).await,
                            };
                            if result.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if self.sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            debug!(connection = %self.connection, "Received close frame");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(connection = %self.connection, error = %e, "WebSocket error");
                            metrics::record_error("websocket");
                            break;
                        }
                        None => {
                            debug!(connection = %self.connection, "WebSocket stream ended");
                            break;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > timeout {
                        info!(user = %self.user, connection = %self.connection, "Heartbeat timeout");
                        metrics::record_error("heartbeat_timeout");
                        break;
                    }
                    if self.send(&Frame::ping_with_timestamp(now_millis())).await.is_err() {
                        break;
                    }
                }
            }
        }

        let _ = self.sender.close().await;
    }

    /// Write a core push to the socket. Messages are confirmed to the core
    /// only after the write succeeds, so a dead socket leaves them pending.
    async fn write_push(&mut self, push: Push) -> Result<(), axum::Error> {
        let message = match &push {
            Push::Message(m) => Some((m.sender.clone(), m.id)),
            _ => None,
        };
        self.send(&push_frame(push)).await?;

        if let Some((sender, id)) = message {
            if let Err(e) = self
                .state
                .core
                .confirm_delivered(&self.user, &sender, id)
                .await
            {
                warn!(user = %self.user, message_id = id, error = %e, "Failed to confirm delivery");
            }
        }
        Ok(())
    }

    async fn handle_frames(&mut self, frames: Vec<Frame>) -> Result<(), axum::Error> {
        for frame in frames {
            self.handle_frame(frame).await?;
        }
        Ok(())
    }

    async fn reject_malformed(&mut self, reason: &str) -> Result<(), axum::Error> {
        debug!(connection = %self.connection, reason, "Malformed frame");
        metrics::record_error("malformed");
        self.send(&Frame::error(0, codes::MALFORMED_FRAME, reason))
            .await
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), axum::Error> {
        let start = Instant::now();
        let core = Arc::clone(&self.state.core);
        let user = &self.user;

        let response = match frame {
            Frame::Send {
                id,
                recipient,
                text,
                image,
            } => {
                let recipient = UserId::new(recipient);
                match core.submit(user, &recipient, Payload { text, image }).await {
                    Ok(message) => {
                        metrics::record_submit("ws", Some(message.state));
                        Some(Frame::Sent {
                            id,
                            message: to_wire(&message),
                        })
                    }
                    Err(e) => {
                        debug!(user = %user, recipient = %recipient, error = %e, "Send rejected");
                        metrics::record_submit("ws", None);
                        Some(error_frame(id.unwrap_or(0), &e))
                    }
                }
            }

            Frame::Fetch { id } => Some(match core.fetch_pending(user).await {
                Ok(messages) => Frame::Pending {
                    id,
                    messages: to_wire_all(&messages),
                },
                Err(e) => error_frame(id, &e),
            }),

            Frame::Open { id, peer } => {
                let peer = UserId::new(peer);
                Some(match core.open_conversation(user, &peer).await {
                    Ok(conversation) => Frame::Conversation {
                        id,
                        peer: peer.to_string(),
                        unseen: conversation.unseen_before,
                        messages: to_wire_all(&conversation.messages),
                    },
                    Err(e) => error_frame(id, &e),
                })
            }

            Frame::Close { id, peer } => {
                core.close_conversation(user, &UserId::new(peer));
                Some(Frame::ack(id))
            }

            Frame::Ping { timestamp } => Some(Frame::pong(timestamp)),

            Frame::Pong { .. } => None,

            Frame::Connect { .. } => Some(Frame::error(0, codes::VALIDATION, "Already connected")),

            other => {
                warn!(
                    connection = %self.connection,
                    frame_type = other.frame_type().as_str(),
                    "Unexpected frame type"
                );
                Some(Frame::error(
                    other.request_id().unwrap_or(0),
                    codes::MALFORMED_FRAME,
                    "Unexpected frame type",
                ))
            }
        };

        metrics::record_frame_time(start.elapsed().as_secs_f64());

        match response {
            Some(frame) => self.send(&frame).await,
            None => Ok(()),
        }
    }
}
