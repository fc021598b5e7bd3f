//! Prometheus metrics for QuickChat.
//!
//! Everything goes through the `metrics` facade; until [`init_metrics`] and
//! [`start_metrics_server`] run, recording is a no-op.

use anyhow::Result;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use quickchat_core::DeliveryState;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "quickchat_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "quickchat_sessions_active";
    pub const USERS_ONLINE: &str = "quickchat_users_online";
    pub const FRAMES_TOTAL: &str = "quickchat_frames_total";
    pub const FRAME_BYTES: &str = "quickchat_frame_bytes_total";
    pub const MESSAGES_TOTAL: &str = "quickchat_messages_total";
    pub const PRESENCE_SENT_TOTAL: &str = "quickchat_presence_sent_total";
    pub const FRAME_SECONDS: &str = "quickchat_frame_seconds";
    pub const ERRORS_TOTAL: &str = "quickchat_errors_total";
}

const DESCRIPTIONS: &[(&str, &str)] = &[
    (names::SESSIONS_TOTAL, "Chat sessions accepted since start"),
    (names::SESSIONS_ACTIVE, "Open WebSocket chat sessions"),
    (names::USERS_ONLINE, "Users in the presence set"),
    (names::FRAMES_TOTAL, "WebSocket frames, by direction"),
    (names::FRAME_BYTES, "WebSocket frame bytes, by direction"),
    (names::MESSAGES_TOTAL, "Submitted chat messages, by transport and outcome"),
    (names::PRESENCE_SENT_TOTAL, "Presence snapshots written to sessions"),
    (names::FRAME_SECONDS, "Time spent handling one inbound frame"),
    (names::ERRORS_TOTAL, "Errors, by kind"),
];

/// Frame direction relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Register metric descriptions.
pub fn init_metrics() {
    for &(name, help) in DESCRIPTIONS {
        match name {
            names::SESSIONS_ACTIVE | names::USERS_ONLINE => metrics::describe_gauge!(name, help),
            names::FRAME_SECONDS => metrics::describe_histogram!(name, help),
            _ => metrics::describe_counter!(name, help),
        }
    }
    info!("Metrics initialized");
}

/// Serve `/metrics` on `port`.
///
/// # Errors
///
/// Returns an error if the exporter cannot bind.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

pub fn set_users_online(count: usize) {
    gauge!(names::USERS_ONLINE).set(count as f64);
}

pub fn record_frame(direction: Direction, bytes: usize) {
    let label = direction.label();
    counter!(names::FRAMES_TOTAL, "direction" => label).increment(1);
    counter!(names::FRAME_BYTES, "direction" => label).increment(bytes as u64);
}

/// Record a submit over `transport` (`ws` or `http`).
///
/// `None` means the submit was rejected.
pub fn record_submit(transport: &'static str, state: Option<DeliveryState>) {
    let outcome = state.map_or("rejected", |s| s.as_str());
    counter!(names::MESSAGES_TOTAL, "transport" => transport, "outcome" => outcome).increment(1);
}

pub fn record_presence_sent() {
    counter!(names::PRESENCE_SENT_TOTAL).increment(1);
}

pub fn record_frame_time(seconds: f64) {
    histogram!(names::FRAME_SECONDS).record(seconds);
}

pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Counts a session as active for as long as it lives.
pub struct SessionGauge;

impl SessionGauge {
    #[must_use]
    pub fn open() -> Self {
        counter!(names::SESSIONS_TOTAL).increment(1);
        gauge!(names::SESSIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Drop for SessionGauge {
    fn drop(&mut self) {
        gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
    }
}
