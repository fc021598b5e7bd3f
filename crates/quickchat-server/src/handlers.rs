//! HTTP server setup for QuickChat.
//!
//! Builds the axum application (WebSocket gateway, health check and REST
//! routes) and runs it until shutdown.

use crate::config::Config;
use crate::{api, gateway, metrics};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use quickchat_core::ChatCore;
use quickchat_protocol::PROTOCOL_VERSION;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The chat core.
    pub core: Arc<ChatCore>,
    /// Server configuration.
    pub config: Config,
    active_connections: AtomicUsize,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(core: Arc<ChatCore>, config: Config) -> Self {
        Self {
            core,
            config,
            active_connections: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// A reserved WebSocket connection slot, released on drop.
struct ConnectionSlot(Arc<AppState>);

impl ConnectionSlot {
    fn acquire(state: &Arc<AppState>) -> Option<Self> {
        let max = state.config.limits.max_connections;
        state
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| Self(Arc::clone(state)))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the axum application.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .merge(api::routes(Arc::clone(&state)))
        .with_state(state)
}

/// Serve `state` on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_app(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let core = Arc::new(ChatCore::new(config.chat.clone()));
    let state = Arc::new(AppState::new(Arc::clone(&core), config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("QuickChat server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, state, shutdown_signal(core)).await
}

/// Resolve on Ctrl-C, closing every chat channel first.
async fn shutdown_signal(core: Arc<ChatCore>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
    core.shutdown();
}

/// Liveness check.
async fn root_handler() -> &'static str {
    "Server is running"
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": if state.core.is_shutting_down() { "shutting_down" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "connections": state.active_connections(),
        "online": state.core.presence().count(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if state.core.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down").into_response();
    }

    let Some(slot) = ConnectionSlot::acquire(&state) else {
        warn!(
            max = state.config.limits.max_connections,
            "Connection limit reached"
        );
        metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| async move {
            let _slot = slot;
            gateway::handle_socket(socket, state).await;
        })
        .into_response()
}
