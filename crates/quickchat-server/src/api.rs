//! REST routes for QuickChat.
//!
//! Callers identify themselves with the `x-user-id` header; the
//! [`require_user`] middleware resolves it and stores the [`Caller`] as a
//! request extension.

use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Json, Router,
};
use quickchat_core::{ChatError, Contact, DirectoryError, NewUser, Payload, ProfileUpdate, User, UserId};
use quickchat_protocol::WireMessage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

use crate::handlers::AppState;
use crate::metrics;
use crate::wire::{to_wire, to_wire_all};

/// Header carrying the caller's user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct Caller(pub UserId);

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No or unknown `x-user-id`.
    #[error("Unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Chat(ChatError::Validation(_))
            | ApiError::Chat(ChatError::Directory(DirectoryError::InvalidDisplayName(_))) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Chat(ChatError::Directory(DirectoryError::UnknownUser(_))) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Chat(ChatError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Chat(ChatError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
            metrics::record_error("api");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Resolve `x-user-id` to a registered user.
pub async fn require_user(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(UserId::new)
        .ok_or(ApiError::Unauthorized)?;

    if !state.core.users().contains(&user) {
        debug!(user = %user, "Unknown caller");
        return Err(ApiError::Unauthorized);
    }

    req.extensions_mut().insert(Caller(user));
    Ok(next.run(req).await)
}

/// Build the REST routes.
pub fn routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let authenticated = Router::new()
        .route("/api/auth/check", get(check))
        .route("/api/auth/update-profile", put(update_profile))
        .route("/api/auth/logout", post(logout))
        .route("/api/messages/users", get(sidebar))
        .route("/api/messages/pending", get(pending))
        .route("/api/messages/send/:peer", post(send_message))
        .route("/api/messages/conversation/:peer", get(open_conversation))
        .route(
            "/api/messages/conversation/:peer/close",
            post(close_conversation),
        )
        .route_layer(middleware::from_fn_with_state(state, require_user));

    Router::new()
        .route("/api/auth/signup", post(signup))
        .route("/api/auth/login", post(login))
        .merge(authenticated)
}

pub async fn signup(
    State(state): State<Arc<AppState>>,
    Json(new_user): Json<NewUser>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let user = state.core.register_user(new_user)?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// Login request body.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub user_id: String,
}

/// Resolve a user id to its profile. The returned id is what clients send
/// in `x-user-id` and in the WebSocket `connect` frame.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<User>, ApiError> {
    let user = UserId::new(request.user_id.trim());
    match state.core.user(&user) {
        Some(profile) => {
            debug!(user = %user, "Logged in");
            Ok(Json(profile))
        }
        None => Err(ApiError::Unauthorized),
    }
}

pub async fn check(
    State(state): State<Arc<AppState>>,
    Extension(Caller(user)): Extension<Caller>,
) -> Result<Json<User>, ApiError> {
    state.core.user(&user).map(Json).ok_or(ApiError::Unauthorized)
}

pub async fn update_profile(
    State(state): State<Arc<AppState>>,
    Extension(Caller(user)): Extension<Caller>,
    Json(update): Json<ProfileUpdate>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(state.core.update_profile(&user, update)?))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(Caller(user)): Extension<Caller>,
) -> Json<serde_json::Value> {
    let disconnected = state.core.logout(&user);
    Json(serde_json::json!({
        "message": "Logged out successfully",
        "disconnected": disconnected,
    }))
}

pub async fn sidebar(
    State(state): State<Arc<AppState>>,
    Extension(Caller(user)): Extension<Caller>,
) -> Result<Json<Vec<Contact>>, ApiError> {
    Ok(Json(state.core.sidebar(&user)?))
}

pub async fn pending(
    State(state): State<Arc<AppState>>,
    Extension(Caller(user)): Extension<Caller>,
) -> Result<Json<Vec<WireMessage>>, ApiError> {
    let messages = state.core.fetch_pending(&user).await?;
    Ok(Json(to_wire_all(&messages)))
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Extension(Caller(user)): Extension<Caller>,
    Path(peer): Path<String>,
    Json(payload): Json<Payload>,
) -> Result<(StatusCode, Json<WireMessage>), ApiError> {
    match state.core.submit(&user, &UserId::new(peer), payload).await {
        Ok(message) => {
            metrics::record_submit("http", Some(message.state));
            Ok((StatusCode::CREATED, Json(to_wire(&message))))
        }
        Err(e) => {
            metrics::record_submit("http", None);
            Err(e.into())
        }
    }
}

/// An opened conversation.
#[derive(Debug, Serialize)]
pub struct ConversationBody {
    pub peer: String,
    pub unseen: u64,
    pub messages: Vec<WireMessage>,
}

pub async fn open_conversation(
    State(state): State<Arc<AppState>>,
    Extension(Caller(user)): Extension<Caller>,
    Path(peer): Path<String>,
) -> Result<Json<ConversationBody>, ApiError> {
    let conversation = state
        .core
        .open_conversation(&user, &UserId::new(peer))
        .await?;

    Ok(Json(ConversationBody {
        peer: conversation.peer.to_string(),
        unseen: conversation.unseen_before,
        messages: to_wire_all(&conversation.messages),
    }))
}

pub async fn close_conversation(
    State(state): State<Arc<AppState>>,
    Extension(Caller(user)): Extension<Caller>,
    Path(peer): Path<String>,
) -> Json<serde_json::Value> {
    let closed = state.core.close_conversation(&user, &UserId::new(peer));
    Json(serde_json::json!({ "closed": closed }))
}
