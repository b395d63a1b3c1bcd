//! HTTP API for Courier.
//!
//! Read-side companions to the WebSocket surface: history fetches, the inbox
//! view, and the mark-read commit. All endpoints are JSON over plain HTTP and
//! identify the caller by query or body parameter, matching the identity
//! model of `register_user`.

use crate::handlers::AppState;
use crate::metrics;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use courier_core::{ChatError, ConversationSummary, RoomKey};
use courier_protocol::Message;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Build the HTTP API router.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/conversations", get(list_conversations))
        .route("/api/messages/mark-read", post(mark_read))
        .route("/api/messages/:other_user_id", get(get_messages))
}

/// Query identifying the calling user.
#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: String,
}

/// Query identifying the calling user on history fetches.
#[derive(Debug, Deserialize)]
struct CurrentUserQuery {
    current_user_id: String,
}

/// Request body for the mark-read commit.
#[derive(Debug, Serialize, Deserialize)]
struct MarkReadRequest {
    current_user_id: String,
    other_user_id: String,
}

/// Response body for the mark-read commit.
#[derive(Debug, Serialize, Deserialize)]
struct MarkReadResponse {
    /// Messages flipped from unread to read by this call.
    updated: usize,
}

/// `GET /api/conversations?user_id=` - the caller's inbox, most recent first.
async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    if query.user_id.is_empty() {
        return Err(ChatError::Validation("user id cannot be empty").into());
    }
    let summaries = state.conversations.list(&query.user_id).await?;
    Ok(Json(summaries))
}

/// `GET /api/messages/:other_user_id?current_user_id=` - full history with
/// one counterpart, in persisted order.
async fn get_messages(
    State(state): State<Arc<AppState>>,
    Path(other_user_id): Path<String>,
    Query(query): Query<CurrentUserQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    // Same pair rules as the realtime surface: no self-chat, no empty ids.
    RoomKey::new(&query.current_user_id, &other_user_id)?;

    let messages = state
        .store
        .conversation(&query.current_user_id, &other_user_id)
        .await
        .map_err(ChatError::from)?;
    Ok(Json(messages))
}

/// `POST /api/messages/mark-read` - mark everything the counterpart sent the
/// caller as read.
async fn mark_read(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MarkReadRequest>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let updated = state
        .read_state
        .mark_read(&request.current_user_id, &request.other_user_id)
        .await?;
    metrics::record_read_marked(updated);
    Ok(Json(MarkReadResponse { updated }))
}

/// HTTP projection of a [`ChatError`].
#[derive(Debug)]
struct ApiError(ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Limit(_) => StatusCode::TOO_MANY_REQUESTS,
            ChatError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            warn!(error = %self.0, "API request failed");
            metrics::record_error("api");
        }

        let body = Json(serde_json::json!({
            "code": self.0.code(),
            "error": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
