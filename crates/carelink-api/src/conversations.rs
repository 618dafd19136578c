use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;
use uuid::Uuid;

use carelink_store::StoreError;
use carelink_types::api::{Claims, MessagesQuery};

use crate::AppState;

pub(crate) fn store_error_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::ConversationNotFound(_) | StoreError::MessageNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        StoreError::InvalidPayload => StatusCode::BAD_REQUEST,
        StoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
        StoreError::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// The caller's conversations with peer identity, last-message preview, and
/// unread count, newest activity first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub;

    let summaries = tokio::task::spawn_blocking(move || db.list_conversations(user_id))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| store_error_status(&e))?;

    Ok(Json(summaries))
}

/// Conversation history in the canonical total order. `since` makes this the
/// catch-up fetch after a reconnect: only messages with a canonical id
/// beyond the client's last known one are returned.
pub async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();

    let conversation = tokio::task::spawn_blocking(move || db.conversation(conversation_id))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| store_error_status(&e))?
        .ok_or(StatusCode::NOT_FOUND)?;

    if !conversation.involves(claims.sub) {
        return Err(StatusCode::FORBIDDEN);
    }

    let db = state.db.clone();
    let since = query.since;
    let messages = tokio::task::spawn_blocking(move || db.list_messages(conversation_id, since))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| store_error_status(&e))?;

    Ok(Json(messages))
}

/// Bulk read receipt: the caller opened the conversation. Receipt fan-out to
/// the sender's live sessions happens inside the router.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    state
        .router
        .read_conversation(claims.sub, conversation_id)
        .await
        .map_err(|e| store_error_status(&e))?;

    Ok(StatusCode::NO_CONTENT)
}
