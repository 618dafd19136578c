use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::warn;

use carelink_gateway::router::SendError;
use carelink_types::api::{Claims, SendMessageRequest};

use crate::AppState;
use crate::conversations::store_error_status;

/// Fallback send path for callers without a live gateway connection. Runs
/// the same router pipeline as a WebSocket send: the conversation is resolved
/// or created, the store assigns the canonical id, and any live sessions of
/// both parties are notified. The HTTP response carries the canonical
/// message in place of the gateway acknowledgement.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let recipient_id = req.recipient_id;
    let message = state
        .router
        .send_message(
            claims.sub,
            None,
            recipient_id,
            req.kind,
            req.payload,
            req.origin_ts,
        )
        .await
        .map_err(|e| {
            warn!("{} send to {} failed: {}", claims.sub, recipient_id, e);
            match &e {
                SendError::UnknownRecipient(_) => StatusCode::NOT_FOUND,
                SendError::Store(store_err) => store_error_status(store_err),
            }
        })?;

    Ok((StatusCode::CREATED, Json(message)))
}
