use axum::{
    Extension, Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;

use carelink_types::api::{Claims, ParticipantQuery};

use crate::AppState;
use crate::conversations::store_error_status;

const SEARCH_LIMIT: u32 = 20;

/// Contact search for starting a new conversation: name substring match,
/// optionally narrowed to a role, never returning the caller themselves.
pub async fn search(
    State(state): State<AppState>,
    Query(query): Query<ParticipantQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let caller = claims.sub;

    let participants = tokio::task::spawn_blocking(move || {
        db.search_participants(&query.query, query.role, caller, SEARCH_LIMIT)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|e| store_error_status(&e))?;

    Ok(Json(participants))
}
