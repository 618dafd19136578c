use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageKind, MessagePayload, Role};

// -- JWT Claims --

/// Claims carried by the externally issued bearer token. Canonical definition
/// lives here so the REST middleware and the gateway handshake validate the
/// same shape. Token issuance happens outside the messaging core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub name: String,
    pub role: Role,
    pub exp: usize,
}

// -- Messages --

/// Request body of the fallback send path (`POST /messages`), used when the
/// caller has no live gateway connection. Mirrors `ClientCommand::SendMessage`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub recipient_id: Uuid,
    pub kind: MessageKind,
    pub payload: MessagePayload,
    pub origin_ts: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    /// Incremental fetch: return only messages with a canonical id greater
    /// than this.
    pub since: Option<i64>,
}

// -- Participants --

#[derive(Debug, Deserialize)]
pub struct ParticipantQuery {
    #[serde(default)]
    pub query: String,
    pub role: Option<Role>,
}
