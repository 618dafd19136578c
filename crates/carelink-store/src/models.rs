//! Database row types — these map directly to SQLite rows.
//! Distinct from the carelink-types domain models to keep the DB layer
//! independent; conversion into domain types happens here so corrupt rows
//! surface as store errors instead of panics.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use carelink_types::models::{
    Conversation, Message, MessageKind, MessagePayload, MessageStatus, Participant, Role,
};

use crate::StoreError;

pub struct ParticipantRow {
    pub id: String,
    pub display_name: String,
    pub role: String,
}

pub struct ConversationRow {
    pub id: String,
    pub participant_lo: String,
    pub participant_hi: String,
    pub created_at: i64,
    pub last_activity: i64,
}

pub struct MessageRow {
    pub id: i64,
    pub conversation_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub kind: String,
    pub body: Option<String>,
    pub attachment_url: Option<String>,
    pub attachment_name: Option<String>,
    pub origin_ts: i64,
    pub accepted_at: i64,
    pub status: String,
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(format!("corrupt {what} row: {detail}"))
}

pub(crate) fn parse_uuid(field: &str, raw: &str) -> Result<Uuid, StoreError> {
    raw.parse()
        .map_err(|e| corrupt(field, format_args!("{raw}: {e}")))
}

pub(crate) fn ts_from_micros(field: &str, micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| corrupt(field, micros))
}

impl TryFrom<ParticipantRow> for Participant {
    type Error = StoreError;

    fn try_from(row: ParticipantRow) -> Result<Self, StoreError> {
        Ok(Participant {
            id: parse_uuid("participant.id", &row.id)?,
            role: Role::parse(&row.role).ok_or_else(|| corrupt("participant.role", &row.role))?,
            display_name: row.display_name,
        })
    }
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = StoreError;

    fn try_from(row: ConversationRow) -> Result<Self, StoreError> {
        Ok(Conversation {
            id: parse_uuid("conversation.id", &row.id)?,
            participants: [
                parse_uuid("conversation.participant_lo", &row.participant_lo)?,
                parse_uuid("conversation.participant_hi", &row.participant_hi)?,
            ],
            created_at: ts_from_micros("conversation.created_at", row.created_at)?,
            last_activity: ts_from_micros("conversation.last_activity", row.last_activity)?,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, StoreError> {
        let kind =
            MessageKind::parse(&row.kind).ok_or_else(|| corrupt("message.kind", &row.kind))?;

        let payload = match (kind, row.body, row.attachment_url, row.attachment_name) {
            (MessageKind::Text, Some(text), _, _) => MessagePayload::Text { text },
            (MessageKind::Image | MessageKind::File, _, Some(url), Some(name)) => {
                MessagePayload::Attachment { url, name }
            }
            _ => return Err(corrupt("message.payload", row.id)),
        };

        Ok(Message {
            id: row.id,
            conversation_id: parse_uuid("message.conversation_id", &row.conversation_id)?,
            sender_id: parse_uuid("message.sender_id", &row.sender_id)?,
            recipient_id: parse_uuid("message.recipient_id", &row.recipient_id)?,
            kind,
            payload,
            origin_ts: ts_from_micros("message.origin_ts", row.origin_ts)?,
            accepted_at: ts_from_micros("message.accepted_at", row.accepted_at)?,
            status: MessageStatus::parse(&row.status)
                .ok_or_else(|| corrupt("message.status", &row.status))?,
        })
    }
}
