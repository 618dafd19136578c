use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, MessageKind, MessagePayload, MessageStatus};

/// Commands sent FROM client TO server over the gateway connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    /// Authenticate the connection. Must be the first frame; the server
    /// closes the connection if it does not arrive promptly or the
    /// credential is invalid.
    Identify { token: String },

    /// Subscribe this session to a conversation's event stream. Idempotent.
    JoinConversation { conversation_id: Uuid },

    /// Send a message to a recipient. The conversation is resolved (or
    /// created) server-side from the sender/recipient pair. `origin_ts` is
    /// the instant the sender created the message and becomes the ordering
    /// key of the accepted message.
    SendMessage {
        recipient_id: Uuid,
        kind: MessageKind,
        payload: MessagePayload,
        origin_ts: DateTime<Utc>,
    },

    /// Ephemeral typing state. Relayed to the other participant, never
    /// persisted.
    TypingStart { conversation_id: Uuid },
    TypingStop { conversation_id: Uuid },

    /// Receipt: this session received the pushed message.
    MarkDelivered { message_id: i64 },

    /// Receipt: the message was rendered in an active, focused conversation
    /// view.
    MarkRead { message_id: i64 },
}

/// Events sent FROM server TO client over the gateway connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Authentication succeeded; the connection is live.
    Ready { user_id: Uuid, name: String },

    /// The sender's own send was durably accepted. Carries the canonical
    /// message (status `sent`) for the client to reconcile against its
    /// optimistic entry.
    MessageAccepted { message: Message },

    /// The sender's send failed. Echoes the identifying fields of the
    /// attempted send so the client can mark the matching optimistic entry
    /// as errored. Reported to the sender only.
    SendRejected {
        recipient_id: Uuid,
        origin_ts: DateTime<Utc>,
        reason: SendRejectReason,
    },

    /// A message was persisted for this conversation.
    NewMessage {
        conversation_id: Uuid,
        message: Message,
    },

    /// Ephemeral typing state changed.
    TypingIndicator {
        conversation_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    },

    /// A forward status transition occurred.
    MessageStatusUpdate {
        conversation_id: Uuid,
        message_id: i64,
        status: MessageStatus,
    },

    /// Join acknowledged.
    ConversationJoined { conversation_id: Uuid },
}

/// Why a send was rejected. `StoreUnavailable` means the message was not
/// retained at all; the client shows `error` with a retry affordance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendRejectReason {
    StoreUnavailable,
    UnknownRecipient,
    InvalidPayload,
}

impl ServerEvent {
    /// The conversation this event is scoped to, if any. `Ready` and the
    /// sender-directed ack/reject events are session-global.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::NewMessage { conversation_id, .. }
            | Self::TypingIndicator { conversation_id, .. }
            | Self::MessageStatusUpdate { conversation_id, .. }
            | Self::ConversationJoined { conversation_id } => Some(*conversation_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_round_trip_as_tagged_json() {
        let cmd = ClientCommand::SendMessage {
            recipient_id: Uuid::new_v4(),
            kind: MessageKind::Text,
            payload: MessagePayload::Text { text: "hi".into() },
            origin_ts: Utc::now(),
        };

        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"type\":\"SendMessage\""));
        let back: ClientCommand = serde_json::from_str(&json).unwrap();
        match back {
            ClientCommand::SendMessage { payload, .. } => {
                assert_eq!(payload, MessagePayload::Text { text: "hi".into() });
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn event_conversation_scoping() {
        let conversation_id = Uuid::new_v4();
        let scoped = ServerEvent::ConversationJoined { conversation_id };
        assert_eq!(scoped.conversation_id(), Some(conversation_id));

        let global = ServerEvent::Ready {
            user_id: Uuid::new_v4(),
            name: "Dr. Perera".into(),
        };
        assert_eq!(global.conversation_id(), None);
    }
}
