use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a participant in the care portal, as reported by the external
/// participant directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Mother,
    Doctor,
    Midwife,
    ServiceProvider,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mother => "mother",
            Self::Doctor => "doctor",
            Self::Midwife => "midwife",
            Self::ServiceProvider => "service_provider",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mother" => Some(Self::Mother),
            "doctor" => Some(Self::Doctor),
            "midwife" => Some(Self::Midwife),
            "service_provider" => Some(Self::ServiceProvider),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub display_name: String,
    pub role: Role,
}

/// The single persistent thread between exactly two participants.
/// Created lazily on the first message attempt between a pair; never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    /// Unordered pair, stored sorted so the pair is unique per conversation.
    pub participants: [Uuid; 2],
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Conversation {
    /// The other participant, from `me`'s point of view.
    pub fn peer_of(&self, me: Uuid) -> Option<Uuid> {
        match self.participants {
            [a, b] if a == me => Some(b),
            [a, b] if b == me => Some(a),
            _ => None,
        }
    }

    pub fn involves(&self, user_id: Uuid) -> bool {
        self.participants.contains(&user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// Message content: inline text, or a reference to previously uploaded
/// binary content (the upload itself happens outside the messaging core).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Text { text: String },
    Attachment { url: String, name: String },
}

impl MessagePayload {
    /// Whether this payload shape is valid for the given kind.
    /// Text messages carry inline text; image and file messages carry a
    /// reference to uploaded content.
    pub fn matches_kind(&self, kind: MessageKind) -> bool {
        match (kind, self) {
            (MessageKind::Text, MessagePayload::Text { .. }) => true,
            (MessageKind::Image | MessageKind::File, MessagePayload::Attachment { .. }) => true,
            _ => false,
        }
    }
}

/// Delivery state of a message.
///
/// `Sending` and `Error` exist only in client-local optimistic state and are
/// never persisted. Persisted statuses advance forward only:
/// Sent -> Delivered -> Read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Error,
}

impl MessageStatus {
    pub fn is_persisted(self) -> bool {
        matches!(self, Self::Sent | Self::Delivered | Self::Read)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Sending | Self::Error => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
        }
    }

    /// True if moving from `self` to `next` is a forward transition between
    /// persisted states.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        next.is_persisted() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A server-accepted message.
///
/// `id` is the canonical identifier: unique, assigned by the store at
/// acceptance, monotonically orderable. `origin_ts` is the instant the sender
/// created the message and is the ordering key; `accepted_at` is when the
/// store durably accepted it. All observers order messages by
/// (origin_ts, id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub kind: MessageKind,
    pub payload: MessagePayload,
    pub origin_ts: DateTime<Utc>,
    pub accepted_at: DateTime<Utc>,
    pub status: MessageStatus,
}

impl Message {
    /// The total-order key shared by the store and the client engine.
    pub fn order_key(&self) -> (DateTime<Utc>, i64) {
        (self.origin_ts, self.id)
    }
}

/// Per-caller conversation listing entry: the peer, the newest message, and
/// how many received messages the caller has not read yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub peer: Participant,
    pub last_message: Option<Message>,
    pub unread: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_advances_forward_only() {
        assert!(MessageStatus::Sent.can_advance_to(MessageStatus::Delivered));
        assert!(MessageStatus::Sent.can_advance_to(MessageStatus::Read));
        assert!(MessageStatus::Delivered.can_advance_to(MessageStatus::Read));

        assert!(!MessageStatus::Read.can_advance_to(MessageStatus::Sent));
        assert!(!MessageStatus::Read.can_advance_to(MessageStatus::Delivered));
        assert!(!MessageStatus::Sent.can_advance_to(MessageStatus::Sent));
        // Client-local states are never valid persistence targets.
        assert!(!MessageStatus::Sent.can_advance_to(MessageStatus::Error));
        assert!(!MessageStatus::Sent.can_advance_to(MessageStatus::Sending));
    }

    #[test]
    fn payload_kind_agreement() {
        let text = MessagePayload::Text { text: "hello".into() };
        let file = MessagePayload::Attachment {
            url: "/uploads/scan.pdf".into(),
            name: "scan.pdf".into(),
        };

        assert!(text.matches_kind(MessageKind::Text));
        assert!(!text.matches_kind(MessageKind::File));
        assert!(file.matches_kind(MessageKind::File));
        assert!(file.matches_kind(MessageKind::Image));
        assert!(!file.matches_kind(MessageKind::Text));
    }

    #[test]
    fn conversation_peer_lookup() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let convo = Conversation {
            id: Uuid::new_v4(),
            participants: [a, b],
            created_at: Utc::now(),
            last_activity: Utc::now(),
        };

        assert_eq!(convo.peer_of(a), Some(b));
        assert_eq!(convo.peer_of(b), Some(a));
        assert_eq!(convo.peer_of(Uuid::new_v4()), None);
    }
}
