use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use carelink_types::events::ServerEvent;
use carelink_types::models::{Message, MessageKind, MessagePayload, MessageStatus};

use crate::feed::{ACK_MATCH_WINDOW, Absorbed, ConversationFeed, LocalId, LocalMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Things the UI must react to that are not plain feed mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// A pushed message arrived for a conversation this client had never
    /// seen — typically the first message from a new contact. The UI should
    /// open or list it and fetch its history; the message itself is already
    /// in the feed, never discarded.
    ConversationDiscovered { conversation_id: Uuid },
}

/// What to do after regaining a live connection: re-join every open
/// conversation and catch up from the last known canonical id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpPlan {
    pub joins: Vec<Uuid>,
    pub fetches: Vec<(Uuid, Option<i64>)>,
}

/// Per-user reconciliation state: one feed per conversation, the outbox of
/// first-contact sends whose conversation id is not yet known, typing and
/// connection state.
pub struct ReconcileEngine {
    user_id: Uuid,
    feeds: HashMap<Uuid, ConversationFeed>,
    outbox: Vec<LocalMessage>,
    active: Option<Uuid>,
    connection: ConnectionStatus,
    /// conversation -> users currently typing in it (never the local user).
    typing: HashMap<Uuid, HashSet<Uuid>>,
    next_local: u64,
}

impl ReconcileEngine {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            feeds: HashMap::new(),
            outbox: Vec::new(),
            active: None,
            connection: ConnectionStatus::Disconnected,
            typing: HashMap::new(),
            next_local: 0,
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.connection
    }

    /// Connection-layer hook. Losing the connection invalidates every typing
    /// indicator: disconnect is one of the two clearing signals.
    pub fn set_connection(&mut self, status: ConnectionStatus) {
        if status == ConnectionStatus::Disconnected {
            self.typing.clear();
        }
        self.connection = status;
    }

    pub fn active_conversation(&self) -> Option<Uuid> {
        self.active
    }

    /// Make a conversation the one on screen.
    pub fn open_conversation(&mut self, conversation_id: Uuid) {
        self.feeds.entry(conversation_id).or_default();
        self.active = Some(conversation_id);
    }

    pub fn feed(&self, conversation_id: Uuid) -> Option<&ConversationFeed> {
        self.feeds.get(&conversation_id)
    }

    pub fn unread(&self, conversation_id: Uuid) -> u32 {
        self.feeds
            .get(&conversation_id)
            .map_or(0, |feed| feed.unread_for(self.user_id))
    }

    pub fn total_unread(&self) -> u32 {
        self.feeds
            .values()
            .map(|feed| feed.unread_for(self.user_id))
            .sum()
    }

    /// First-contact sends whose conversation the server has not yet named.
    pub fn pending_sends(&self) -> &[LocalMessage] {
        &self.outbox
    }

    /// Optimistic send: the message appears immediately, status `sending`,
    /// positioned by its origin time. When the conversation is not yet known
    /// (first contact) the entry is parked in the outbox until the
    /// acknowledgement reveals the conversation id.
    pub fn begin_send(
        &mut self,
        conversation_id: Option<Uuid>,
        recipient_id: Uuid,
        kind: MessageKind,
        payload: MessagePayload,
        origin_ts: DateTime<Utc>,
    ) -> LocalId {
        let local_id = LocalId(self.next_local);
        self.next_local += 1;

        let local = LocalMessage {
            local_id,
            recipient_id,
            kind,
            payload,
            origin_ts,
            status: MessageStatus::Sending,
        };

        match conversation_id {
            Some(id) => self.feeds.entry(id).or_default().insert_local(local),
            None => self.outbox.push(local),
        }

        local_id
    }

    /// Client-side send timeout: `sending -> error`. The entry stays visible
    /// with a retry affordance; it never silently disappears. A late
    /// acknowledgement arriving afterwards still reconciles it as success.
    pub fn fail_send(&mut self, local_id: LocalId) -> bool {
        if let Some(local) = self.outbox.iter_mut().find(|l| l.local_id == local_id) {
            local.status = MessageStatus::Error;
            return true;
        }
        self.feeds.values_mut().any(|feed| feed.fail_local(local_id))
    }

    /// Locally mark everything received in a conversation as read. The
    /// server-side receipt (MarkRead / the bulk read call) travels
    /// separately through the connection layer.
    pub fn mark_conversation_read(&mut self, conversation_id: Uuid) {
        if let Some(feed) = self.feeds.get_mut(&conversation_id) {
            feed.mark_received_read(self.user_id);
        }
    }

    /// Whether someone else is typing in the conversation on screen.
    pub fn is_peer_typing(&self) -> bool {
        self.active
            .and_then(|id| self.typing.get(&id))
            .is_some_and(|users| !users.is_empty())
    }

    /// Feed one server event through the state machine.
    pub fn apply_event(&mut self, event: ServerEvent) -> Vec<Effect> {
        match event {
            ServerEvent::Ready { .. } => {
                self.connection = ConnectionStatus::Connected;
                Vec::new()
            }

            ServerEvent::MessageAccepted { message } => {
                self.absorb_canonical(message.conversation_id, message)
            }

            ServerEvent::NewMessage {
                conversation_id,
                message,
            } => self.absorb_canonical(conversation_id, message),

            ServerEvent::SendRejected {
                recipient_id,
                origin_ts,
                ..
            } => {
                self.reject_send(recipient_id, origin_ts);
                Vec::new()
            }

            ServerEvent::TypingIndicator {
                conversation_id,
                user_id,
                is_typing,
            } => {
                if user_id != self.user_id {
                    if is_typing {
                        self.typing.entry(conversation_id).or_default().insert(user_id);
                    } else if let Some(users) = self.typing.get_mut(&conversation_id) {
                        users.remove(&user_id);
                        if users.is_empty() {
                            self.typing.remove(&conversation_id);
                        }
                    }
                }
                Vec::new()
            }

            ServerEvent::MessageStatusUpdate {
                conversation_id,
                message_id,
                status,
            } => {
                if let Some(feed) = self.feeds.get_mut(&conversation_id) {
                    feed.apply_status(message_id, status);
                }
                Vec::new()
            }

            // Join bookkeeping lives in the connection layer.
            ServerEvent::ConversationJoined { .. } => Vec::new(),
        }
    }

    /// Catch-up after a reconnect: re-join everything we had open and fetch
    /// each conversation's tail past the last canonical id we saw. Merged
    /// history goes through the same de-duplication as pushed events.
    pub fn catch_up_plan(&self) -> CatchUpPlan {
        let mut joins: Vec<Uuid> = self.feeds.keys().copied().collect();
        joins.sort();
        let fetches = joins
            .iter()
            .map(|id| (*id, self.feeds[id].last_canonical_id()))
            .collect();
        CatchUpPlan { joins, fetches }
    }

    /// Merge a history fetch into the feed. Messages already present are
    /// ignored; our own messages reconcile any still-pending optimistic
    /// entries (an acknowledgement lost to a disconnect comes back this way).
    pub fn merge_history(&mut self, conversation_id: Uuid, messages: Vec<Message>) -> Vec<Effect> {
        let mut effects = Vec::new();
        for message in messages {
            effects.extend(self.absorb_canonical(conversation_id, message));
        }
        effects
    }

    fn absorb_canonical(&mut self, conversation_id: Uuid, message: Message) -> Vec<Effect> {
        let own = message.sender_id == self.user_id;
        let discovered = !self.feeds.contains_key(&conversation_id);

        // A first-contact send parked in the outbox is now confirmed; the
        // canonical message takes its place in the (possibly new) feed.
        if own {
            if let Some(pos) = self.outbox.iter().position(|local| local.matches(&message)) {
                self.outbox.remove(pos);
            }
        }

        let feed = self.feeds.entry(conversation_id).or_default();
        if feed.absorb(message, own) == Absorbed::Duplicate {
            return Vec::new();
        }

        if discovered {
            vec![Effect::ConversationDiscovered { conversation_id }]
        } else {
            Vec::new()
        }
    }

    fn reject_send(&mut self, recipient_id: Uuid, origin_ts: DateTime<Utc>) {
        let matched = self.outbox.iter_mut().any(|local| {
            if local.status == MessageStatus::Sending
                && local.recipient_id == recipient_id
                && (local.origin_ts - origin_ts).abs() <= ACK_MATCH_WINDOW
            {
                local.status = MessageStatus::Error;
                true
            } else {
                false
            }
        });
        if matched {
            return;
        }

        for feed in self.feeds.values_mut() {
            if feed.reject_matching_local(recipient_id, origin_ts) {
                return;
            }
        }
    }
}
