use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use carelink_types::models::{Message, MessageKind, MessagePayload, MessageStatus};

/// How far apart a local entry's declared origin time may be from the
/// canonical message it is reconciled against. The local id never leaves the
/// client, so acknowledgements are matched by sender + payload + approximate
/// origin time.
pub(crate) const ACK_MATCH_WINDOW: Duration = Duration::seconds(5);

/// Client-local identifier for an optimistic entry. Never shared with the
/// server; replaced by the canonical id on reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId(pub(crate) u64);

/// An optimistic, not-yet-confirmed send. Status is `Sending` until the
/// acknowledgement arrives or the caller times it out to `Error`.
#[derive(Debug, Clone)]
pub struct LocalMessage {
    pub local_id: LocalId,
    pub recipient_id: Uuid,
    pub kind: MessageKind,
    pub payload: MessagePayload,
    pub origin_ts: DateTime<Utc>,
    pub status: MessageStatus,
}

impl LocalMessage {
    /// Whether the canonical `message` is this entry, come back to us via
    /// acknowledgement, push echo, or catch-up fetch. A local already in
    /// `Error` still matches: a late acknowledgement after a client-side
    /// timeout is the success path, not a duplicate.
    pub(crate) fn matches(&self, message: &Message) -> bool {
        self.recipient_id == message.recipient_id
            && self.payload == message.payload
            && (self.origin_ts - message.origin_ts).abs() <= ACK_MATCH_WINDOW
    }
}

/// One item of a conversation's visible list: either a confirmed message or
/// an optimistic local one.
#[derive(Debug, Clone)]
pub enum Entry {
    Local(LocalMessage),
    Canonical(Message),
}

impl Entry {
    pub fn origin_ts(&self) -> DateTime<Utc> {
        match self {
            Entry::Local(local) => local.origin_ts,
            Entry::Canonical(message) => message.origin_ts,
        }
    }

    pub fn canonical_id(&self) -> Option<i64> {
        match self {
            Entry::Local(_) => None,
            Entry::Canonical(message) => Some(message.id),
        }
    }

    pub fn status(&self) -> MessageStatus {
        match self {
            Entry::Local(local) => local.status,
            Entry::Canonical(message) => message.status,
        }
    }

    /// Total-order key: (origin_ts, canonical id). A local entry has no id
    /// yet; it sorts after confirmed messages with the same origin instant,
    /// which is where its eventual id would place it.
    fn order_key(&self) -> (DateTime<Utc>, i64) {
        match self {
            Entry::Local(local) => (local.origin_ts, i64::MAX),
            Entry::Canonical(message) => message.order_key(),
        }
    }
}

/// The outcome of absorbing a canonical message into a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Absorbed {
    /// The canonical id was already present; ignored.
    Duplicate,
    /// An optimistic entry was replaced in place.
    Reconciled,
    /// Inserted at the position dictated by (origin_ts, id).
    Inserted,
}

/// One conversation's ordered, de-duplicated message list.
#[derive(Debug, Default)]
pub struct ConversationFeed {
    entries: Vec<Entry>,
    /// Canonical ids already present, for O(1) echo suppression.
    seen: HashSet<i64>,
    /// Highest canonical id observed; the `since_id` for catch-up fetches.
    last_canonical: Option<i64>,
}

impl ConversationFeed {
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn last_canonical_id(&self) -> Option<i64> {
        self.last_canonical
    }

    /// Messages the local user has received but not yet read, derived from
    /// entry status so push- and fetch-merged state agree.
    pub fn unread_for(&self, user_id: Uuid) -> u32 {
        self.entries
            .iter()
            .filter(|entry| match entry {
                Entry::Canonical(m) => m.recipient_id == user_id && m.status != MessageStatus::Read,
                Entry::Local(_) => false,
            })
            .count() as u32
    }

    /// Optimistic insert, positioned by origin time.
    pub(crate) fn insert_local(&mut self, local: LocalMessage) {
        let key = (local.origin_ts, i64::MAX);
        let pos = self.position_for(key);
        self.entries.insert(pos, Entry::Local(local));
    }

    /// Absorb a canonical message: ignore duplicates, reconcile a matching
    /// optimistic entry in place (when `own` — the message came from this
    /// user), otherwise insert at the position its (origin_ts, id) dictates
    /// regardless of arrival order.
    pub(crate) fn absorb(&mut self, message: Message, own: bool) -> Absorbed {
        if self.seen.contains(&message.id) {
            return Absorbed::Duplicate;
        }

        if own {
            if let Some(pos) = self.entries.iter().position(|entry| {
                matches!(entry, Entry::Local(local) if local.matches(&message))
            }) {
                self.note_canonical(message.id);
                self.entries[pos] = Entry::Canonical(message);
                return Absorbed::Reconciled;
            }
        }

        let pos = self.position_for(message.order_key());
        self.note_canonical(message.id);
        self.entries.insert(pos, Entry::Canonical(message));
        Absorbed::Inserted
    }

    /// Forward-only status application on the local copy. Regressions and
    /// unknown ids are ignored.
    pub(crate) fn apply_status(&mut self, message_id: i64, status: MessageStatus) -> bool {
        for entry in &mut self.entries {
            if let Entry::Canonical(message) = entry {
                if message.id == message_id {
                    if message.status.can_advance_to(status) {
                        message.status = status;
                        return true;
                    }
                    return false;
                }
            }
        }
        false
    }

    /// Locally mark everything received as read (the user just rendered the
    /// conversation); the server-side receipt travels separately.
    pub(crate) fn mark_received_read(&mut self, user_id: Uuid) {
        for entry in &mut self.entries {
            if let Entry::Canonical(message) = entry {
                if message.recipient_id == user_id
                    && message.status.can_advance_to(MessageStatus::Read)
                {
                    message.status = MessageStatus::Read;
                }
            }
        }
    }

    pub(crate) fn fail_local(&mut self, local_id: LocalId) -> bool {
        self.update_local(local_id, MessageStatus::Error)
    }

    fn update_local(&mut self, local_id: LocalId, status: MessageStatus) -> bool {
        for entry in &mut self.entries {
            if let Entry::Local(local) = entry {
                if local.local_id == local_id {
                    local.status = status;
                    return true;
                }
            }
        }
        false
    }

    /// Mark the pending local that matches a rejected send as errored.
    pub(crate) fn reject_matching_local(
        &mut self,
        recipient_id: Uuid,
        origin_ts: DateTime<Utc>,
    ) -> bool {
        for entry in &mut self.entries {
            if let Entry::Local(local) = entry {
                if local.status == MessageStatus::Sending
                    && local.recipient_id == recipient_id
                    && (local.origin_ts - origin_ts).abs() <= ACK_MATCH_WINDOW
                {
                    local.status = MessageStatus::Error;
                    return true;
                }
            }
        }
        false
    }

    fn note_canonical(&mut self, id: i64) {
        self.seen.insert(id);
        if self.last_canonical.is_none_or(|last| id > last) {
            self.last_canonical = Some(id);
        }
    }

    /// Index the given order key belongs at: after every entry that sorts
    /// at or before it.
    fn position_for(&self, key: (DateTime<Utc>, i64)) -> usize {
        self.entries
            .iter()
            .rposition(|entry| entry.order_key() <= key)
            .map_or(0, |pos| pos + 1)
    }
}
