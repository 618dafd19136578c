use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::warn;
use uuid::Uuid;

use carelink_types::models::{
    Conversation, ConversationSummary, Message, MessageKind, MessagePayload, MessageStatus,
    Participant,
};

use crate::models::{ConversationRow, MessageRow, ParticipantRow};
use crate::{Database, Result, StoreError};

const MESSAGE_COLS: &str = "id, conversation_id, sender_id, recipient_id, kind, \
     body, attachment_url, attachment_name, origin_ts, accepted_at, status";

impl Database {
    // -- Participants --

    /// Refresh the local projection of the external participant directory.
    pub fn upsert_participant(&self, participant: &Participant) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO participants (id, display_name, role) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET display_name = ?2, role = ?3",
                rusqlite::params![
                    participant.id.to_string(),
                    participant.display_name,
                    participant.role.as_str()
                ],
            )?;
            Ok(())
        })
    }

    pub fn participant(&self, id: Uuid) -> Result<Option<Participant>> {
        self.with_conn(|conn| query_participant(conn, id))
    }

    /// Name search for the initial-contact flow. Case-insensitive substring
    /// match, optionally narrowed to one role, never returning the caller.
    pub fn search_participants(
        &self,
        query: &str,
        role: Option<carelink_types::models::Role>,
        exclude: Uuid,
        limit: u32,
    ) -> Result<Vec<Participant>> {
        self.with_conn(|conn| {
            let pattern = format!("%{}%", query);
            let mut stmt = conn.prepare(
                "SELECT id, display_name, role FROM participants
                 WHERE display_name LIKE ?1 AND id != ?2 AND (?3 IS NULL OR role = ?3)
                 ORDER BY display_name
                 LIMIT ?4",
            )?;

            let rows = stmt
                .query_map(
                    rusqlite::params![pattern, exclude.to_string(), role.map(|r| r.as_str()), limit],
                    participant_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(Participant::try_from).collect()
        })
    }

    // -- Conversations --

    /// Find the single conversation between a pair, creating it if this is
    /// their first contact. Idempotent: the pair is stored sorted and a
    /// UNIQUE constraint guarantees concurrent callers converge on one row.
    pub fn find_or_create_conversation(&self, a: Uuid, b: Uuid) -> Result<Conversation> {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let now = Utc::now().timestamp_micros();

        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO conversations
                     (id, participant_lo, participant_hi, created_at, last_activity)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    lo.to_string(),
                    hi.to_string(),
                    now
                ],
            )?;

            let row = conn.query_row(
                "SELECT id, participant_lo, participant_hi, created_at, last_activity
                 FROM conversations WHERE participant_lo = ?1 AND participant_hi = ?2",
                rusqlite::params![lo.to_string(), hi.to_string()],
                conversation_row,
            )?;

            Conversation::try_from(row)
        })
    }

    pub fn conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, participant_lo, participant_hi, created_at, last_activity
                     FROM conversations WHERE id = ?1",
                    [id.to_string()],
                    conversation_row,
                )
                .optional()?;

            row.map(Conversation::try_from).transpose()
        })
    }

    /// Per-caller listing with peer identity, last-message preview, and
    /// unread count, newest activity first.
    pub fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>> {
        self.with_conn(|conn| {
            let uid = user_id.to_string();

            // JOIN participants to resolve the peer in one pass; a
            // conversation whose peer is missing from the directory
            // projection cannot be rendered and is skipped with a warning.
            let mut stmt = conn.prepare(
                "SELECT c.id, c.participant_lo, c.participant_hi, c.created_at, c.last_activity,
                        p.id, p.display_name, p.role
                 FROM conversations c
                 LEFT JOIN participants p
                   ON p.id = CASE WHEN c.participant_lo = ?1
                                  THEN c.participant_hi
                                  ELSE c.participant_lo END
                 WHERE c.participant_lo = ?1 OR c.participant_hi = ?1
                 ORDER BY c.last_activity DESC",
            )?;

            let rows = stmt
                .query_map([&uid], |row| {
                    let convo = ConversationRow {
                        id: row.get(0)?,
                        participant_lo: row.get(1)?,
                        participant_hi: row.get(2)?,
                        created_at: row.get(3)?,
                        last_activity: row.get(4)?,
                    };
                    let peer = match row.get::<_, Option<String>>(5)? {
                        Some(id) => Some(ParticipantRow {
                            id,
                            display_name: row.get(6)?,
                            role: row.get(7)?,
                        }),
                        None => None,
                    };
                    Ok((convo, peer))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let unread = query_unread_by_conversation(conn, &uid)?;

            let mut summaries = Vec::with_capacity(rows.len());
            for (convo_row, peer_row) in rows {
                let Some(peer_row) = peer_row else {
                    warn!("conversation {} has no directory entry for its peer", convo_row.id);
                    continue;
                };
                let conversation = Conversation::try_from(convo_row)?;
                let peer = Participant::try_from(peer_row)?;
                let last_message = query_last_message(conn, conversation.id)?;
                let unread = unread
                    .get(&conversation.id.to_string())
                    .copied()
                    .unwrap_or(0);

                summaries.push(ConversationSummary {
                    conversation,
                    peer,
                    last_message,
                    unread,
                });
            }

            Ok(summaries)
        })
    }

    // -- Messages --

    /// Durably accept a message: the canonical id and `accepted_at` are
    /// assigned here, at the moment of acceptance. Returns the persisted
    /// message with status `sent` and bumps the conversation's activity.
    pub fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        recipient_id: Uuid,
        kind: MessageKind,
        payload: &MessagePayload,
        origin_ts: DateTime<Utc>,
    ) -> Result<Message> {
        if !payload.matches_kind(kind) {
            return Err(StoreError::InvalidPayload);
        }

        let accepted_at = Utc::now();

        self.with_conn(|conn| {
            let cid = conversation_id.to_string();
            let exists: bool = conn
                .query_row("SELECT 1 FROM conversations WHERE id = ?1", [&cid], |_| Ok(true))
                .optional()?
                .unwrap_or(false);
            if !exists {
                return Err(StoreError::ConversationNotFound(conversation_id));
            }

            let (body, url, name) = match payload {
                MessagePayload::Text { text } => (Some(text.as_str()), None, None),
                MessagePayload::Attachment { url, name } => {
                    (None, Some(url.as_str()), Some(name.as_str()))
                }
            };

            conn.execute(
                "INSERT INTO messages
                     (conversation_id, sender_id, recipient_id, kind,
                      body, attachment_url, attachment_name,
                      origin_ts, accepted_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'sent')",
                rusqlite::params![
                    cid,
                    sender_id.to_string(),
                    recipient_id.to_string(),
                    kind.as_str(),
                    body,
                    url,
                    name,
                    origin_ts.timestamp_micros(),
                    accepted_at.timestamp_micros(),
                ],
            )?;
            let id = conn.last_insert_rowid();

            conn.execute(
                "UPDATE conversations SET last_activity = ?1 WHERE id = ?2",
                rusqlite::params![accepted_at.timestamp_micros(), cid],
            )?;

            Ok(Message {
                id,
                conversation_id,
                sender_id,
                recipient_id,
                kind,
                payload: payload.clone(),
                origin_ts,
                accepted_at,
                status: MessageStatus::Sent,
            })
        })
    }

    pub fn get_message(&self, message_id: i64) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {MESSAGE_COLS} FROM messages WHERE id = ?1"),
                    [message_id],
                    message_row,
                )
                .optional()?;

            row.map(Message::try_from).transpose()
        })
    }

    /// All messages of a conversation in the canonical total order
    /// (origin_ts, then id), optionally only those after `since_id`.
    pub fn list_messages(
        &self,
        conversation_id: Uuid,
        since_id: Option<i64>,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let cid = conversation_id.to_string();
            let exists: bool = conn
                .query_row("SELECT 1 FROM conversations WHERE id = ?1", [&cid], |_| Ok(true))
                .optional()?
                .unwrap_or(false);
            if !exists {
                return Err(StoreError::ConversationNotFound(conversation_id));
            }

            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLS} FROM messages
                 WHERE conversation_id = ?1 AND id > ?2
                 ORDER BY origin_ts, id"
            ))?;

            let rows = stmt
                .query_map(
                    rusqlite::params![cid, since_id.unwrap_or(0)],
                    message_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(Message::try_from).collect()
        })
    }

    /// Forward-only status transition. Returns `Ok(Some)` with the updated
    /// message when the status actually advanced, `Ok(None)` when the message
    /// is already at that status (duplicate receipts from other sessions are
    /// no-ops), and `InvalidTransition` on any backward attempt, leaving the
    /// row untouched.
    pub fn mark_status(&self, message_id: i64, next: MessageStatus) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {MESSAGE_COLS} FROM messages WHERE id = ?1"),
                    [message_id],
                    message_row,
                )
                .optional()?
                .ok_or(StoreError::MessageNotFound(message_id))?;

            let mut message = Message::try_from(row)?;
            if message.status == next {
                return Ok(None);
            }
            if !message.status.can_advance_to(next) {
                return Err(StoreError::InvalidTransition {
                    from: message.status,
                    to: next,
                });
            }

            conn.execute(
                "UPDATE messages SET status = ?1 WHERE id = ?2",
                rusqlite::params![next.as_str(), message_id],
            )?;

            message.status = next;
            Ok(Some(message))
        })
    }

    /// Promote every message the reader has received in this conversation to
    /// `read`. Returns the affected canonical ids so receipts can be fanned
    /// out to the sender.
    pub fn mark_conversation_read(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
    ) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let cid = conversation_id.to_string();
            let rid = reader_id.to_string();

            let mut stmt = conn.prepare(
                "SELECT id FROM messages
                 WHERE conversation_id = ?1 AND recipient_id = ?2 AND status != 'read'
                 ORDER BY id",
            )?;
            let ids = stmt
                .query_map(rusqlite::params![cid, rid], |row| row.get::<_, i64>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            if !ids.is_empty() {
                conn.execute(
                    "UPDATE messages SET status = 'read'
                     WHERE conversation_id = ?1 AND recipient_id = ?2 AND status != 'read'",
                    rusqlite::params![cid, rid],
                )?;
            }

            Ok(ids)
        })
    }

    /// Total unread messages across all of the user's conversations.
    pub fn unread_count(&self, user_id: Uuid) -> Result<u32> {
        self.with_conn(|conn| {
            let count: u32 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE recipient_id = ?1 AND status != 'read'",
                [user_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}

// -- Row mappers --

fn participant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ParticipantRow> {
    Ok(ParticipantRow {
        id: row.get(0)?,
        display_name: row.get(1)?,
        role: row.get(2)?,
    })
}

fn conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        participant_lo: row.get(1)?,
        participant_hi: row.get(2)?,
        created_at: row.get(3)?,
        last_activity: row.get(4)?,
    })
}

fn message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        recipient_id: row.get(3)?,
        kind: row.get(4)?,
        body: row.get(5)?,
        attachment_url: row.get(6)?,
        attachment_name: row.get(7)?,
        origin_ts: row.get(8)?,
        accepted_at: row.get(9)?,
        status: row.get(10)?,
    })
}

fn query_participant(conn: &Connection, id: Uuid) -> Result<Option<Participant>> {
    let row = conn
        .query_row(
            "SELECT id, display_name, role FROM participants WHERE id = ?1",
            [id.to_string()],
            participant_row,
        )
        .optional()?;

    row.map(Participant::try_from).transpose()
}

/// Newest message by the canonical order (origin_ts, id), for summaries.
fn query_last_message(conn: &Connection, conversation_id: Uuid) -> Result<Option<Message>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {MESSAGE_COLS} FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY origin_ts DESC, id DESC
                 LIMIT 1"
            ),
            [conversation_id.to_string()],
            message_row,
        )
        .optional()?;

    row.map(Message::try_from).transpose()
}

fn query_unread_by_conversation(
    conn: &Connection,
    user_id: &str,
) -> Result<std::collections::HashMap<String, u32>> {
    let mut stmt = conn.prepare(
        "SELECT conversation_id, COUNT(*) FROM messages
         WHERE recipient_id = ?1 AND status != 'read'
         GROUP BY conversation_id",
    )?;

    let rows = stmt
        .query_map([user_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?
        .collect::<std::result::Result<std::collections::HashMap<_, _>, _>>()?;

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carelink_types::models::Role;
    use tempfile::TempDir;

    fn open_db() -> (Database, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("carelink.db")).unwrap();
        (db, dir)
    }

    fn seed_pair(db: &Database) -> (Uuid, Uuid) {
        let mother = Uuid::new_v4();
        let doctor = Uuid::new_v4();
        db.upsert_participant(&Participant {
            id: mother,
            display_name: "Amara Silva".into(),
            role: Role::Mother,
        })
        .unwrap();
        db.upsert_participant(&Participant {
            id: doctor,
            display_name: "Dr. Perera".into(),
            role: Role::Doctor,
        })
        .unwrap();
        (mother, doctor)
    }

    fn text(content: &str) -> MessagePayload {
        MessagePayload::Text {
            text: content.into(),
        }
    }

    fn ts(micros: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(1_700_000_000_000_000 + micros).unwrap()
    }

    #[test]
    fn conversation_is_unique_per_pair_regardless_of_order() {
        let (db, _dir) = open_db();
        let (a, b) = seed_pair(&db);

        let first = db.find_or_create_conversation(a, b).unwrap();
        let second = db.find_or_create_conversation(b, a).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.participants, second.participants);
    }

    #[test]
    fn concurrent_find_or_create_yields_one_row() {
        let (db, _dir) = open_db();
        let (a, b) = seed_pair(&db);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| db.find_or_create_conversation(a, b).unwrap());
            }
        });

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn
                    .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn messages_are_listed_in_origin_order_for_any_insertion_order() {
        let (db, _dir) = open_db();
        let (a, b) = seed_pair(&db);
        let convo = db.find_or_create_conversation(a, b).unwrap();

        // Insert with origin timestamps deliberately out of arrival order.
        for offset in [500, 100, 900, 300, 700, 200] {
            db.append_message(convo.id, a, b, MessageKind::Text, &text("m"), ts(offset))
                .unwrap();
        }

        let listed = db.list_messages(convo.id, None).unwrap();
        let origins: Vec<_> = listed.iter().map(|m| m.origin_ts).collect();
        let mut sorted = origins.clone();
        sorted.sort();
        assert_eq!(origins, sorted);
    }

    #[test]
    fn equal_origin_timestamps_break_ties_by_canonical_id() {
        let (db, _dir) = open_db();
        let (a, b) = seed_pair(&db);
        let convo = db.find_or_create_conversation(a, b).unwrap();

        // Two devices sending within the same instant.
        let x = db
            .append_message(convo.id, a, b, MessageKind::Text, &text("X"), ts(0))
            .unwrap();
        let y = db
            .append_message(convo.id, a, b, MessageKind::Text, &text("Y"), ts(0))
            .unwrap();
        assert!(y.id > x.id);

        let listed = db.list_messages(convo.id, None).unwrap();
        assert_eq!(
            listed.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![x.id, y.id]
        );
    }

    #[test]
    fn append_assigns_sent_status_and_bumps_activity() {
        let (db, _dir) = open_db();
        let (a, b) = seed_pair(&db);
        let convo = db.find_or_create_conversation(a, b).unwrap();

        let msg = db
            .append_message(convo.id, a, b, MessageKind::Text, &text("hello"), ts(0))
            .unwrap();
        assert_eq!(msg.status, MessageStatus::Sent);

        let after = db.conversation(convo.id).unwrap().unwrap();
        assert!(after.last_activity >= convo.last_activity);
    }

    #[test]
    fn append_rejects_unknown_conversation() {
        let (db, _dir) = open_db();
        let (a, b) = seed_pair(&db);

        let missing = Uuid::new_v4();
        let err = db
            .append_message(missing, a, b, MessageKind::Text, &text("x"), ts(0))
            .unwrap_err();
        assert!(matches!(err, StoreError::ConversationNotFound(id) if id == missing));
    }

    #[test]
    fn append_rejects_mismatched_payload() {
        let (db, _dir) = open_db();
        let (a, b) = seed_pair(&db);
        let convo = db.find_or_create_conversation(a, b).unwrap();

        let err = db
            .append_message(convo.id, a, b, MessageKind::Image, &text("not a file"), ts(0))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPayload));
    }

    #[test]
    fn since_id_returns_only_newer_messages() {
        let (db, _dir) = open_db();
        let (a, b) = seed_pair(&db);
        let convo = db.find_or_create_conversation(a, b).unwrap();

        let first = db
            .append_message(convo.id, a, b, MessageKind::Text, &text("one"), ts(0))
            .unwrap();
        let second = db
            .append_message(convo.id, a, b, MessageKind::Text, &text("two"), ts(100))
            .unwrap();

        let caught_up = db.list_messages(convo.id, Some(first.id)).unwrap();
        assert_eq!(
            caught_up.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![second.id]
        );
        assert!(db.list_messages(convo.id, Some(second.id)).unwrap().is_empty());
    }

    #[test]
    fn status_moves_forward_only() {
        let (db, _dir) = open_db();
        let (a, b) = seed_pair(&db);
        let convo = db.find_or_create_conversation(a, b).unwrap();
        let msg = db
            .append_message(convo.id, a, b, MessageKind::Text, &text("hi"), ts(0))
            .unwrap();

        let delivered = db
            .mark_status(msg.id, MessageStatus::Delivered)
            .unwrap()
            .unwrap();
        assert_eq!(delivered.status, MessageStatus::Delivered);

        // Duplicate receipt from a second session is a no-op, not an error.
        assert!(db.mark_status(msg.id, MessageStatus::Delivered).unwrap().is_none());

        db.mark_status(msg.id, MessageStatus::Read).unwrap().unwrap();

        let err = db.mark_status(msg.id, MessageStatus::Sent).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        let unchanged = db.get_message(msg.id).unwrap().unwrap();
        assert_eq!(unchanged.status, MessageStatus::Read);
    }

    #[test]
    fn mark_conversation_read_promotes_only_received_messages() {
        let (db, _dir) = open_db();
        let (a, b) = seed_pair(&db);
        let convo = db.find_or_create_conversation(a, b).unwrap();

        let from_a = db
            .append_message(convo.id, a, b, MessageKind::Text, &text("to b"), ts(0))
            .unwrap();
        let from_b = db
            .append_message(convo.id, b, a, MessageKind::Text, &text("to a"), ts(100))
            .unwrap();

        let read_ids = db.mark_conversation_read(convo.id, b).unwrap();
        assert_eq!(read_ids, vec![from_a.id]);

        assert_eq!(
            db.get_message(from_a.id).unwrap().unwrap().status,
            MessageStatus::Read
        );
        // B's own outgoing message is untouched.
        assert_eq!(
            db.get_message(from_b.id).unwrap().unwrap().status,
            MessageStatus::Sent
        );
        // Second pass finds nothing left.
        assert!(db.mark_conversation_read(convo.id, b).unwrap().is_empty());
    }

    #[test]
    fn summaries_carry_peer_last_message_and_unread() {
        let (db, _dir) = open_db();
        let (mother, doctor) = seed_pair(&db);
        let convo = db.find_or_create_conversation(mother, doctor).unwrap();

        db.append_message(convo.id, mother, doctor, MessageKind::Text, &text("first"), ts(0))
            .unwrap();
        let last = db
            .append_message(convo.id, mother, doctor, MessageKind::Text, &text("second"), ts(100))
            .unwrap();

        let summaries = db.list_conversations(doctor).unwrap();
        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.peer.id, mother);
        assert_eq!(summary.peer.display_name, "Amara Silva");
        assert_eq!(summary.last_message.as_ref().map(|m| m.id), Some(last.id));
        assert_eq!(summary.unread, 2);
        assert_eq!(db.unread_count(doctor).unwrap(), 2);

        db.mark_conversation_read(convo.id, doctor).unwrap();
        let summaries = db.list_conversations(doctor).unwrap();
        assert_eq!(summaries[0].unread, 0);
    }

    #[test]
    fn participant_search_filters_and_excludes_caller() {
        let (db, _dir) = open_db();
        let (mother, doctor) = seed_pair(&db);
        db.upsert_participant(&Participant {
            id: Uuid::new_v4(),
            display_name: "Nadee Perera".into(),
            role: Role::Midwife,
        })
        .unwrap();

        let all = db.search_participants("perera", None, mother, 20).unwrap();
        assert_eq!(all.len(), 2);

        let doctors = db
            .search_participants("perera", Some(Role::Doctor), mother, 20)
            .unwrap();
        assert_eq!(doctors.len(), 1);
        assert_eq!(doctors[0].id, doctor);

        // The caller never sees themselves.
        let self_search = db.search_participants("Amara", None, mother, 20).unwrap();
        assert!(self_search.is_empty());
    }
}
