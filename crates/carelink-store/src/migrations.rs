use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Local projection of the external participant directory.
        CREATE TABLE IF NOT EXISTS participants (
            id           TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            role         TEXT NOT NULL,
            created_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Exactly one conversation per unordered participant pair; the pair
        -- is stored sorted so the UNIQUE constraint enforces that.
        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            participant_lo  TEXT NOT NULL,
            participant_hi  TEXT NOT NULL,
            created_at      INTEGER NOT NULL,
            last_activity   INTEGER NOT NULL,
            UNIQUE(participant_lo, participant_hi)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_lo
            ON conversations(participant_lo, last_activity);
        CREATE INDEX IF NOT EXISTS idx_conversations_hi
            ON conversations(participant_hi, last_activity);

        -- Canonical message ids are the AUTOINCREMENT rowid: unique and
        -- monotonically orderable, which gives since-id pagination and the
        -- tie-break for equal origin timestamps. Timestamps are UTC
        -- microseconds.
        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            sender_id       TEXT NOT NULL,
            recipient_id    TEXT NOT NULL,
            kind            TEXT NOT NULL,
            body            TEXT,
            attachment_url  TEXT,
            attachment_name TEXT,
            origin_ts       INTEGER NOT NULL,
            accepted_at     INTEGER NOT NULL,
            status          TEXT NOT NULL DEFAULT 'sent'
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, origin_ts, id);
        CREATE INDEX IF NOT EXISTS idx_messages_unread
            ON messages(recipient_id, status);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
