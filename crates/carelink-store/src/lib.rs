pub mod migrations;
pub mod models;
pub mod queries;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use carelink_types::models::MessageStatus;

/// Failures surfaced by the message store. `Unavailable` is the distinct
/// persistence-failure condition: the caller must report `error` status back
/// to the sender rather than drop the message silently.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("conversation not found: {0}")]
    ConversationNotFound(Uuid),

    #[error("message not found: {0}")]
    MessageNotFound(i64),

    #[error("payload does not match message kind")]
    InvalidPayload,

    #[error("status cannot move from {} to {}", .from.as_str(), .to.as_str())]
    InvalidTransition {
        from: MessageStatus,
        to: MessageStatus,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("DB lock poisoned: {e}")))?;
        f(&conn)
    }
}
