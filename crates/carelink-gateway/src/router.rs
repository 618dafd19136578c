use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use carelink_store::{Database, StoreError};
use carelink_types::events::{SendRejectReason, ServerEvent};
use carelink_types::models::{Message, MessageKind, MessagePayload, MessageStatus, Participant};

use crate::registry::SessionRegistry;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("unknown recipient: {0}")]
    UnknownRecipient(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SendError {
    pub fn reject_reason(&self) -> SendRejectReason {
        match self {
            SendError::UnknownRecipient(_) => SendRejectReason::UnknownRecipient,
            SendError::Store(StoreError::InvalidPayload) => SendRejectReason::InvalidPayload,
            SendError::Store(_) => SendRejectReason::StoreUnavailable,
        }
    }
}

/// Send/receipt orchestration shared by the WebSocket and REST paths:
/// resolve the conversation, persist through the store, then relay to live
/// sessions. Holds the per-conversation sequencing boundary.
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    db: Arc<Database>,
    registry: SessionRegistry,

    /// Per-conversation locks serializing append + relay so two concurrent
    /// sends into one conversation cannot interleave between canonical-id
    /// assignment and fan-out. Cross-conversation sends stay parallel.
    sequencers: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl MessageRouter {
    pub fn new(db: Arc<Database>, registry: SessionRegistry) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                db,
                registry,
                sequencers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Refresh the directory projection from a validated credential. The
    /// bearer token carries the caller's name and role, so every successful
    /// handshake keeps the local participant row current.
    pub async fn ensure_participant(&self, participant: Participant) {
        if let Err(e) = self
            .with_store(move |db| db.upsert_participant(&participant))
            .await
        {
            warn!("participant upsert failed: {e}");
        }
    }

    /// Run blocking store work off the async runtime.
    async fn with_store<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.inner.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }

    async fn sequencer_for(&self, conversation_id: Uuid) -> Arc<Mutex<()>> {
        self.inner
            .sequencers
            .lock()
            .await
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// The send path: resolve the conversation, persist the message
    /// (the store assigns the canonical id and acceptance time), acknowledge
    /// the sender's session, then push `new_message` to every live session of
    /// the recipient and every *other* live session of the sender. An offline
    /// recipient is not an error: the message stays `sent` until their next
    /// catch-up fetch.
    pub async fn send_message(
        &self,
        sender_id: Uuid,
        origin_session: Option<Uuid>,
        recipient_id: Uuid,
        kind: MessageKind,
        payload: MessagePayload,
        origin_ts: DateTime<Utc>,
    ) -> Result<Message, SendError> {
        if recipient_id == sender_id {
            return Err(SendError::UnknownRecipient(recipient_id));
        }

        let recipient = self
            .with_store(move |db| db.participant(recipient_id))
            .await?;
        if recipient.is_none() {
            return Err(SendError::UnknownRecipient(recipient_id));
        }

        let conversation = self
            .with_store(move |db| db.find_or_create_conversation(sender_id, recipient_id))
            .await?;

        let sequencer = self.sequencer_for(conversation.id).await;
        let _guard = sequencer.lock().await;

        let conversation_id = conversation.id;
        let message = self
            .with_store(move |db| {
                db.append_message(
                    conversation_id,
                    sender_id,
                    recipient_id,
                    kind,
                    &payload,
                    origin_ts,
                )
            })
            .await?;

        let registry = &self.inner.registry;

        // Ack the sending session first, then fan out.
        if let Some(session_id) = origin_session {
            registry
                .send_to_session(
                    sender_id,
                    session_id,
                    ServerEvent::MessageAccepted {
                        message: message.clone(),
                    },
                )
                .await;
        }

        let push = ServerEvent::NewMessage {
            conversation_id,
            message: message.clone(),
        };
        // new_message is user-targeted (not gated on join) so a first-contact
        // message can surface a previously-unknown conversation on the
        // recipient's client.
        registry.send_to_user(recipient_id, None, &push).await;
        registry.send_to_user(sender_id, origin_session, &push).await;

        Ok(message)
    }

    /// Subscribe a session to a conversation after checking the caller is one
    /// of its participants. Unknown ids are a client programming error:
    /// logged and rejected.
    pub async fn join_conversation(&self, user_id: Uuid, session_id: Uuid, conversation_id: Uuid) {
        let conversation = match self
            .with_store(move |db| db.conversation(conversation_id))
            .await
        {
            Ok(Some(c)) => c,
            Ok(None) => {
                warn!("{user_id} tried to join unknown conversation {conversation_id}");
                return;
            }
            Err(e) => {
                warn!("join_conversation lookup failed: {e}");
                return;
            }
        };

        if !conversation.involves(user_id) {
            warn!("{user_id} tried to join conversation {conversation_id} they are not part of");
            return;
        }

        let registry = &self.inner.registry;
        registry.join(user_id, session_id, conversation_id).await;
        registry
            .send_to_session(
                user_id,
                session_id,
                ServerEvent::ConversationJoined { conversation_id },
            )
            .await;
    }

    /// Ephemeral typing relay. Updates the registry's typing table and, on an
    /// actual change, notifies the other participant's subscribed sessions.
    /// The store is never touched.
    pub async fn set_typing(&self, user_id: Uuid, conversation_id: Uuid, is_typing: bool) {
        let conversation = match self
            .with_store(move |db| db.conversation(conversation_id))
            .await
        {
            Ok(Some(c)) => c,
            Ok(None) => {
                warn!("typing event for unknown conversation {conversation_id}");
                return;
            }
            Err(e) => {
                warn!("typing lookup failed: {e}");
                return;
            }
        };
        let Some(peer) = conversation.peer_of(user_id) else {
            warn!("{user_id} sent typing for conversation {conversation_id} they are not part of");
            return;
        };

        let registry = &self.inner.registry;
        if !registry.set_typing(user_id, conversation_id, is_typing).await {
            return;
        }

        registry
            .send_to_joined(
                peer,
                conversation_id,
                None,
                &ServerEvent::TypingIndicator {
                    conversation_id,
                    user_id,
                    is_typing,
                },
            )
            .await;
    }

    /// A disconnected user's typing state is treated as stopped: relay a
    /// clearing indicator for every conversation the registry reported on
    /// unregister.
    pub async fn clear_typing_on_disconnect(&self, user_id: Uuid, conversations: Vec<Uuid>) {
        for conversation_id in conversations {
            let conversation = match self
                .with_store(move |db| db.conversation(conversation_id))
                .await
            {
                Ok(Some(c)) => c,
                _ => continue,
            };
            let Some(peer) = conversation.peer_of(user_id) else {
                continue;
            };
            self.inner
                .registry
                .send_to_joined(
                    peer,
                    conversation_id,
                    None,
                    &ServerEvent::TypingIndicator {
                        conversation_id,
                        user_id,
                        is_typing: false,
                    },
                )
                .await;
        }
    }

    /// Receipt from a recipient session: advance the message's status and
    /// fan the transition out to both participants' subscribed sessions
    /// (minus the acknowledging one). Backward attempts are rejected by the
    /// store; duplicate receipts are no-ops.
    pub async fn mark_status(
        &self,
        user_id: Uuid,
        acking_session: Option<Uuid>,
        message_id: i64,
        status: MessageStatus,
    ) {
        let message = match self.with_store(move |db| db.get_message(message_id)).await {
            Ok(Some(m)) => m,
            Ok(None) => {
                warn!("receipt for unknown message {message_id}");
                return;
            }
            Err(e) => {
                warn!("receipt lookup failed: {e}");
                return;
            }
        };

        if message.recipient_id != user_id {
            warn!("{user_id} acked message {message_id} they did not receive");
            return;
        }

        let updated = match self
            .with_store(move |db| db.mark_status(message_id, status))
            .await
        {
            Ok(Some(m)) => m,
            Ok(None) => {
                debug!("duplicate {} receipt for message {message_id}", status.as_str());
                return;
            }
            Err(e) => {
                warn!("mark_status({message_id}, {}) rejected: {e}", status.as_str());
                return;
            }
        };

        let event = ServerEvent::MessageStatusUpdate {
            conversation_id: updated.conversation_id,
            message_id: updated.id,
            status: updated.status,
        };
        let registry = &self.inner.registry;
        registry
            .send_to_joined(updated.sender_id, updated.conversation_id, None, &event)
            .await;
        registry
            .send_to_joined(
                updated.recipient_id,
                updated.conversation_id,
                acking_session,
                &event,
            )
            .await;
    }

    /// Bulk read receipt for a whole conversation (the reader opened it).
    /// Returns the promoted canonical ids.
    pub async fn read_conversation(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Vec<i64>, StoreError> {
        let conversation = self
            .with_store(move |db| db.conversation(conversation_id))
            .await?
            .ok_or(StoreError::ConversationNotFound(conversation_id))?;
        let Some(peer) = conversation.peer_of(user_id) else {
            return Err(StoreError::ConversationNotFound(conversation_id));
        };

        let ids = self
            .with_store(move |db| db.mark_conversation_read(conversation_id, user_id))
            .await?;

        let registry = &self.inner.registry;
        for message_id in &ids {
            let event = ServerEvent::MessageStatusUpdate {
                conversation_id,
                message_id: *message_id,
                status: MessageStatus::Read,
            };
            registry.send_to_joined(peer, conversation_id, None, &event).await;
            registry.send_to_joined(user_id, conversation_id, None, &event).await;
        }

        Ok(ids)
    }
}
