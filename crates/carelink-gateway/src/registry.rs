use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use carelink_types::events::ServerEvent;

struct SessionHandle {
    tx: mpsc::UnboundedSender<ServerEvent>,
    /// Conversations this session has subscribed to via join_conversation.
    joined: HashSet<Uuid>,
}

/// The one process-wide mutable structure in the gateway: the routing table
/// from a user to their live sessions, plus the ephemeral typing table.
/// Mutated only on connect/disconnect/join/typing; read by the relay step.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    /// user_id -> session_id -> handle. A user may hold several concurrent
    /// sessions (multiple tabs); the registry treats them as a set.
    sessions: RwLock<HashMap<Uuid, HashMap<Uuid, SessionHandle>>>,

    /// user_id -> conversations the user is currently typing in.
    /// Last-write-wins, never persisted.
    typing: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                typing: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a new live session for a user. Returns the session id and
    /// the receiver the connection task drains into the socket.
    pub async fn register(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner.sessions.write().await.entry(user_id).or_default().insert(
            session_id,
            SessionHandle {
                tx,
                joined: HashSet::new(),
            },
        );

        (session_id, rx)
    }

    /// Remove a session. When this was the user's last live session, the
    /// user's typing state is taken over by the caller: the returned
    /// conversations still carried an active typing indicator and must be
    /// relayed as stopped.
    pub async fn unregister(&self, user_id: Uuid, session_id: Uuid) -> Vec<Uuid> {
        let last_session = {
            let mut sessions = self.inner.sessions.write().await;
            let Some(user_sessions) = sessions.get_mut(&user_id) else {
                return Vec::new();
            };
            user_sessions.remove(&session_id);
            if user_sessions.is_empty() {
                sessions.remove(&user_id);
                true
            } else {
                false
            }
        };

        if !last_session {
            // Another tab is still live; its typing state stands.
            return Vec::new();
        }

        self.inner
            .typing
            .write()
            .await
            .remove(&user_id)
            .map(|convos| convos.into_iter().collect())
            .unwrap_or_default()
    }

    /// Subscribe a session to a conversation's event stream. Idempotent.
    pub async fn join(&self, user_id: Uuid, session_id: Uuid, conversation_id: Uuid) {
        let mut sessions = self.inner.sessions.write().await;
        if let Some(handle) = sessions.get_mut(&user_id).and_then(|s| s.get_mut(&session_id)) {
            handle.joined.insert(conversation_id);
        }
    }

    /// Update the typing table. Returns true if the state actually changed
    /// (callers only relay on change).
    pub async fn set_typing(&self, user_id: Uuid, conversation_id: Uuid, is_typing: bool) -> bool {
        let mut typing = self.inner.typing.write().await;
        if is_typing {
            typing.entry(user_id).or_default().insert(conversation_id)
        } else {
            match typing.get_mut(&user_id) {
                Some(convos) => {
                    let removed = convos.remove(&conversation_id);
                    if convos.is_empty() {
                        typing.remove(&user_id);
                    }
                    removed
                }
                None => false,
            }
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.sessions.read().await.contains_key(&user_id)
    }

    pub async fn session_count(&self, user_id: Uuid) -> usize {
        self.inner
            .sessions
            .read()
            .await
            .get(&user_id)
            .map_or(0, |s| s.len())
    }

    /// Targeted send to one session. Best-effort: a closed receiver means the
    /// connection is already going away and unregister will clean up.
    pub async fn send_to_session(&self, user_id: Uuid, session_id: Uuid, event: ServerEvent) {
        let sessions = self.inner.sessions.read().await;
        if let Some(handle) = sessions.get(&user_id).and_then(|s| s.get(&session_id)) {
            let _ = handle.tx.send(event);
        }
    }

    /// Send to every live session of a user, optionally excluding one (the
    /// session that triggered the event).
    pub async fn send_to_user(&self, user_id: Uuid, except: Option<Uuid>, event: &ServerEvent) {
        let sessions = self.inner.sessions.read().await;
        let Some(user_sessions) = sessions.get(&user_id) else {
            return;
        };
        for (session_id, handle) in user_sessions {
            if Some(*session_id) == except {
                continue;
            }
            let _ = handle.tx.send(event.clone());
        }
    }

    /// Send to every session of a user that has joined the conversation,
    /// optionally excluding one.
    pub async fn send_to_joined(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        except: Option<Uuid>,
        event: &ServerEvent,
    ) {
        let sessions = self.inner.sessions.read().await;
        let Some(user_sessions) = sessions.get(&user_id) else {
            return;
        };
        for (session_id, handle) in user_sessions {
            if Some(*session_id) == except || !handle.joined.contains(&conversation_id) {
                continue;
            }
            let _ = handle.tx.send(event.clone());
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(user_id: Uuid) -> ServerEvent {
        ServerEvent::Ready {
            user_id,
            name: "test".into(),
        }
    }

    #[tokio::test]
    async fn sessions_form_a_set_per_user() {
        let registry = SessionRegistry::new();
        let user = Uuid::new_v4();

        let (first, mut rx1) = registry.register(user).await;
        let (second, mut rx2) = registry.register(user).await;
        assert_ne!(first, second);
        assert_eq!(registry.session_count(user).await, 2);

        registry.send_to_user(user, None, &ready(user)).await;
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());

        // Excluding the origin session skips only that session.
        registry.send_to_user(user, Some(first), &ready(user)).await;
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());

        registry.unregister(user, first).await;
        assert_eq!(registry.session_count(user).await, 1);
        registry.unregister(user, second).await;
        assert!(!registry.is_online(user).await);
    }

    #[tokio::test]
    async fn joined_filter_scopes_conversation_events() {
        let registry = SessionRegistry::new();
        let user = Uuid::new_v4();
        let convo = Uuid::new_v4();

        let (joined_session, mut joined_rx) = registry.register(user).await;
        let (_other_session, mut other_rx) = registry.register(user).await;

        registry.join(user, joined_session, convo).await;
        // join is idempotent
        registry.join(user, joined_session, convo).await;

        let event = ServerEvent::ConversationJoined {
            conversation_id: convo,
        };
        registry.send_to_joined(user, convo, None, &event).await;

        assert!(joined_rx.try_recv().is_ok());
        assert!(joined_rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn typing_state_clears_with_the_last_session_only() {
        let registry = SessionRegistry::new();
        let user = Uuid::new_v4();
        let convo = Uuid::new_v4();

        let (first, _rx1) = registry.register(user).await;
        let (second, _rx2) = registry.register(user).await;

        assert!(registry.set_typing(user, convo, true).await);
        // Re-asserting the same state is not a change.
        assert!(!registry.set_typing(user, convo, true).await);

        // First disconnect: another tab is live, typing state stands.
        assert!(registry.unregister(user, first).await.is_empty());

        // Last disconnect: the typing indicator must be relayed as stopped.
        let cleared = registry.unregister(user, second).await;
        assert_eq!(cleared, vec![convo]);
    }

    #[tokio::test]
    async fn explicit_stop_clears_typing() {
        let registry = SessionRegistry::new();
        let user = Uuid::new_v4();
        let convo = Uuid::new_v4();

        let (session, _rx) = registry.register(user).await;
        registry.set_typing(user, convo, true).await;
        assert!(registry.set_typing(user, convo, false).await);
        assert!(!registry.set_typing(user, convo, false).await);

        // Nothing left to clear on disconnect.
        assert!(registry.unregister(user, session).await.is_empty());
    }
}
