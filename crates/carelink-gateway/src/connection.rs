use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use carelink_types::events::{ClientCommand, ServerEvent};
use carelink_types::models::{Participant, Role};

use crate::router::MessageRouter;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a fresh connection gets to present its credential.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a single WebSocket connection: authenticate, register the session,
/// then pump events both ways until either side goes away.
pub async fn handle_connection(socket: WebSocket, router: MessageRouter, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: the first frame must be an Identify command with a valid
    // bearer token; nothing else is processed before authentication.
    let (user_id, name, role) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(identity) => identity,
        None => {
            warn!("gateway client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", name, user_id);

    // The validated token names the caller; keep the directory projection
    // current so peers can resolve them as a recipient.
    router
        .ensure_participant(Participant {
            id: user_id,
            display_name: name.clone(),
            role,
        })
        .await;

    // Step 2: confirm the session is live.
    let ready = ServerEvent::Ready {
        user_id,
        name: name.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    let registry = router.registry().clone();
    let (session_id, mut session_rx) = registry.register(user_id).await;

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward registry events -> client, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = session_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client.
    let router_recv = router.clone();
    let name_recv = name.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&router_recv, user_id, session_id, cmd).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            name_recv,
                            user_id,
                            e,
                            &text[..text.len().min(200)]
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let stale_typing = registry.unregister(user_id, session_id).await;
    router.clear_typing_on_disconnect(user_id, stale_typing).await;
    info!("{} ({}) disconnected from gateway", name, user_id);
}

async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String, Role)> {
    use carelink_types::api::Claims;
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(ClientCommand::Identify { token }) =
                    serde_json::from_str::<ClientCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    let claims = token_data.claims;
                    return Some((claims.sub, claims.name, claims.role));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

async fn handle_command(
    router: &MessageRouter,
    user_id: Uuid,
    session_id: Uuid,
    cmd: ClientCommand,
) {
    match cmd {
        ClientCommand::Identify { .. } => {} // Already handled

        ClientCommand::JoinConversation { conversation_id } => {
            router
                .join_conversation(user_id, session_id, conversation_id)
                .await;
        }

        ClientCommand::SendMessage {
            recipient_id,
            kind,
            payload,
            origin_ts,
        } => {
            let result = router
                .send_message(
                    user_id,
                    Some(session_id),
                    recipient_id,
                    kind,
                    payload,
                    origin_ts,
                )
                .await;

            // A failed send is reported to the sender only; the recipient is
            // never told a message almost arrived.
            if let Err(e) = result {
                warn!("{} send to {} failed: {}", user_id, recipient_id, e);
                router
                    .registry()
                    .send_to_session(
                        user_id,
                        session_id,
                        ServerEvent::SendRejected {
                            recipient_id,
                            origin_ts,
                            reason: e.reject_reason(),
                        },
                    )
                    .await;
            }
        }

        ClientCommand::TypingStart { conversation_id } => {
            router.set_typing(user_id, conversation_id, true).await;
        }

        ClientCommand::TypingStop { conversation_id } => {
            router.set_typing(user_id, conversation_id, false).await;
        }

        ClientCommand::MarkDelivered { message_id } => {
            router
                .mark_status(
                    user_id,
                    Some(session_id),
                    message_id,
                    carelink_types::models::MessageStatus::Delivered,
                )
                .await;
        }

        ClientCommand::MarkRead { message_id } => {
            router
                .mark_status(
                    user_id,
                    Some(session_id),
                    message_id,
                    carelink_types::models::MessageStatus::Read,
                )
                .await;
        }
    }
}
