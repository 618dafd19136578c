//! Delivery-path tests driving the router, registry, and a real store
//! together: relay to live sessions, store-and-forward for offline
//! recipients, receipts, and typing lifecycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use carelink_gateway::registry::SessionRegistry;
use carelink_gateway::router::{MessageRouter, SendError};
use carelink_store::Database;
use carelink_types::events::ServerEvent;
use carelink_types::models::{
    MessageKind, MessagePayload, MessageStatus, Participant, Role,
};

struct Fixture {
    router: MessageRouter,
    db: Arc<Database>,
    mother: Uuid,
    doctor: Uuid,
    _dir: TempDir,
}

fn setup() -> Fixture {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(&dir.path().join("carelink.db")).unwrap());

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

    let router = MessageRouter::new(db.clone(), SessionRegistry::new());
    Fixture {
        router,
        db,
        mother,
        doctor,
        _dir: dir,
    }
}

fn text(content: &str) -> MessagePayload {
    MessagePayload::Text {
        text: content.into(),
    }
}

fn ts(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(1_700_000_000_000_000 + micros).unwrap()
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn both_online_send_acks_sender_and_pushes_once() {
    let fx = setup();
    let registry = fx.router.registry().clone();

    let (doctor_tab, mut doctor_rx) = registry.register(fx.doctor).await;
    let (_doctor_other, mut doctor_other_rx) = registry.register(fx.doctor).await;
    let (_mother_tab, mut mother_rx) = registry.register(fx.mother).await;

    let message = fx
        .router
        .send_message(
            fx.doctor,
            Some(doctor_tab),
            fx.mother,
            MessageKind::Text,
            text("Hi"),
            ts(0),
        )
        .await
        .unwrap();
    assert_eq!(message.status, MessageStatus::Sent);

    // Origin session: the acknowledgement only, never its own echo.
    let acks = drain(&mut doctor_rx);
    assert_eq!(acks.len(), 1);
    match &acks[0] {
        ServerEvent::MessageAccepted { message: acked } => assert_eq!(acked.id, message.id),
        other => panic!("expected MessageAccepted, got {other:?}"),
    }

    // Sender's other tab: the push, for multi-tab consistency.
    let others = drain(&mut doctor_other_rx);
    assert_eq!(others.len(), 1);
    assert!(matches!(&others[0], ServerEvent::NewMessage { message: m, .. } if m.id == message.id));

    // Recipient: exactly one push, even for a first-contact conversation
    // they never joined.
    let pushes = drain(&mut mother_rx);
    assert_eq!(pushes.len(), 1);
    match &pushes[0] {
        ServerEvent::NewMessage {
            conversation_id,
            message: pushed,
        } => {
            assert_eq!(*conversation_id, message.conversation_id);
            assert_eq!(pushed.id, message.id);
        }
        other => panic!("expected NewMessage, got {other:?}"),
    }
}

#[tokio::test]
async fn offline_recipient_gets_store_and_forward() {
    let fx = setup();
    let registry = fx.router.registry().clone();

    // A sends while B has no live session.
    let message = fx
        .router
        .send_message(
            fx.doctor,
            None,
            fx.mother,
            MessageKind::Text,
            text("Hello"),
            ts(0),
        )
        .await
        .unwrap();
    assert_eq!(message.status, MessageStatus::Sent);

    // B connects later, joins, and fetches history: the message arrives
    // without re-transmission.
    let (mother_session, mut mother_rx) = registry.register(fx.mother).await;
    fx.router
        .join_conversation(fx.mother, mother_session, message.conversation_id)
        .await;
    assert!(matches!(
        drain(&mut mother_rx).as_slice(),
        [ServerEvent::ConversationJoined { .. }]
    ));

    let history = fx.db.list_messages(message.conversation_id, None).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, message.id);
    assert_eq!(history[0].status, MessageStatus::Sent);

    // B reads; A's joined session sees the transition to read.
    let (doctor_session, mut doctor_rx) = registry.register(fx.doctor).await;
    fx.router
        .join_conversation(fx.doctor, doctor_session, message.conversation_id)
        .await;
    drain(&mut doctor_rx);

    let read_ids = fx
        .router
        .read_conversation(fx.mother, message.conversation_id)
        .await
        .unwrap();
    assert_eq!(read_ids, vec![message.id]);

    let updates = drain(&mut doctor_rx);
    assert!(updates.iter().any(|e| matches!(
        e,
        ServerEvent::MessageStatusUpdate {
            message_id,
            status: MessageStatus::Read,
            ..
        } if *message_id == message.id
    )));
    assert_eq!(
        fx.db.get_message(message.id).unwrap().unwrap().status,
        MessageStatus::Read
    );
}

#[tokio::test]
async fn delivered_receipt_fans_out_once() {
    let fx = setup();
    let registry = fx.router.registry().clone();

    let (doctor_session, mut doctor_rx) = registry.register(fx.doctor).await;
    let (mother_a, mut mother_a_rx) = registry.register(fx.mother).await;
    let (mother_b, mut mother_b_rx) = registry.register(fx.mother).await;

    let message = fx
        .router
        .send_message(
            fx.doctor,
            Some(doctor_session),
            fx.mother,
            MessageKind::Text,
            text("ping"),
            ts(0),
        )
        .await
        .unwrap();

    fx.router
        .join_conversation(fx.doctor, doctor_session, message.conversation_id)
        .await;
    fx.router
        .join_conversation(fx.mother, mother_a, message.conversation_id)
        .await;
    fx.router
        .join_conversation(fx.mother, mother_b, message.conversation_id)
        .await;
    drain(&mut doctor_rx);
    drain(&mut mother_a_rx);
    drain(&mut mother_b_rx);

    // Any one recipient session acking marks the message delivered.
    fx.router
        .mark_status(
            fx.mother,
            Some(mother_a),
            message.id,
            MessageStatus::Delivered,
        )
        .await;

    let to_sender = drain(&mut doctor_rx);
    assert_eq!(to_sender.len(), 1);
    assert!(matches!(
        &to_sender[0],
        ServerEvent::MessageStatusUpdate {
            status: MessageStatus::Delivered,
            ..
        }
    ));
    // The recipient's other tab is kept consistent; the acking tab is not
    // echoed back to.
    assert_eq!(drain(&mut mother_b_rx).len(), 1);
    assert!(drain(&mut mother_a_rx).is_empty());

    // A duplicate receipt from the second tab is a no-op: no fan-out.
    fx.router
        .mark_status(
            fx.mother,
            Some(mother_b),
            message.id,
            MessageStatus::Delivered,
        )
        .await;
    assert!(drain(&mut doctor_rx).is_empty());
}

#[tokio::test]
async fn typing_is_relayed_and_cleared_on_disconnect() {
    let fx = setup();
    let registry = fx.router.registry().clone();

    // Establish the conversation first.
    let message = fx
        .router
        .send_message(fx.doctor, None, fx.mother, MessageKind::Text, text("hi"), ts(0))
        .await
        .unwrap();
    let conversation_id = message.conversation_id;

    let (doctor_session, _doctor_rx) = registry.register(fx.doctor).await;
    let (mother_session, mut mother_rx) = registry.register(fx.mother).await;
    fx.router
        .join_conversation(fx.mother, mother_session, conversation_id)
        .await;
    drain(&mut mother_rx);

    fx.router.set_typing(fx.doctor, conversation_id, true).await;
    let events = drain(&mut mother_rx);
    assert!(matches!(
        events.as_slice(),
        [ServerEvent::TypingIndicator {
            is_typing: true,
            ..
        }]
    ));

    // Re-asserting the same state relays nothing.
    fx.router.set_typing(fx.doctor, conversation_id, true).await;
    assert!(drain(&mut mother_rx).is_empty());

    // Disconnect of the typist's last session is treated as a stop.
    let stale = registry.unregister(fx.doctor, doctor_session).await;
    assert_eq!(stale, vec![conversation_id]);
    fx.router.clear_typing_on_disconnect(fx.doctor, stale).await;

    let events = drain(&mut mother_rx);
    assert!(matches!(
        events.as_slice(),
        [ServerEvent::TypingIndicator {
            is_typing: false,
            ..
        }]
    ));
}

#[tokio::test]
async fn send_to_unknown_recipient_is_rejected() {
    let fx = setup();

    let err = fx
        .router
        .send_message(
            fx.doctor,
            None,
            Uuid::new_v4(),
            MessageKind::Text,
            text("hello?"),
            ts(0),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::UnknownRecipient(_)));

    // Messaging yourself is equally impossible.
    let err = fx
        .router
        .send_message(
            fx.doctor,
            None,
            fx.doctor,
            MessageKind::Text,
            text("me"),
            ts(0),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::UnknownRecipient(_)));
}
