//! Integration tests for presence and chat over the in-process bus.
//!
//! These tests run a real registry agent and several sessions on one
//! `LocalBus`, verifying membership convergence, leave handling and
//! message routing without any networking.

use std::sync::Arc;

use agora_chat::bus::{LocalBus, MessageBus};
use agora_chat::protocol::{Envelope, Event, ParticipantId};
use agora_chat::registry::{PresenceRegistry, RegistryAgent};
use agora_chat::session::{ChatEvent, ChatSession, Sent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

fn start_hub() -> (Arc<LocalBus>, JoinHandle<PresenceRegistry>) {
    let bus = Arc::new(LocalBus::new("hub"));
    let registry = RegistryAgent::attach(&bus).unwrap().spawn();
    (bus, registry)
}

fn join(bus: &Arc<LocalBus>, name: &str) -> (ChatSession, mpsc::Receiver<ChatEvent>) {
    let mut session = ChatSession::join_local(bus, name).unwrap();
    let events = session.take_event_rx().unwrap();
    (session, events)
}

async fn next_event(events: &mut mpsc::Receiver<ChatEvent>) -> ChatEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

/// Skip events until the participant list equals `labels`.
async fn wait_for_participants(events: &mut mpsc::Receiver<ChatEvent>, labels: &[&str]) {
    loop {
        if let ChatEvent::ParticipantsChanged(current) = next_event(events).await {
            if current == labels {
                return;
            }
        }
    }
}

/// Next chat message, skipping presence updates.
async fn next_message(events: &mut mpsc::Receiver<ChatEvent>) -> ChatEvent {
    loop {
        match next_event(events).await {
            ChatEvent::ParticipantsChanged(_) => continue,
            message => return message,
        }
    }
}

async fn assert_quiet(events: &mut mpsc::Receiver<ChatEvent>) {
    let got = timeout(Duration::from_millis(200), events.recv()).await;
    assert!(got.is_err(), "expected no event, got {got:?}");
}

#[tokio::test]
async fn test_three_participants_scenario() {
    let (bus, _registry) = start_hub();

    let (a, mut a_rx) = join(&bus, "A");
    let (b, mut b_rx) = join(&bus, "B");
    wait_for_participants(&mut a_rx, &["B"]).await;
    wait_for_participants(&mut b_rx, &["A"]).await;

    let (c, mut c_rx) = join(&bus, "C");
    wait_for_participants(&mut a_rx, &["B", "C"]).await;
    wait_for_participants(&mut b_rx, &["A", "C"]).await;
    wait_for_participants(&mut c_rx, &["A", "B"]).await;

    // B says hi: everyone, including B's own echo.
    assert_eq!(b.handle_input("hi").await.unwrap(), Sent::Broadcast(2));
    let hi = ChatEvent::Broadcast {
        speaker: "B".into(),
        text: "hi".into(),
    };
    assert_eq!(next_message(&mut a_rx).await, hi);
    assert_eq!(next_message(&mut b_rx).await, hi);
    assert_eq!(next_message(&mut c_rx).await, hi);

    // A whispers to C: only C receives it, with the prefix stripped.
    let sent = a.handle_input("/C secret").await.unwrap();
    assert_eq!(sent, Sent::Private(Some(c.id().clone())));
    let secret = ChatEvent::Private {
        speaker: "A".into(),
        text: "secret".into(),
    };
    assert_eq!(next_message(&mut c_rx).await, secret);
    assert_eq!(next_message(&mut a_rx).await, secret);
    assert_quiet(&mut b_rx).await;

    // B leaves.
    b.leave().unwrap();
    wait_for_participants(&mut a_rx, &["C"]).await;
    wait_for_participants(&mut c_rx, &["A"]).await;
    assert_eq!(a.participant_full_ids().await, vec!["C@hub".to_string()]);
}

#[tokio::test]
async fn test_disconnection_is_a_leave() {
    let (bus, _registry) = start_hub();

    let (_a, mut a_rx) = join(&bus, "A");
    let (b, mut b_rx) = join(&bus, "B");
    wait_for_participants(&mut a_rx, &["B"]).await;
    wait_for_participants(&mut b_rx, &["A"]).await;

    // No Cancel is sent; the bus reports the lost connection.
    assert!(bus.disconnect(b.id()));
    wait_for_participants(&mut a_rx, &[]).await;

    // The name is free again.
    drop(b);
    let (_b_again, mut b_rx) = join(&bus, "B");
    wait_for_participants(&mut b_rx, &["A"]).await;
    wait_for_participants(&mut a_rx, &["B"]).await;
}

#[tokio::test]
async fn test_registry_state_matches_sessions() {
    let (bus, registry) = start_hub();

    let (_a, mut a_rx) = join(&bus, "A");
    let (b, _b_rx) = join(&bus, "B");
    let (_c, _c_rx) = join(&bus, "C");
    wait_for_participants(&mut a_rx, &["B", "C"]).await;

    b.leave().unwrap();
    wait_for_participants(&mut a_rx, &["C"]).await;

    // Closing the registry's inbox stops the agent and hands back its state.
    bus.disconnect(&bus.registry_id());
    let registry = timeout(Duration::from_secs(2), registry).await.unwrap().unwrap();
    assert_eq!(
        registry.participants(),
        vec![ParticipantId::new("A", "hub"), ParticipantId::new("C", "hub")]
    );
}

#[tokio::test]
async fn test_private_to_absent_label_goes_nowhere() {
    let (bus, _registry) = start_hub();

    let (a, mut a_rx) = join(&bus, "A");
    let (_b, mut b_rx) = join(&bus, "B");
    wait_for_participants(&mut a_rx, &["B"]).await;
    wait_for_participants(&mut b_rx, &["A"]).await;

    assert_eq!(a.handle_input("/Z anyone").await.unwrap(), Sent::Private(None));
    assert_quiet(&mut a_rx).await;
    assert_quiet(&mut b_rx).await;

    // Malformed prefixes fall back to the room.
    assert_eq!(a.handle_input("/B").await.unwrap(), Sent::Broadcast(1));
    assert_eq!(
        next_message(&mut b_rx).await,
        ChatEvent::Broadcast {
            speaker: "A".into(),
            text: "/B".into(),
        }
    );
}

#[tokio::test]
async fn test_forged_presence_is_ignored() {
    let (bus, _registry) = start_hub();

    let (a, mut a_rx) = join(&bus, "A");
    let (b, mut b_rx) = join(&bus, "B");
    wait_for_participants(&mut a_rx, &["B"]).await;
    wait_for_participants(&mut b_rx, &["A"]).await;

    // B claims on A's subscription conversation that B left and a ghost arrived.
    let ghost = ParticipantId::new("ghost", "hub");
    let conversation = a.id().subscription_conversation();
    let recipients = [a.id().clone()];
    let left = Event::left(vec![b.id().clone()]);
    let left = Envelope::inform(b.id().clone(), conversation.clone(), left);
    let joined = Envelope::inform(b.id().clone(), conversation, Event::joined(vec![ghost]));
    bus.send(left, &recipients).unwrap();
    bus.send(joined, &recipients).unwrap();

    // A real message behind the forgeries shows they were consumed, not applied.
    b.handle_input("still here").await.unwrap();
    assert_eq!(
        next_event(&mut a_rx).await,
        ChatEvent::Broadcast {
            speaker: "B".into(),
            text: "still here".into(),
        }
    );
    assert_eq!(a.participant_labels().await, vec!["B".to_string()]);
}
