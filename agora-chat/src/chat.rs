//! Broadcast and private text relay.
//!
//! Broadcasts travel on the shared room conversation to every id in the
//! current address book. Private messages travel on the addressee's own
//! conversation and carry the full `/<label> <body>` text; the receiver
//! strips the prefix.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::address_book::AddressBook;
use crate::addressing;
use crate::bus::{BusError, MessageBus};
use crate::protocol::{Envelope, Event, ParticipantId, Performative, ROOM_CONVERSATION};
use crate::session::ChatEvent;

/// A chat payload for the duration of one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingMessage {
    Broadcast {
        sender: ParticipantId,
        body: String,
    },
    Private {
        sender: ParticipantId,
        target: ParticipantId,
        /// Full `/<label> <body>` text as typed.
        body: String,
    },
}

impl PendingMessage {
    pub fn conversation_id(&self) -> String {
        match self {
            PendingMessage::Broadcast { .. } => ROOM_CONVERSATION.to_string(),
            PendingMessage::Private { target, .. } => target.private_conversation(),
        }
    }

    pub fn into_envelope(self) -> Envelope {
        let conversation_id = self.conversation_id();
        match self {
            PendingMessage::Broadcast { sender, body }
            | PendingMessage::Private { sender, body, .. } => {
                Envelope::inform(sender, conversation_id, Event::spoken(body))
            }
        }
    }
}

/// Sends chat text for one participant.
pub struct ChatChannel {
    id: ParticipantId,
    bus: Arc<dyn MessageBus>,
    book: Arc<RwLock<AddressBook>>,
    events: mpsc::Sender<ChatEvent>,
}

impl ChatChannel {
    pub fn new(
        id: ParticipantId,
        bus: Arc<dyn MessageBus>,
        book: Arc<RwLock<AddressBook>>,
        events: mpsc::Sender<ChatEvent>,
    ) -> Self {
        Self {
            id,
            bus,
            book,
            events,
        }
    }

    /// Handler for incoming room and private envelopes.
    pub fn handler(&self) -> ChatHandler {
        ChatHandler {
            events: self.events.clone(),
        }
    }

    /// Say `text` to everyone present.
    ///
    /// The local echo is emitted before dispatch. Returns how many
    /// participants the message was handed to.
    pub async fn send_broadcast(&self, text: &str) -> Result<usize, BusError> {
        let recipients = self.book.read().await.snapshot();

        let _ = self
            .events
            .send(ChatEvent::Broadcast {
                speaker: self.id.label().to_string(),
                text: text.to_string(),
            })
            .await;

        if recipients.is_empty() {
            return Ok(0);
        }

        let pending = PendingMessage::Broadcast {
            sender: self.id.clone(),
            body: text.to_string(),
        };
        self.bus.send(pending.into_envelope(), &recipients)
    }

    /// Send the prefixed `text` to the participant labelled `target_label`.
    ///
    /// An unknown label drops the message silently and returns `Ok(None)`.
    pub async fn send_private(
        &self,
        text: &str,
        target_label: &str,
    ) -> Result<Option<ParticipantId>, BusError> {
        let target = self.book.read().await.find_by_label(target_label).cloned();
        let Some(target) = target else {
            log::debug!("No participant labelled {target_label:?}; dropping private message");
            return Ok(None);
        };

        let _ = self
            .events
            .send(ChatEvent::Private {
                speaker: self.id.label().to_string(),
                text: addressing::body(text).to_string(),
            })
            .await;

        let pending = PendingMessage::Private {
            sender: self.id.clone(),
            target: target.clone(),
            body: text.to_string(),
        };
        self.bus
            .send(pending.into_envelope(), std::slice::from_ref(&target))?;
        Ok(Some(target))
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }
}

/// Turns incoming `Spoken` envelopes into [`ChatEvent`]s.
pub struct ChatHandler {
    events: mpsc::Sender<ChatEvent>,
}

impl ChatHandler {
    /// A message on the room conversation.
    pub async fn on_room(&self, envelope: Envelope) {
        let Some(text) = spoken_text(&envelope) else {
            envelope.log_unexpected("room");
            return;
        };
        let event = ChatEvent::Broadcast {
            speaker: envelope.sender.label().to_string(),
            text: text.to_string(),
        };
        let _ = self.events.send(event).await;
    }

    /// A message on our private conversation; the `/<label>` prefix is
    /// stripped.
    pub async fn on_private(&self, envelope: Envelope) {
        let Some(text) = spoken_text(&envelope) else {
            envelope.log_unexpected("private");
            return;
        };
        let event = ChatEvent::Private {
            speaker: envelope.sender.label().to_string(),
            text: addressing::body(text).to_string(),
        };
        let _ = self.events.send(event).await;
    }
}

fn spoken_text(envelope: &Envelope) -> Option<&str> {
    match (envelope.performative, envelope.event()) {
        (Performative::Inform, Some(Event::Spoken { text })) => Some(text.as_str()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Inbox, LocalBus, MessageFilter};

    struct Fixture {
        bus: Arc<LocalBus>,
        channel: ChatChannel,
        rx: mpsc::Receiver<ChatEvent>,
        peers: Vec<(ParticipantId, Inbox)>,
    }

    /// A channel for `me` whose address book already lists `peers`.
    fn fixture(me: &str, peers: &[&str]) -> Fixture {
        let bus = Arc::new(LocalBus::new("test"));
        let id = ParticipantId::new(me, "test");

        let mut book = AddressBook::new();
        let peers: Vec<(ParticipantId, Inbox)> = peers
            .iter()
            .map(|name| {
                let peer = ParticipantId::new(*name, "test");
                book.insert(peer.clone());
                let inbox = bus.connect(peer.clone()).unwrap();
                (peer, inbox)
            })
            .collect();

        let (tx, rx) = mpsc::channel(16);
        let channel = ChatChannel::new(id, bus.clone(), Arc::new(RwLock::new(book)), tx);
        Fixture {
            bus,
            channel,
            rx,
            peers,
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_and_echoes_first() {
        let mut f = fixture("bob", &["alice", "carol"]);

        let sent = f.channel.send_broadcast("hi").await.unwrap();
        assert_eq!(sent, 2);

        // Local echo was queued before dispatch returned.
        assert_eq!(
            f.rx.try_recv().unwrap(),
            ChatEvent::Broadcast {
                speaker: "bob".into(),
                text: "hi".into(),
            }
        );
        for (_, inbox) in &f.peers {
            let env = inbox.receive(&MessageFilter::conversation(ROOM_CONVERSATION)).unwrap();
            assert_eq!(env.event(), Some(&Event::spoken("hi")));
            assert_eq!(env.sender.label(), "bob");
        }
    }

    #[tokio::test]
    async fn test_broadcast_into_empty_room_only_echoes() {
        let mut f = fixture("bob", &[]);
        assert_eq!(f.channel.send_broadcast("anyone?").await.unwrap(), 0);
        assert!(f.rx.try_recv().is_ok());
        assert_eq!(f.bus.stats().envelopes_delivered, 0);
    }

    #[tokio::test]
    async fn test_private_goes_to_target_only() {
        let mut f = fixture("alice", &["bob", "carol"]);

        let target = f.channel.send_private("/carol secret", "carol").await.unwrap();
        assert_eq!(target, Some(ParticipantId::new("carol", "test")));
        assert_eq!(
            f.rx.try_recv().unwrap(),
            ChatEvent::Private {
                speaker: "alice".into(),
                text: "secret".into(),
            }
        );

        let (_, bob_inbox) = &f.peers[0];
        let (_, carol_inbox) = &f.peers[1];
        assert!(bob_inbox.is_empty());
        let env = carol_inbox.receive(&MessageFilter::conversation("carol")).unwrap();
        assert_eq!(env.event(), Some(&Event::spoken("/carol secret")));
    }

    #[tokio::test]
    async fn test_private_to_unknown_label_is_dropped() {
        let mut f = fixture("alice", &["bob"]);

        let target = f.channel.send_private("/zed hello", "zed").await.unwrap();
        assert!(target.is_none());
        assert!(f.rx.try_recv().is_err());
        assert!(f.peers[0].1.is_empty());
    }

    #[tokio::test]
    async fn test_receiving_strips_private_prefix() {
        let mut f = fixture("carol", &["alice"]);
        let handler = f.channel.handler();
        let alice = f.peers[0].0.clone();

        let private = Envelope::inform(alice.clone(), "carol", Event::spoken("/carol secret"));
        handler.on_private(private).await;
        assert_eq!(
            f.rx.try_recv().unwrap(),
            ChatEvent::Private {
                speaker: "alice".into(),
                text: "secret".into(),
            }
        );

        let room = Envelope::inform(alice, ROOM_CONVERSATION, Event::spoken("/carol not private"));
        handler.on_room(room).await;
        assert_eq!(
            f.rx.try_recv().unwrap(),
            ChatEvent::Broadcast {
                speaker: "alice".into(),
                text: "/carol not private".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_non_inform_on_room_is_discarded() {
        let mut f = fixture("carol", &["alice"]);
        let handler = f.channel.handler();
        let alice = f.peers[0].0.clone();

        handler
            .on_room(Envelope::subscribe(alice.clone(), ROOM_CONVERSATION))
            .await;
        handler
            .on_private(Envelope::inform(alice.clone(), "carol", Event::left(vec![alice.clone()])))
            .await;
        assert!(f.rx.try_recv().is_err());

        handler
            .on_room(Envelope::inform(alice, ROOM_CONVERSATION, Event::spoken("still here")))
            .await;
        assert_eq!(
            f.rx.try_recv().unwrap(),
            ChatEvent::Broadcast {
                speaker: "alice".into(),
                text: "still here".into(),
            }
        );
    }

    #[test]
    fn test_pending_message_routing() {
        let alice = ParticipantId::new("alice", "test");
        let carol = ParticipantId::new("carol", "test");

        let broadcast = PendingMessage::Broadcast {
            sender: alice.clone(),
            body: "hi".into(),
        };
        assert_eq!(broadcast.conversation_id(), ROOM_CONVERSATION);

        let private = PendingMessage::Private {
            sender: alice,
            target: carol,
            body: "/carol hi".into(),
        };
        let env = private.into_envelope();
        assert_eq!(env.conversation_id, "carol");
        assert_eq!(env.event(), Some(&Event::spoken("/carol hi")));
    }
}
