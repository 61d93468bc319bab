//! Client side of the presence protocol.
//!
//! ```text
//!   subscribe()
//!     │  Subscribe on "C-<name>" ──► registry
//!     ▼
//!   session dispatcher: "C-<name>" ──► PresenceHandler::handle()
//!     │  Joined / Left from the registry
//!     ▼
//!   AddressBook::apply() ──► ChatEvent::ParticipantsChanged
//! ```
//!
//! The registry is authoritative, so the client never resolves conflicts:
//! it applies deltas in the order they arrive on its session. Presence
//! events from anyone but the registry are discarded.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::address_book::AddressBook;
use crate::bus::{BusError, MessageBus};
use crate::protocol::{Envelope, ParticipantId, Payload, Performative};
use crate::session::ChatEvent;

/// Keeps a local [`AddressBook`] in step with the registry.
pub struct PresenceClient {
    id: ParticipantId,
    registry: ParticipantId,
    bus: Arc<dyn MessageBus>,
    book: Arc<RwLock<AddressBook>>,
    subscribed: bool,
}

impl PresenceClient {
    pub fn new(
        id: ParticipantId,
        registry: ParticipantId,
        bus: Arc<dyn MessageBus>,
        book: Arc<RwLock<AddressBook>>,
    ) -> Self {
        Self {
            id,
            registry,
            bus,
            book,
            subscribed: false,
        }
    }

    /// Handler for the envelopes arriving on our subscription conversation.
    pub fn handler(&self, events: mpsc::Sender<ChatEvent>) -> PresenceHandler {
        PresenceHandler {
            registry: self.registry.clone(),
            book: self.book.clone(),
            events,
        }
    }

    /// Ask the registry to add us to the room.
    pub fn subscribe(&mut self) -> Result<(), BusError> {
        if self.subscribed {
            return Ok(());
        }
        let conversation = self.id.subscription_conversation();
        let subscribe = Envelope::subscribe(self.id.clone(), conversation.clone());
        self.bus.send(subscribe, std::slice::from_ref(&self.registry))?;
        self.subscribed = true;

        log::info!("{} subscribed to {} on {conversation}", self.id, self.registry);
        Ok(())
    }

    /// Withdraw the subscription. Does nothing if we never subscribed.
    pub fn stop(&mut self) -> Result<(), BusError> {
        if !self.subscribed {
            return Ok(());
        }
        self.subscribed = false;

        let cancel = Envelope::cancel(self.id.clone(), self.id.subscription_conversation());
        self.bus.send(cancel, std::slice::from_ref(&self.registry))?;
        log::info!("{} left the room", self.id);
        Ok(())
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// Present participants in canonical order (an owned copy).
    pub async fn snapshot(&self) -> Vec<ParticipantId> {
        self.book.read().await.snapshot()
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn book(&self) -> Arc<RwLock<AddressBook>> {
        self.book.clone()
    }
}

/// Applies registry notifications to the address book.
pub struct PresenceHandler {
    registry: ParticipantId,
    book: Arc<RwLock<AddressBook>>,
    events: mpsc::Sender<ChatEvent>,
}

impl PresenceHandler {
    pub async fn handle(&self, envelope: Envelope) {
        if envelope.sender != self.registry {
            envelope.log_unexpected("presence");
            return;
        }

        match (envelope.performative, &envelope.payload) {
            (Performative::Inform, Payload::Event(event)) if event.is_presence() => {
                let labels = {
                    let mut book = self.book.write().await;
                    book.apply(event);
                    book.labels()
                };
                let _ = self.events.send(ChatEvent::ParticipantsChanged(labels)).await;
            }
            (Performative::Refuse, Payload::Reason(reason)) => {
                log::warn!("{} refused our subscription: {reason}", envelope.sender);
            }
            _ => envelope.log_unexpected("presence"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Inbox, LocalBus, MessageFilter};
    use crate::protocol::Event;

    fn setup(name: &str) -> (Arc<LocalBus>, Inbox, PresenceClient) {
        let bus = Arc::new(LocalBus::new("test"));
        let registry_inbox = bus.connect(bus.registry_id()).unwrap();
        let id = ParticipantId::new(name, "test");
        let client = PresenceClient::new(
            id,
            bus.registry_id(),
            bus.clone(),
            Arc::new(RwLock::new(AddressBook::new())),
        );
        (bus, registry_inbox, client)
    }

    #[tokio::test]
    async fn test_subscribe_sends_on_session_conversation() {
        let (_bus, registry_inbox, mut client) = setup("alice");
        client.subscribe().unwrap();

        let request = registry_inbox.receive(&MessageFilter::any()).unwrap();
        assert_eq!(request.performative, Performative::Subscribe);
        assert_eq!(request.conversation_id, "C-alice");
        assert!(client.is_subscribed());

        client.subscribe().unwrap();
        assert!(registry_inbox.is_empty());
    }

    #[tokio::test]
    async fn test_applies_joined_and_left() {
        let (bus, _registry_inbox, client) = setup("alice");
        let (tx, mut rx) = mpsc::channel(16);
        let handler = client.handler(tx);

        let registry = bus.registry_id();
        let bob = ParticipantId::new("bob", "test");
        let carol = ParticipantId::new("carol", "test");

        let joined = Event::joined(vec![carol.clone(), bob.clone()]);
        handler
            .handle(Envelope::inform(registry.clone(), "C-alice", joined))
            .await;
        assert_eq!(
            rx.try_recv().unwrap(),
            ChatEvent::ParticipantsChanged(vec!["bob".into(), "carol".into()])
        );

        handler
            .handle(Envelope::inform(registry, "C-alice", Event::left(vec![bob])))
            .await;
        assert_eq!(
            rx.try_recv().unwrap(),
            ChatEvent::ParticipantsChanged(vec!["carol".into()])
        );
        assert_eq!(client.snapshot().await, vec![carol]);
    }

    #[tokio::test]
    async fn test_presence_from_non_registry_is_discarded() {
        let (bus, _registry_inbox, client) = setup("alice");
        let (tx, mut rx) = mpsc::channel(16);
        let handler = client.handler(tx);

        let bob = ParticipantId::new("bob", "test");
        let joined = Event::joined(vec![bob.clone()]);
        handler
            .handle(Envelope::inform(bus.registry_id(), "C-alice", joined))
            .await;
        assert!(rx.try_recv().is_ok());

        let mallory = ParticipantId::new("mallory", "test");
        let forged_left = Event::left(vec![bob.clone()]);
        let forged_join = Event::joined(vec![mallory.clone()]);
        handler
            .handle(Envelope::inform(mallory.clone(), "C-alice", forged_left))
            .await;
        handler
            .handle(Envelope::inform(mallory.clone(), "C-alice", forged_join))
            .await;

        assert!(rx.try_recv().is_err());
        assert_eq!(client.snapshot().await, vec![bob]);
    }

    #[tokio::test]
    async fn test_unexpected_shapes_are_discarded() {
        let (bus, _registry_inbox, client) = setup("alice");
        let (tx, mut rx) = mpsc::channel(16);
        let handler = client.handler(tx);

        let registry = bus.registry_id();
        handler
            .handle(Envelope::subscribe(registry.clone(), "C-alice"))
            .await;
        handler
            .handle(Envelope::inform(registry.clone(), "C-alice", Event::spoken("not presence")))
            .await;
        handler
            .handle(Envelope::refuse(registry, "C-alice", "already subscribed"))
            .await;

        assert!(rx.try_recv().is_err());
        assert!(client.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_sends_cancel() {
        let (_bus, registry_inbox, mut client) = setup("alice");
        client.subscribe().unwrap();
        client.stop().unwrap();

        let filter = MessageFilter::any().with_performative(Performative::Cancel);
        let cancel = registry_inbox.receive(&filter).unwrap();
        assert_eq!(cancel.sender, *client.id());
        assert!(!client.is_subscribed());

        // Stopping twice sends nothing more.
        client.stop().unwrap();
        assert!(registry_inbox.receive(&filter).is_none());
    }
}
