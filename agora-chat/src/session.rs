//! One participant's chat session.
//!
//! A [`ChatSession`] wires a [`PresenceClient`] and a [`ChatChannel`] over a
//! shared [`AddressBook`], and surfaces everything the front end needs to
//! render as a stream of [`ChatEvent`]s.
//!
//! A single dispatcher task drains the session's inbox and routes each
//! envelope by conversation. Envelopes on no conversation of ours are
//! logged and dropped, so the inbox never holds stale traffic.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::address_book::AddressBook;
use crate::addressing::{self, Outgoing};
use crate::bus::{BusError, Inbox, LocalBus, MessageBus, MessageFilter};
use crate::chat::{ChatChannel, ChatHandler};
use crate::presence::{PresenceClient, PresenceHandler};
use crate::protocol::{ParticipantId, ROOM_CONVERSATION};

/// Events emitted to the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Present participants changed; labels in canonical order.
    ParticipantsChanged(Vec<String>),
    /// Room message (including our own echo).
    Broadcast { speaker: String, text: String },
    /// Private message body (including our own echo).
    Private { speaker: String, text: String },
}

/// Outcome of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    /// Broadcast handed to this many participants.
    Broadcast(usize),
    /// Private message target, or `None` if the label was unknown.
    Private(Option<ParticipantId>),
}

/// A running chat participant.
///
/// Dropping the session detaches it from the bus, which the registry
/// treats as a leave.
pub struct ChatSession {
    id: ParticipantId,
    bus: Arc<dyn MessageBus>,
    inbox: Inbox,
    presence: PresenceClient,
    chat: ChatChannel,
    book: Arc<RwLock<AddressBook>>,
    dispatcher: Option<JoinHandle<()>>,
    event_rx: Option<mpsc::Receiver<ChatEvent>>,
}

impl ChatSession {
    /// Start a session for `id`, whose envelopes arrive in `inbox`.
    ///
    /// The dispatcher is running before the subscription goes out, so
    /// nothing said after the welcome is missed.
    pub fn start(
        id: ParticipantId,
        registry: ParticipantId,
        bus: Arc<dyn MessageBus>,
        inbox: Inbox,
    ) -> Result<Self, BusError> {
        let (event_tx, event_rx) = mpsc::channel(256);
        let book = Arc::new(RwLock::new(AddressBook::new()));

        let chat = ChatChannel::new(id.clone(), bus.clone(), book.clone(), event_tx.clone());
        let presence = PresenceClient::new(id.clone(), registry, bus.clone(), book.clone());
        let dispatcher = tokio::spawn(dispatch(
            inbox.clone(),
            id.clone(),
            presence.handler(event_tx),
            chat.handler(),
        ));

        let mut session = Self {
            id,
            bus,
            inbox,
            presence,
            chat,
            book,
            dispatcher: Some(dispatcher),
            event_rx: Some(event_rx),
        };
        session.presence.subscribe()?;
        Ok(session)
    }

    /// Join the room on an in-process bus as `name@<platform>`.
    pub fn join_local(bus: &Arc<LocalBus>, name: &str) -> Result<Self, BusError> {
        let id = ParticipantId::new(name, bus.platform());
        let inbox = bus.connect(id.clone())?;
        let registry = bus.registry_id();
        let dyn_bus: Arc<dyn MessageBus> = bus.clone();
        Self::start(id, registry, dyn_bus, inbox)
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ChatEvent>> {
        self.event_rx.take()
    }

    /// Say `text` to the whole room.
    pub async fn handle_spoken(&self, text: &str) -> Result<usize, BusError> {
        self.chat.send_broadcast(text).await
    }

    /// Send a `/<label> <body>` message to its addressee.
    ///
    /// Text without a well-formed prefix, or naming nobody present, is
    /// dropped and yields `Ok(None)`.
    pub async fn handle_private(&self, text: &str) -> Result<Option<ParticipantId>, BusError> {
        match addressing::parse(text) {
            Some(msg) => self.chat.send_private(text, msg.target).await,
            None => {
                log::debug!("Malformed private message {text:?}; dropping");
                Ok(None)
            }
        }
    }

    /// Route one line of user input.
    pub async fn handle_input(&self, text: &str) -> Result<Sent, BusError> {
        match addressing::route(text) {
            Outgoing::Private(msg) => Ok(Sent::Private(
                self.chat.send_private(text, msg.target).await?,
            )),
            Outgoing::Broadcast(text) => Ok(Sent::Broadcast(self.chat.send_broadcast(text).await?)),
        }
    }

    /// Labels of the participants present, in canonical order.
    pub async fn participant_labels(&self) -> Vec<String> {
        self.book.read().await.labels()
    }

    /// `name@address` of the participants present, in canonical order.
    pub async fn participant_full_ids(&self) -> Vec<String> {
        self.book.read().await.full_ids()
    }

    /// Leave the room explicitly and release our name on the bus.
    pub fn leave(mut self) -> Result<(), BusError> {
        let cancelled = self.presence.stop();
        self.shut_down();
        cancelled
    }

    fn shut_down(&mut self) {
        let Some(dispatcher) = self.dispatcher.take() else {
            return;
        };
        dispatcher.abort();
        // A closed inbox means the bus already let go of us, and the name
        // may belong to someone else by now.
        if !self.inbox.is_closed() {
            self.bus.detach(&self.id);
        }
        log::debug!("{} session shut down", self.id);
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.shut_down();
    }
}

async fn dispatch(inbox: Inbox, id: ParticipantId, presence: PresenceHandler, chat: ChatHandler) {
    let any = MessageFilter::any();
    let subscription = id.subscription_conversation();
    let private = id.private_conversation();

    while let Some(envelope) = inbox.recv(&any).await {
        let conversation = envelope.conversation_id.as_str();
        if conversation == subscription {
            presence.handle(envelope).await;
        } else if conversation == ROOM_CONVERSATION {
            chat.on_room(envelope).await;
        } else if conversation == private {
            chat.on_private(envelope).await;
        } else {
            envelope.log_unexpected("session");
        }
    }

    log::debug!("{id} dispatcher stopped");
}
