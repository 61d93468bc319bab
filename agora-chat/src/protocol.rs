//! Protocol vocabulary shared by the registry, the clients and the relay.
//!
//! Every message on the bus is an [`Envelope`]: a performative (the shape of
//! the message), the sender, a conversation tag used for pattern-matched
//! receive, and a payload.
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────────┬──────────────────────┐
//! │ performative │ sender       │ conversation_id │ payload              │
//! │ Subscribe    │ name@address │ "C-alice"       │ Empty                │
//! │ Inform       │ manager@...  │ "C-alice"       │ Event(Joined{..})    │
//! │ Inform       │ bob@...      │ "__chat__"      │ Event(Spoken{..})    │
//! │ Refuse       │ manager@...  │ "C-alice"       │ Reason("...")        │
//! └──────────────┴──────────────┴─────────────────┴──────────────────────┘
//! ```
//!
//! Over WebSocket, envelopes travel inside a [`Frame`], bincode-encoded.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label of the presence registry on every platform.
pub const REGISTRY_NAME: &str = "manager";

/// Conversation tag of the shared room.
pub const ROOM_CONVERSATION: &str = "__chat__";

/// Prefix of a participant's subscription conversation.
const SUBSCRIPTION_PREFIX: &str = "C-";

/// Identity of a connected participant.
///
/// `name` is the human-readable label, `address` the platform the
/// participant is attached to. Ordering is `(name, address)` so that every
/// party iterates the same membership in the same order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId {
    pub name: String,
    pub address: String,
}

impl ParticipantId {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// The registry living on `address`.
    pub fn registry(address: impl Into<String>) -> Self {
        Self::new(REGISTRY_NAME, address)
    }

    /// Human-readable label (what users type after `/`).
    pub fn label(&self) -> &str {
        &self.name
    }

    /// `name@address`.
    pub fn full_id(&self) -> String {
        format!("{}@{}", self.name, self.address)
    }

    /// Conversation tag the registry uses to reach this participant.
    pub fn subscription_conversation(&self) -> String {
        format!("{SUBSCRIPTION_PREFIX}{}", self.name)
    }

    /// Conversation tag private messages to this participant travel on.
    pub fn private_conversation(&self) -> String {
        self.name.clone()
    }

    /// Check that this id can take part in the chat.
    ///
    /// Names double as conversation tags, so they cannot contain the
    /// addressing separators and cannot shadow the reserved tags.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let bad_char = |c: char| c.is_whitespace() || c == '/' || c == '@';

        if self.name.is_empty() {
            return Err(ProtocolError::MalformedId("empty name".into()));
        }
        if self.name.chars().any(bad_char) {
            return Err(ProtocolError::MalformedId(format!(
                "name {:?} contains whitespace, '/' or '@'",
                self.name
            )));
        }
        if self.name == REGISTRY_NAME || self.name == ROOM_CONVERSATION {
            return Err(ProtocolError::MalformedId(format!(
                "name {:?} is reserved",
                self.name
            )));
        }
        if self.address.is_empty() || self.address.chars().any(char::is_whitespace) {
            return Err(ProtocolError::MalformedId(format!(
                "address {:?} is empty or contains whitespace",
                self.address
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

/// Presence and chat events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Participants that arrived (or, for a newcomer, everyone already present).
    Joined { who: Vec<ParticipantId> },
    /// Participants that departed.
    Left { who: Vec<ParticipantId> },
    /// Chat text.
    Spoken { text: String },
}

impl Event {
    pub fn joined(who: Vec<ParticipantId>) -> Self {
        Event::Joined { who }
    }

    pub fn left(who: Vec<ParticipantId>) -> Self {
        Event::Left { who }
    }

    pub fn spoken(text: impl Into<String>) -> Self {
        Event::Spoken { text: text.into() }
    }

    /// Whether this is a presence delta (`Joined` or `Left`).
    pub fn is_presence(&self) -> bool {
        matches!(self, Event::Joined { .. } | Event::Left { .. })
    }
}

/// The communicative act of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Performative {
    /// Ask the registry for presence notifications.
    Subscribe,
    /// Withdraw a subscription (explicit leave).
    Cancel,
    /// Deliver an event.
    Inform,
    /// Registry declined a subscription.
    Refuse,
    /// Reply to a message whose shape the receiver does not handle.
    NotUnderstood,
}

/// Envelope payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Empty,
    Event(Event),
    Reason(String),
}

/// A message on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub performative: Performative,
    pub sender: ParticipantId,
    pub conversation_id: String,
    pub payload: Payload,
}

impl Envelope {
    pub fn subscribe(sender: ParticipantId, conversation_id: impl Into<String>) -> Self {
        Self {
            performative: Performative::Subscribe,
            sender,
            conversation_id: conversation_id.into(),
            payload: Payload::Empty,
        }
    }

    pub fn cancel(sender: ParticipantId, conversation_id: impl Into<String>) -> Self {
        Self {
            performative: Performative::Cancel,
            sender,
            conversation_id: conversation_id.into(),
            payload: Payload::Empty,
        }
    }

    pub fn inform(sender: ParticipantId, conversation_id: impl Into<String>, event: Event) -> Self {
        Self {
            performative: Performative::Inform,
            sender,
            conversation_id: conversation_id.into(),
            payload: Payload::Event(event),
        }
    }

    pub fn refuse(
        sender: ParticipantId,
        conversation_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            performative: Performative::Refuse,
            sender,
            conversation_id: conversation_id.into(),
            payload: Payload::Reason(reason.into()),
        }
    }

    pub fn not_understood(sender: ParticipantId, conversation_id: impl Into<String>) -> Self {
        Self {
            performative: Performative::NotUnderstood,
            sender,
            conversation_id: conversation_id.into(),
            payload: Payload::Empty,
        }
    }

    /// The carried event, if any.
    pub fn event(&self) -> Option<&Event> {
        match &self.payload {
            Payload::Event(event) => Some(event),
            _ => None,
        }
    }

    /// Warn about an envelope `listener` does not handle. Never fatal.
    pub fn log_unexpected(&self, listener: &str) {
        log::warn!(
            "{listener}: unexpected {:?} received from {}",
            self.performative,
            self.sender
        );
        log::warn!("Content is: {}", self.describe_payload());
    }

    /// Short rendering of the payload for log lines.
    pub fn describe_payload(&self) -> String {
        match &self.payload {
            Payload::Empty => "<empty>".to_string(),
            Payload::Event(event) => format!("{event:?}"),
            Payload::Reason(reason) => format!("reason: {reason}"),
        }
    }
}

/// WebSocket frame between a relay client and the relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Client → server, first frame: the label to connect as.
    Hello { name: String },
    /// Server → client: handshake accepted, here is your full id.
    Welcome { id: ParticipantId },
    /// Server → client: handshake refused.
    Rejected { reason: String },
    /// Client → server: route an envelope to recipients.
    Send {
        envelope: Envelope,
        recipients: Vec<ParticipantId>,
    },
    /// Server → client: an envelope addressed to this client.
    Deliver { envelope: Envelope },
}

impl Frame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Malformed participant id: {0}")]
    MalformedId(String),
    #[error("Handshake rejected: {0}")]
    Rejected(String),
    #[error("Unexpected frame during {0}")]
    UnexpectedFrame(&'static str),
    #[error("Connection closed")]
    ConnectionClosed,
}
