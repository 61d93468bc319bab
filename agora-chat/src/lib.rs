//! # agora-chat — Presence-tracked chat room
//!
//! A single chat room with an authoritative presence registry. Each
//! participant keeps a local address book, kept in step with the registry,
//! and uses it to broadcast to everyone or to address one participant with
//! the `/<label> <body>` convention.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   Subscribe / Cancel    ┌──────────────────┐
//! │ ChatSession  │ ──────────────────────► │ RegistryAgent    │
//! │  Presence    │ ◄────────────────────── │  PresenceRegistry│
//! │  ChatChannel │   Inform Joined / Left  └────────┬─────────┘
//! └──────┬───────┘                                  │ liveness lost
//!        │ Inform Spoken ("__chat__" / "<label>")   │
//!        ▼                                          │
//! ┌─────────────────────────────────────────────────┴──┐
//! │ MessageBus: LocalBus (in-process) or RemoteBus ───► RelayServer (WebSocket)
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Ids, events, envelopes and the bincode WebSocket frame
//! - [`address_book`] — Ordered set of present participants
//! - [`addressing`] — `/<label> <body>` private-message convention
//! - [`bus`] — Message bus, pattern-matched inboxes, in-process hub
//! - [`registry`] — Authoritative presence registry and its agent
//! - [`presence`] — Client side of the presence protocol
//! - [`chat`] — Broadcast and private relay
//! - [`session`] — One participant's session and its event stream
//! - [`server`] — WebSocket relay server
//! - [`client`] — WebSocket bus client

pub mod protocol;
pub mod address_book;
pub mod addressing;
pub mod bus;
pub mod registry;
pub mod presence;
pub mod chat;
pub mod session;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    Envelope, Event, Frame, ParticipantId, Payload, Performative, ProtocolError,
    REGISTRY_NAME, ROOM_CONVERSATION,
};
pub use address_book::AddressBook;
pub use addressing::{Outgoing, PrivateMessage};
pub use bus::{BusError, BusStats, Inbox, LocalBus, MessageBus, MessageFilter};
pub use registry::{
    Accepted, Delivery, PresenceRegistry, Refusal, RegistryAgent, RegistryError, Subscription,
};
pub use presence::{PresenceClient, PresenceHandler};
pub use chat::{ChatChannel, ChatHandler, PendingMessage};
pub use session::{ChatEvent, ChatSession, Sent};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use client::{ConnectionState, RemoteBus};
