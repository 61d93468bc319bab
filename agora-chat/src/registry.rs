//! Presence registry: the authoritative set of participants.
//!
//! ```text
//!  Subscribe(C)          incumbents A, B            newcomer C
//!  ───────────►  Registry ──► Joined{[C]} to A, B
//!                         └─► Joined{[A, B]} to C
//!
//!  Cancel(B) / liveness lost(B)
//!  ───────────►  Registry ──► Left{[B]} to A, C
//! ```
//!
//! [`PresenceRegistry`] is a pure state machine: every mutation returns the
//! [`Delivery`] list it implies, computed from the state immediately before
//! the mutation. [`RegistryAgent`] owns one registry and serializes every
//! subscribe, cancel and liveness-lost signal through a single loop, so no
//! two mutations ever interleave.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::{BusError, Inbox, LocalBus, MessageBus, MessageFilter};
use crate::protocol::{Envelope, Event, ParticipantId, Performative};

/// Why a subscription was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Refusal {
    #[error("{0} is already subscribed")]
    AlreadySubscribed(ParticipantId),
    #[error("Malformed subscription: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("{0} is not subscribed")]
    NotFound(ParticipantId),
}

/// Registry-side handle for one connected participant.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: ParticipantId,
    /// Conversation the participant listens to for presence events.
    pub conversation_id: String,
    pub since: Instant,
}

/// One event to push to one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub recipient: ParticipantId,
    pub conversation_id: String,
    pub event: Event,
}

/// Result of a successful subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// Everyone present before the newcomer, as a `Joined` event.
    pub welcome: Event,
    /// Notifications to send. Empty when the room was empty.
    pub deliveries: Vec<Delivery>,
}

/// Authoritative participant set.
#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
    participants: BTreeMap<ParticipantId, Subscription>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id`, listening for presence events on `conversation_id`.
    ///
    /// Incumbents get `Joined{[id]}`; the newcomer gets `Joined{everyone
    /// already present}`. Both come from the pre-insertion snapshot. An
    /// empty room produces no deliveries.
    pub fn subscribe(
        &mut self,
        id: ParticipantId,
        conversation_id: impl Into<String>,
    ) -> Result<Accepted, Refusal> {
        let conversation_id = conversation_id.into();
        id.validate()
            .map_err(|e| Refusal::Malformed(e.to_string()))?;
        if conversation_id.is_empty() {
            return Err(Refusal::Malformed("empty conversation id".into()));
        }
        if self.participants.contains_key(&id) {
            return Err(Refusal::AlreadySubscribed(id));
        }

        let present: Vec<ParticipantId> = self.participants.keys().cloned().collect();

        let mut deliveries = Vec::new();
        if !present.is_empty() {
            let arrival = Event::joined(vec![id.clone()]);
            deliveries.extend(self.participants.values().map(|sub| Delivery {
                recipient: sub.id.clone(),
                conversation_id: sub.conversation_id.clone(),
                event: arrival.clone(),
            }));
            deliveries.push(Delivery {
                recipient: id.clone(),
                conversation_id: conversation_id.clone(),
                event: Event::joined(present.clone()),
            });
        }

        self.participants.insert(
            id.clone(),
            Subscription {
                id,
                conversation_id,
                since: Instant::now(),
            },
        );

        Ok(Accepted {
            welcome: Event::joined(present),
            deliveries,
        })
    }

    /// Remove `id` and announce `Left{[id]}` to everyone remaining.
    pub fn deregister(&mut self, id: &ParticipantId) -> Result<Vec<Delivery>, RegistryError> {
        if self.participants.remove(id).is_none() {
            return Err(RegistryError::NotFound(id.clone()));
        }

        let departure = Event::left(vec![id.clone()]);
        Ok(self
            .participants
            .values()
            .map(|sub| Delivery {
                recipient: sub.id.clone(),
                conversation_id: sub.conversation_id.clone(),
                event: departure.clone(),
            })
            .collect())
    }

    /// A participant's connection vanished without an explicit leave.
    pub fn on_liveness_lost(&mut self, id: &ParticipantId) -> Result<Vec<Delivery>, RegistryError> {
        self.deregister(id)
    }

    /// Present participants in canonical order.
    pub fn participants(&self) -> Vec<ParticipantId> {
        self.participants.keys().cloned().collect()
    }

    pub fn subscription(&self, id: &ParticipantId) -> Option<&Subscription> {
        self.participants.get(id)
    }

    pub fn is_subscribed(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

/// Registry state plus the means to notify participants.
struct RegistryCore {
    id: ParticipantId,
    bus: Arc<dyn MessageBus>,
    registry: PresenceRegistry,
}

impl RegistryCore {
    fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope.performative {
            Performative::Subscribe => self.handle_subscribe(envelope),
            Performative::Cancel => self.handle_cancel(&envelope.sender),
            _ => self.handle_unexpected(envelope),
        }
    }

    fn handle_subscribe(&mut self, envelope: Envelope) {
        let Envelope {
            sender,
            conversation_id,
            ..
        } = envelope;

        match self.registry.subscribe(sender.clone(), conversation_id.clone()) {
            Ok(accepted) => {
                log::info!(
                    "{sender} joined the room ({} present)",
                    self.registry.len()
                );
                self.dispatch(accepted.deliveries);
            }
            Err(refusal) => {
                log::warn!("Refused subscription from {sender}: {refusal}");
                let reply = Envelope::refuse(self.id.clone(), conversation_id, refusal.to_string());
                if let Err(e) = self.bus.send(reply, &[sender.clone()]) {
                    log::warn!("Failed to send refusal to {sender}: {e}");
                }
            }
        }
    }

    fn handle_cancel(&mut self, id: &ParticipantId) {
        match self.registry.deregister(id) {
            Ok(deliveries) => {
                log::info!("{id} left the room ({} present)", self.registry.len());
                self.dispatch(deliveries);
            }
            Err(e) => log::debug!("Ignoring cancel: {e}"),
        }
    }

    fn on_liveness_lost(&mut self, id: &ParticipantId) {
        // Err means the participant already left through an explicit cancel.
        if let Ok(deliveries) = self.registry.on_liveness_lost(id) {
            log::info!("{id} lost connection ({} present)", self.registry.len());
            self.dispatch(deliveries);
        }
    }

    fn handle_unexpected(&self, envelope: Envelope) {
        envelope.log_unexpected("registry");

        if envelope.performative != Performative::NotUnderstood {
            let Envelope {
                sender,
                conversation_id,
                ..
            } = envelope;
            let reply = Envelope::not_understood(self.id.clone(), conversation_id);
            if let Err(e) = self.bus.send(reply, std::slice::from_ref(&sender)) {
                log::warn!("Failed to send not-understood to {sender}: {e}");
            }
        }
    }

    /// Best effort: a failed notification never undoes the mutation.
    fn dispatch(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            let envelope = Envelope::inform(
                self.id.clone(),
                delivery.conversation_id,
                delivery.event,
            );
            if let Err(e) = self.bus.send(envelope, std::slice::from_ref(&delivery.recipient)) {
                log::warn!("Failed to notify {}: {e}", delivery.recipient);
            }
        }
    }
}

/// Single owner of a [`PresenceRegistry`], driven by its bus inbox and a
/// liveness feed.
pub struct RegistryAgent {
    core: RegistryCore,
    inbox: Inbox,
    liveness: mpsc::UnboundedReceiver<ParticipantId>,
}

impl RegistryAgent {
    pub fn new(
        id: ParticipantId,
        bus: Arc<dyn MessageBus>,
        inbox: Inbox,
        liveness: mpsc::UnboundedReceiver<ParticipantId>,
    ) -> Self {
        Self {
            core: RegistryCore {
                id,
                bus,
                registry: PresenceRegistry::new(),
            },
            inbox,
            liveness,
        }
    }

    /// Connect a registry to `bus` under `manager@<platform>`, watching the
    /// bus for lost connections.
    pub fn attach(bus: &Arc<LocalBus>) -> Result<Self, BusError> {
        let id = bus.registry_id();
        let inbox = bus.connect(id.clone())?;
        let liveness = bus.watch_liveness();
        let bus: Arc<dyn MessageBus> = bus.clone();
        Ok(Self::new(id, bus, inbox, liveness))
    }

    pub fn id(&self) -> &ParticipantId {
        &self.core.id
    }

    /// Run the agent on its own task.
    pub fn spawn(self) -> JoinHandle<PresenceRegistry> {
        tokio::spawn(self.run())
    }

    /// Process requests until the inbox closes; returns the final state.
    pub async fn run(self) -> PresenceRegistry {
        let RegistryAgent {
            mut core,
            inbox,
            mut liveness,
        } = self;
        let filter = MessageFilter::any();
        let mut liveness_open = true;

        log::info!("Presence registry {} running", core.id);

        loop {
            tokio::select! {
                envelope = inbox.recv(&filter) => match envelope {
                    Some(envelope) => core.handle_envelope(envelope),
                    None => break,
                },
                lost = liveness.recv(), if liveness_open => match lost {
                    Some(id) => core.on_liveness_lost(&id),
                    None => liveness_open = false,
                },
            }
        }

        log::info!("Presence registry {} stopped", core.id);
        core.registry
    }
}
