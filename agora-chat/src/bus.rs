//! Point-to-point message bus with pattern-matched receive.
//!
//! ```text
//!   MessageBus::send(envelope, [a, b])
//!          │
//!          ├──► Inbox(a) ──► recv(any) ──► session dispatcher
//!          │                                ├─ "C-a"      presence
//!          │                                ├─ "__chat__" room
//!          │                                └─ "a"        private
//!          └──► Inbox(b) ...
//! ```
//!
//! Each participant owns one [`Inbox`]. A receiver only takes the envelopes
//! its [`MessageFilter`] matches and suspends until one arrives; whatever
//! no filter matches stays queued, so every inbox needs one receiver that
//! takes everything.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use thiserror::Error;
use tokio::sync::{mpsc, Notify};

use crate::protocol::{Envelope, ParticipantId, Performative};

/// Bus errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("{0} is already connected")]
    AlreadyConnected(ParticipantId),
    #[error("Bus is full ({0} participants)")]
    Full(usize),
    #[error("Bus connection closed")]
    Closed,
    #[error("Failed to encode envelope: {0}")]
    Encode(String),
}

/// Asynchronous, at-most-once delivery of envelopes to addressed recipients.
///
/// `send` never waits for delivery; it returns how many recipients the
/// envelope was handed to.
pub trait MessageBus: Send + Sync {
    fn send(&self, envelope: Envelope, recipients: &[ParticipantId]) -> Result<usize, BusError>;

    /// Release `id`'s attachment, as when its session ends. Idempotent.
    fn detach(&self, id: &ParticipantId);
}

/// Which envelopes a receive call is interested in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    conversation_id: Option<String>,
    performative: Option<Performative>,
}

impl MessageFilter {
    /// Matches everything.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn conversation(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            performative: None,
        }
    }

    pub fn with_performative(mut self, performative: Performative) -> Self {
        self.performative = Some(performative);
        self
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        self.conversation_id
            .as_deref()
            .map_or(true, |c| c == envelope.conversation_id)
            && self.performative.map_or(true, |p| p == envelope.performative)
    }
}

struct InboxInner {
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    closed: AtomicBool,
}

/// A participant's mailbox. Cloning shares the same queue.
#[derive(Clone)]
pub struct Inbox {
    inner: Arc<InboxInner>,
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Inbox {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InboxInner {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue an envelope. Returns `false` if the inbox is closed.
    pub fn push(&self, envelope: Envelope) -> bool {
        if self.is_closed() {
            return false;
        }
        self.queue().push_back(envelope);
        self.inner.notify.notify_waiters();
        true
    }

    /// Take the oldest envelope matching `filter`, without waiting.
    pub fn receive(&self, filter: &MessageFilter) -> Option<Envelope> {
        let mut queue = self.queue();
        let pos = queue.iter().position(|env| filter.matches(env))?;
        queue.remove(pos)
    }

    /// Wait for the oldest envelope matching `filter`.
    ///
    /// Returns `None` once the inbox is closed and holds no match.
    pub async fn recv(&self, filter: &MessageFilter) -> Option<Envelope> {
        loop {
            // Register interest before checking, so a push between the
            // check and the await is not lost.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(envelope) = self.receive(filter) {
                return Some(envelope);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Stop accepting envelopes and wake every waiting listener.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of envelopes waiting (any conversation).
    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }
}

/// Statistics for monitoring the bus.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub envelopes_delivered: u64,
    pub envelopes_dropped: u64,
    pub connected: usize,
}

/// In-process bus: one inbox per connected participant.
///
/// Also acts as the liveness feed: [`LocalBus::disconnect`] reports the id
/// to every [`LocalBus::watch_liveness`] receiver.
pub struct LocalBus {
    platform: String,
    inboxes: RwLock<HashMap<ParticipantId, Inbox>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<ParticipantId>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl LocalBus {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            inboxes: RwLock::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Platform name used as the address of every local participant.
    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Id of the registry on this platform.
    pub fn registry_id(&self) -> ParticipantId {
        ParticipantId::registry(self.platform.clone())
    }

    /// Attach `id` to the bus and return its inbox.
    pub fn connect(&self, id: ParticipantId) -> Result<Inbox, BusError> {
        self.connect_bounded(id, usize::MAX)
    }

    /// Attach `id` unless `max_participants` are already connected.
    ///
    /// The registry does not count as a participant. The check and the
    /// insert happen under one lock.
    pub fn connect_bounded(
        &self,
        id: ParticipantId,
        max_participants: usize,
    ) -> Result<Inbox, BusError> {
        let mut inboxes = self.inboxes.write().unwrap_or_else(|p| p.into_inner());
        if inboxes.contains_key(&id) {
            return Err(BusError::AlreadyConnected(id));
        }
        let registry = self.registry_id();
        let participants = inboxes.keys().filter(|key| **key != registry).count();
        if id != registry && participants >= max_participants {
            return Err(BusError::Full(max_participants));
        }
        let inbox = Inbox::new();
        log::debug!("{id} connected to bus {}", self.platform);
        inboxes.insert(id, inbox.clone());
        Ok(inbox)
    }

    /// Detach `id`, close its inbox and report it on the liveness feed.
    ///
    /// Returns `false` if `id` was not connected.
    pub fn disconnect(&self, id: &ParticipantId) -> bool {
        let removed = self
            .inboxes
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
        let Some(inbox) = removed else {
            return false;
        };
        inbox.close();
        log::debug!("{id} disconnected from bus {}", self.platform);

        let mut watchers = self.watchers.lock().unwrap_or_else(|p| p.into_inner());
        watchers.retain(|tx| tx.send(id.clone()).is_ok());
        true
    }

    /// Subscribe to liveness-lost notifications.
    pub fn watch_liveness(&self) -> mpsc::UnboundedReceiver<ParticipantId> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(tx);
        rx
    }

    pub fn is_connected(&self, id: &ParticipantId) -> bool {
        self.inboxes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(id)
    }

    pub fn connected(&self) -> usize {
        self.inboxes.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            envelopes_delivered: self.delivered.load(Ordering::Relaxed),
            envelopes_dropped: self.dropped.load(Ordering::Relaxed),
            connected: self.connected(),
        }
    }
}

impl MessageBus for LocalBus {
    fn send(&self, envelope: Envelope, recipients: &[ParticipantId]) -> Result<usize, BusError> {
        let inboxes = self.inboxes.read().unwrap_or_else(|p| p.into_inner());
        let mut delivered = 0;
        for recipient in recipients {
            match inboxes.get(recipient) {
                Some(inbox) if inbox.push(envelope.clone()) => delivered += 1,
                _ => {
                    log::debug!(
                        "Dropping {:?} from {} for unknown recipient {recipient}",
                        envelope.performative,
                        envelope.sender
                    );
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        Ok(delivered)
    }

    fn detach(&self, id: &ParticipantId) {
        self.disconnect(id);
    }
}
