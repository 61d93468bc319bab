//! Local view of who is present.
//!
//! Membership is rebuilt from the registry's `Joined`/`Left` stream.
//! Applying an event is idempotent per id, so the order in which
//! independent streams are processed does not matter.

use std::collections::BTreeSet;

use crate::protocol::{Event, ParticipantId};

/// Ordered set of present participants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressBook {
    members: BTreeSet<ParticipantId>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `id` was not present before.
    pub fn insert(&mut self, id: ParticipantId) -> bool {
        self.members.insert(id)
    }

    /// Returns `true` if `id` was present.
    pub fn remove(&mut self, id: &ParticipantId) -> bool {
        self.members.remove(id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Apply a presence delta. Returns whether membership changed.
    ///
    /// `Spoken` carries no presence information and is ignored.
    pub fn apply(&mut self, event: &Event) -> bool {
        match event {
            Event::Joined { who } => who
                .iter()
                .fold(false, |changed, id| self.insert(id.clone()) || changed),
            Event::Left { who } => who
                .iter()
                .fold(false, |changed, id| self.remove(id) || changed),
            Event::Spoken { .. } => false,
        }
    }

    /// Owned copy of the membership in canonical order.
    pub fn snapshot(&self) -> Vec<ParticipantId> {
        self.members.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParticipantId> {
        self.members.iter()
    }

    /// Display labels in canonical order.
    pub fn labels(&self) -> Vec<String> {
        self.members.iter().map(|id| id.label().to_string()).collect()
    }

    /// `name@address` strings in canonical order.
    pub fn full_ids(&self) -> Vec<String> {
        self.members.iter().map(ParticipantId::full_id).collect()
    }

    /// First member (canonical order) whose label is `label`.
    pub fn find_by_label(&self, label: &str) -> Option<&ParticipantId> {
        self.members.iter().find(|id| id.label() == label)
    }
}
