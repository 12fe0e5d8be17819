//! Event kinds and event sets.
//!
//! The event taxonomy belongs to the privileged service. The client only needs
//! numeric identifiers so it can express subscriptions and mute rules, so
//! [`EventType`] is a thin wrapper around the raw id with a few well-known
//! constants for convenience.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Numeric identifier of a security event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(pub u32);

impl EventType {
    pub const AUTH_EXEC: Self = Self(0);
    pub const AUTH_OPEN: Self = Self(1);
    pub const AUTH_KEXTLOAD: Self = Self(2);
    pub const AUTH_MMAP: Self = Self(3);
    pub const AUTH_MPROTECT: Self = Self(4);
    pub const AUTH_MOUNT: Self = Self(5);
    pub const AUTH_RENAME: Self = Self(6);
    pub const AUTH_SIGNAL: Self = Self(7);
    pub const AUTH_UNLINK: Self = Self(8);
    pub const NOTIFY_EXEC: Self = Self(9);
    pub const NOTIFY_OPEN: Self = Self(10);
    pub const NOTIFY_FORK: Self = Self(11);
    pub const NOTIFY_CLOSE: Self = Self(12);
    pub const NOTIFY_CREATE: Self = Self(13);
    pub const NOTIFY_EXCHANGEDATA: Self = Self(14);
    pub const NOTIFY_EXIT: Self = Self(15);

    /// Raw numeric id.
    #[must_use]
    pub fn id(self) -> u32 {
        self.0
    }
}

impl From<u32> for EventType {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event#{}", self.0)
    }
}

const WORD_BITS: u32 = 64;

/// An event id above [`EventSet::MAX_ID`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event id {0} exceeds the maximum of {max}", max = EventSet::MAX_ID)]
pub struct EventIdOutOfRange(pub u32);

/// A set of event kinds stored as a bitmask.
///
/// Ids are bounded by [`MAX_ID`](Self::MAX_ID), which keeps the mask at 16
/// words at most. On the wire an event set is a sorted array of numeric ids.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u32>", into = "Vec<u32>")]
pub struct EventSet {
    words: Vec<u64>,
}

impl EventSet {
    /// Largest event id a set can hold.
    pub const MAX_ID: u32 = 1023;

    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from raw ids, rejecting the first id above
    /// [`MAX_ID`](Self::MAX_ID).
    ///
    /// # Errors
    ///
    /// Returns [`EventIdOutOfRange`] with the offending id.
    pub fn try_from_ids(ids: &[u32]) -> Result<Self, EventIdOutOfRange> {
        let mut set = Self::new();
        for &id in ids {
            set.try_insert(EventType(id))?;
        }
        Ok(set)
    }

    /// Returns `true` if the event was not already present.
    ///
    /// # Errors
    ///
    /// Returns [`EventIdOutOfRange`] for ids above [`MAX_ID`](Self::MAX_ID).
    pub fn try_insert(&mut self, event: EventType) -> Result<bool, EventIdOutOfRange> {
        if event.0 > Self::MAX_ID {
            return Err(EventIdOutOfRange(event.0));
        }
        Ok(self.insert_in_range(event))
    }

    /// Returns `true` if the event was not already present. Ids above
    /// [`MAX_ID`](Self::MAX_ID) are not stored.
    pub fn insert(&mut self, event: EventType) -> bool {
        match self.try_insert(event) {
            Ok(added) => added,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring out-of-range event id");
                false
            }
        }
    }

    fn insert_in_range(&mut self, event: EventType) -> bool {
        let (word, bit) = Self::position(event);
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        let added = self.words[word] & bit == 0;
        self.words[word] |= bit;
        added
    }

    /// Returns `true` if the event was present.
    pub fn remove(&mut self, event: EventType) -> bool {
        let (word, bit) = Self::position(event);
        let Some(slot) = self.words.get_mut(word) else {
            return false;
        };
        let removed = *slot & bit != 0;
        *slot &= !bit;
        self.trim();
        removed
    }

    #[must_use]
    pub fn contains(&self, event: EventType) -> bool {
        let (word, bit) = Self::position(event);
        self.words.get(word).is_some_and(|w| w & bit != 0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Adds every event of `other` to this set.
    pub fn union_with(&mut self, other: &EventSet) {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine |= theirs;
        }
    }

    /// Removes every event of `other` from this set.
    pub fn subtract(&mut self, other: &EventSet) {
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine &= !theirs;
        }
        self.trim();
    }

    /// Iterates events in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = EventType> + '_ {
        self.words.iter().enumerate().flat_map(|(index, word)| {
            (0..WORD_BITS)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| EventType(index as u32 * WORD_BITS + bit))
        })
    }

    /// Raw bitmask words, least significant event first.
    #[must_use]
    pub fn bitmask(&self) -> &[u64] {
        &self.words
    }

    fn position(event: EventType) -> (usize, u64) {
        let word = (event.0 / WORD_BITS) as usize;
        (word, 1u64 << (event.0 % WORD_BITS))
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(EventType::id)).finish()
    }
}

impl FromIterator<EventType> for EventSet {
    fn from_iter<I: IntoIterator<Item = EventType>>(iter: I) -> Self {
        let mut set = Self::new();
        for event in iter {
            set.insert(event);
        }
        set
    }
}

impl<const N: usize> From<[EventType; N]> for EventSet {
    fn from(events: [EventType; N]) -> Self {
        events.into_iter().collect()
    }
}

impl TryFrom<Vec<u32>> for EventSet {
    type Error = EventIdOutOfRange;

    fn try_from(ids: Vec<u32>) -> Result<Self, Self::Error> {
        Self::try_from_ids(&ids)
    }
}

impl From<EventSet> for Vec<u32> {
    fn from(set: EventSet) -> Self {
        set.iter().map(EventType::id).collect()
    }
}
