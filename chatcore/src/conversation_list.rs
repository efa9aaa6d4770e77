//! Arena of conversation records with an ordered index and a key index.
//!
//! Records live in the arena under a stable [`ConversationHandle`]; the
//! visible list is an ordered vector of handles, pinned entries first, each
//! partition descending by `update_time`. A record may exist in the arena
//! without being listed, e.g. while a full sync rebuilds the order.

use crate::types::conversation::{CachedConversation, ConversationId, ConversationKey};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationHandle(usize);

#[derive(Debug, Default)]
pub struct ConversationList {
    slots: Vec<Option<CachedConversation>>,
    free: Vec<usize>,
    by_key: HashMap<ConversationKey, ConversationHandle>,
    order: Vec<ConversationHandle>,
}

impl ConversationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of listed conversations.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Number of records in the arena, listed or not.
    pub fn record_count(&self) -> usize {
        self.by_key.len()
    }

    pub fn handle_of(&self, id: &ConversationId) -> Option<ConversationHandle> {
        self.by_key.get(&id.key()).copied()
    }

    pub fn get(&self, handle: ConversationHandle) -> Option<&CachedConversation> {
        self.slots.get(handle.0)?.as_ref()
    }

    pub fn get_mut(&mut self, handle: ConversationHandle) -> Option<&mut CachedConversation> {
        self.slots.get_mut(handle.0)?.as_mut()
    }

    pub fn find(&self, id: &ConversationId) -> Option<&CachedConversation> {
        self.get(self.handle_of(id)?)
    }

    /// Returns the record for `id`, creating an unlisted one when missing.
    /// The flag tells whether it was created.
    pub fn get_or_create(&mut self, id: &ConversationId) -> (ConversationHandle, bool) {
        if let Some(handle) = self.handle_of(id) {
            return (handle, false);
        }
        let record = CachedConversation::new(id.clone());
        let handle = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(record);
                ConversationHandle(index)
            }
            None => {
                self.slots.push(Some(record));
                ConversationHandle(self.slots.len() - 1)
            }
        };
        self.by_key.insert(id.key(), handle);
        (handle, true)
    }

    pub fn position(&self, handle: ConversationHandle) -> Option<usize> {
        self.order.iter().position(|h| *h == handle)
    }

    pub fn is_listed(&self, handle: ConversationHandle) -> bool {
        self.position(handle).is_some()
    }

    fn unlist(&mut self, handle: ConversationHandle) {
        self.order.retain(|h| *h != handle);
    }

    /// Sort rank: pinned entries first, then newer `update_time` first.
    fn rank(&self, handle: ConversationHandle) -> Option<(bool, i64)> {
        self.get(handle).map(|c| (c.is_top, c.update_time))
    }

    /// Moves (or adds) the conversation to the position dictated by its pin
    /// flag and `update_time`. A listed entry that already sits between its
    /// neighbours stays put, so entries with equal rank keep their order.
    pub fn place(&mut self, handle: ConversationHandle) -> Option<usize> {
        let rank = self.rank(handle)?;
        if let Some(current) = self.position(handle) {
            let after_prev = current == 0
                || self
                    .rank(self.order[current - 1])
                    .is_none_or(|prev| prev >= rank);
            let before_next = self
                .order
                .get(current + 1)
                .and_then(|next| self.rank(*next))
                .is_none_or(|next| next <= rank);
            if after_prev && before_next {
                return Some(current);
            }
        }
        self.unlist(handle);
        let at = self
            .order
            .iter()
            .position(|h| self.rank(*h).is_some_and(|other| other < rank))
            .unwrap_or(self.order.len());
        self.order.insert(at, handle);
        Some(at)
    }

    /// Moves the conversation to the head of its partition, regardless of time.
    pub fn place_first_in_partition(&mut self, handle: ConversationHandle) -> Option<usize> {
        let is_top = self.get(handle)?.is_top;
        self.unlist(handle);
        let at = if is_top {
            0
        } else {
            self.order
                .iter()
                .position(|h| self.get(*h).is_some_and(|other| !other.is_top))
                .unwrap_or(self.order.len())
        };
        self.order.insert(at, handle);
        Some(at)
    }

    /// Removes the record from the arena and from every index.
    pub fn remove(&mut self, id: &ConversationId) -> Option<CachedConversation> {
        let handle = self.by_key.remove(&id.key())?;
        self.unlist(handle);
        let record = self.slots.get_mut(handle.0)?.take();
        self.free.push(handle.0);
        record
    }

    /// Empties the ordered index but keeps the records.
    pub fn clear_order(&mut self) {
        self.order.clear();
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.by_key.clear();
        self.order.clear();
    }

    /// Records present in the arena but missing from the ordered index.
    pub fn unlisted(&self) -> Vec<ConversationHandle> {
        self.by_key
            .values()
            .copied()
            .filter(|h| !self.is_listed(*h))
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ConversationKey> {
        self.by_key.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CachedConversation> {
        self.order.iter().filter_map(|h| self.get(*h))
    }

    /// Copies of the listed conversations, in list order.
    pub fn snapshot(&self) -> Vec<CachedConversation> {
        self.iter().cloned().collect()
    }
}
