//! Per-account key/value map of conversation scoped fields that the server
//! does not track, and the persistence seam behind it.

use crate::types::conversation::ConversationId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization/deserialization error: {0}")]
    Serialization(String),

    #[error("Storage backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// Stored fields of one conversation. Zero values are left out when
/// serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConversationState {
    #[serde(rename = "lrt", default, skip_serializing_if = "is_zero")]
    pub last_read_time: i64,
    #[serde(rename = "srrt", default, skip_serializing_if = "is_zero")]
    pub send_read_receipt_time: i64,
}

impl LocalConversationState {
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Partial update of a [`LocalConversationState`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatePatch {
    pub last_read_time: Option<i64>,
    pub send_read_receipt_time: Option<i64>,
}

pub type StateEntries = BTreeMap<String, LocalConversationState>;

/// Entry key of a conversation: `{channelId}_{type}_{targetId}`.
pub fn entry_key(conversation: &ConversationId) -> String {
    format!(
        "{}_{}_{}",
        conversation.channel_id,
        conversation.conversation_type.as_i32(),
        conversation.target_id
    )
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationStateMap {
    entries: StateEntries,
}

impl ConversationStateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(mut entries: StateEntries) -> Self {
        entries.retain(|_, state| !state.is_default());
        Self { entries }
    }

    pub fn entries(&self) -> &StateEntries {
        &self.entries
    }

    pub fn get(&self, conversation: &ConversationId) -> LocalConversationState {
        self.entries
            .get(&entry_key(conversation))
            .copied()
            .unwrap_or_default()
    }

    /// Applies a patch, dropping the entry once every field is back to zero.
    /// Returns true when the stored state changed.
    pub fn apply(&mut self, conversation: &ConversationId, patch: StatePatch) -> bool {
        let key = entry_key(conversation);
        let current = self.entries.get(&key).copied().unwrap_or_default();
        let mut next = current;
        if let Some(time) = patch.last_read_time {
            next.last_read_time = time;
        }
        if let Some(time) = patch.send_read_receipt_time {
            next.send_read_receipt_time = time;
        }
        if next == current {
            return false;
        }
        if next.is_default() {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, next);
        }
        true
    }

    pub fn remove(&mut self, conversation: &ConversationId) -> bool {
        self.entries.remove(&entry_key(conversation)).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Storage for the per-account map.
#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn load(&self, account: &str) -> Result<Option<StateEntries>>;
    async fn save(&self, account: &str, entries: &StateEntries) -> Result<()>;
}
