//! Per-account persistence of the conversation key/value map.

pub mod filestore;
pub mod memory;

use chatcore::store::{
    ConversationStateMap, LocalConversationState, StateBackend, StateEntries, StatePatch,
};
use chatcore::types::ConversationId;
use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard};

pub use filestore::FileStore;
pub use memory::MemoryStore;

#[derive(Default)]
struct Inner {
    account: Option<String>,
    map: ConversationStateMap,
}

/// The loaded map of the signed-in account. Writes go through to the backend;
/// backend failures are logged and never reach messaging callers.
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    inner: Mutex<Inner>,
}

impl StateStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            backend,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("Mutex should not be poisoned")
    }

    pub async fn load(&self, account: &str) {
        let entries = match self.backend.load(account).await {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                warn!(target: "Store", "Failed to load conversation state for {account}: {e}");
                StateEntries::new()
            }
        };
        debug!(target: "Store", "Loaded {} conversation entries for {account}", entries.len());
        let mut inner = self.inner();
        inner.account = Some(account.to_string());
        inner.map = ConversationStateMap::from_entries(entries);
    }

    pub fn get(&self, conversation: &ConversationId) -> LocalConversationState {
        self.inner().map.get(conversation)
    }

    pub async fn update(&self, conversation: &ConversationId, patch: StatePatch) {
        let snapshot = {
            let mut inner = self.inner();
            let Some(account) = inner.account.clone() else {
                return;
            };
            if !inner.map.apply(conversation, patch) {
                return;
            }
            (account, inner.map.entries().clone())
        };
        self.persist(snapshot).await;
    }

    pub async fn remove(&self, conversation: &ConversationId) {
        let snapshot = {
            let mut inner = self.inner();
            let Some(account) = inner.account.clone() else {
                return;
            };
            if !inner.map.remove(conversation) {
                return;
            }
            (account, inner.map.entries().clone())
        };
        self.persist(snapshot).await;
    }

    async fn persist(&self, (account, entries): (String, StateEntries)) {
        if let Err(e) = self.backend.save(&account, &entries).await {
            warn!(target: "Store", "Failed to save conversation state for {account}: {e}");
        }
    }

    /// Forgets the signed-in account without touching what was saved.
    pub fn clear(&self) {
        let mut inner = self.inner();
        inner.account = None;
        inner.map.clear();
    }
}
