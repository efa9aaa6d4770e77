use async_trait::async_trait;
use chatcore::store::{Result, StateBackend, StateEntries};
use dashmap::DashMap;

/// Keeps every account's map in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: DashMap<String, StateEntries>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateBackend for MemoryStore {
    async fn load(&self, account: &str) -> Result<Option<StateEntries>> {
        Ok(self.accounts.get(account).map(|entries| entries.value().clone()))
    }

    async fn save(&self, account: &str, entries: &StateEntries) -> Result<()> {
        self.accounts.insert(account.to_string(), entries.clone());
        Ok(())
    }
}
