use async_trait::async_trait;
use chatcore::store::{Result, StateBackend, StateEntries, StoreError};
use serde::{Serialize, de::DeserializeOwned};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// One JSON document per account under a base directory.
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    pub async fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let base_path = path.into();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    fn sanitize_filename(key: &str) -> String {
        key.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-', "_")
    }

    fn account_path(&self, account: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.json", Self::sanitize_filename(account)))
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match fs::read(path).await {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let data =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        // Write next to the target and rename so a crash never leaves half a file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, path).await.map_err(StoreError::from)
    }
}

#[async_trait]
impl StateBackend for FileStore {
    async fn load(&self, account: &str) -> Result<Option<StateEntries>> {
        self.read_json(&self.account_path(account)).await
    }

    async fn save(&self, account: &str, entries: &StateEntries) -> Result<()> {
        self.write_json(&self.account_path(account), entries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatcore::store::LocalConversationState;

    #[tokio::test]
    async fn test_round_trip_and_missing_account() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("state")).await.unwrap();
        assert!(store.load("nobody").await.unwrap().is_none());

        let mut entries = StateEntries::new();
        entries.insert(
            "_1_bob".into(),
            LocalConversationState {
                last_read_time: 0,
                send_read_receipt_time: 77,
            },
        );
        store.save("user/1", &entries).await.unwrap();

        let raw = fs::read_to_string(dir.path().join("state").join("user_1.json"))
            .await
            .unwrap();
        assert_eq!(raw, r#"{"_1_bob":{"srrt":77}}"#);
        assert_eq!(store.load("user/1").await.unwrap(), Some(entries));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();
        fs::write(dir.path().join("bob.json"), b"{not json").await.unwrap();
        assert!(matches!(
            store.load("bob").await,
            Err(StoreError::Serialization(_))
        ));
    }
}
