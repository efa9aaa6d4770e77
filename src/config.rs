use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Messages per history page.
    pub history_page_size: usize,
    pub send_parallel: usize,
    pub send_fps: u32,
    pub upload_parallel: usize,
    pub upload_fps: u32,
    pub max_upload_files: usize,
    pub max_upload_bytes: u64,
    /// Size of the first-screen page and of the first full-sync page.
    pub first_page_count: usize,
    pub full_page_count: usize,
    pub page_interval_ms: u64,
    pub retry_backoff_ms: u64,
    pub pass_budget_ms: u64,
    pub pass_interval_ms: u64,
    pub first_screen_threshold: usize,
    pub clear_messages_on_delete: bool,
    /// Where the per-account state files live; in memory when unset.
    pub state_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            history_page_size: 30,
            send_parallel: 1,
            send_fps: 5,
            upload_parallel: 5,
            upload_fps: 5,
            max_upload_files: 99,
            max_upload_bytes: 100 * 1024 * 1024,
            first_page_count: 30,
            full_page_count: 200,
            page_interval_ms: 300,
            retry_backoff_ms: 3000,
            pass_budget_ms: 20,
            pass_interval_ms: 20,
            first_screen_threshold: 20,
            clear_messages_on_delete: false,
            state_dir: None,
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&data)
    }

    pub fn page_interval(&self) -> Duration {
        Duration::from_millis(self.page_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn pass_budget(&self) -> Duration {
        Duration::from_millis(self.pass_budget_ms)
    }

    pub fn pass_interval(&self) -> Duration {
        Duration::from_millis(self.pass_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ClientConfig::from_json(r#"{"upload_parallel": 3, "state_dir": "/tmp/x"}"#)
            .expect("config should parse");
        assert_eq!(config.upload_parallel, 3);
        assert_eq!(config.send_parallel, 1);
        assert_eq!(config.history_page_size, 30);
        assert_eq!(config.retry_backoff(), Duration::from_secs(3));
        assert_eq!(config.state_dir, Some(PathBuf::from("/tmp/x")));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(ClientConfig::from_json("{").is_err());
    }
}
