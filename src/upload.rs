use crate::queue::{QueuedJob, TaskHandler};
use async_trait::async_trait;
use chatcore::SyncError;
use chatcore::transport::{ProgressSink, Transport, UploadHandle};
use chatcore::types::FileAttachment;
use dashmap::DashMap;
use log::debug;
use std::sync::Arc;

pub struct UploadJob {
    pub transaction_id: u64,
    pub file: FileAttachment,
    pub progress: ProgressSink,
}

impl QueuedJob for UploadJob {
    fn transaction_id(&self) -> u64 {
        self.transaction_id
    }
}

/// Uploads files and resolves to their download URL. Running uploads can be
/// aborted through the transport handle.
pub struct UploadHandler {
    transport: Arc<dyn Transport>,
    active: DashMap<u64, UploadHandle>,
}

impl UploadHandler {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            active: DashMap::new(),
        }
    }
}

/// Converts transferred bytes to a whole percent, 0..=100.
pub fn percent(sent: u64, total: u64) -> i32 {
    if total == 0 {
        return 0;
    }
    ((sent.min(total) * 100) / total) as i32
}

#[async_trait]
impl TaskHandler for UploadHandler {
    type Job = UploadJob;
    type Output = String;

    async fn run(&self, job: UploadJob) -> Result<String, SyncError> {
        let tid = job.transaction_id;
        let handle = self
            .transport
            .create_upload_task(&job.file, job.progress.clone())
            .await?;
        self.active.insert(tid, handle);
        let _guard = scopeguard::guard((), |_| {
            self.active.remove(&tid);
        });

        let result = self.transport.await_upload(handle).await;
        if let Err(e) = &result {
            debug!(target: "Queue/upload", "upload of {} failed: {e}", job.file.name);
        }
        result
    }

    fn cancel_in_flight(&self, transaction_id: u64) -> bool {
        let Some(handle) = self.active.get(&transaction_id).map(|h| *h) else {
            return false;
        };
        self.transport.abort_upload(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_is_clamped() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(50, 200), 25);
        assert_eq!(percent(300, 200), 100);
    }
}
