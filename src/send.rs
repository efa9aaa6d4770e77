use crate::queue::{QueuedJob, TaskHandler};
use async_trait::async_trait;
use chatcore::SyncError;
use chatcore::transport::Transport;
use chatcore::types::{CachedMessage, SentMessage};
use log::debug;
use std::sync::Arc;

/// One outgoing message waiting for the network.
#[derive(Debug, Clone)]
pub struct SendJob {
    pub message: CachedMessage,
}

impl QueuedJob for SendJob {
    fn transaction_id(&self) -> u64 {
        self.message.transaction_id.unwrap_or_default()
    }
}

/// Sends through the transport. A dispatched send is never cancelled, so the
/// server cannot end up with a message the client believes was dropped.
pub struct SendHandler {
    transport: Arc<dyn Transport>,
}

impl SendHandler {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl TaskHandler for SendHandler {
    type Job = SendJob;
    type Output = SentMessage;

    async fn run(&self, job: SendJob) -> Result<SentMessage, SyncError> {
        let result = self.transport.send_message(&job.message).await;
        if let Err(e) = &result {
            debug!(
                target: "Queue/send",
                "send of transaction {} failed: {e}",
                job.transaction_id()
            );
        }
        result
    }
}
