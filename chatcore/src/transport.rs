//! The messaging backend as seen by the sync core.
//!
//! Implementations own connection handling, authentication and timeouts;
//! every failure is reported as an opaque status code wrapped in
//! [`SyncError::Transport`].

use crate::error::SyncError;
use crate::types::conversation::{
    ConversationId, ConversationNotification, NotificationLevel, RemoteConversation,
};
use crate::types::message::{CachedMessage, FileAttachment, SentMessage};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryDirection {
    /// Messages sent before the timestamp.
    Older,
    /// Messages sent after the timestamp.
    Newer,
}

/// One page of remote history, ascending by `sent_time`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryBatch {
    pub messages: Vec<CachedMessage>,
    pub has_more: bool,
}

/// Upload progress callback: `(bytes_sent, bytes_total)`.
pub type ProgressSink = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UploadHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadReceipt {
    /// Everything the peer received up to `end_time` has been read.
    Private {
        conversation: ConversationId,
        end_time: i64,
    },
    /// A group member read one message.
    Group {
        conversation: ConversationId,
        message_uid: String,
    },
}

/// Events pushed by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    MessagesReceived(Vec<CachedMessage>),
    ConversationChanged(Vec<ConversationNotification>),
    OfflineSyncFinished,
    ReadReceipt(ReadReceipt),
    /// Another device of the same account changed the read state.
    ReadStatusSynced(ConversationId),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Current server clock in milliseconds.
    fn server_time(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// `timestamp == 0` with [`HistoryDirection::Older`] means "latest".
    async fn fetch_history(
        &self,
        conversation: &ConversationId,
        timestamp: i64,
        count: usize,
        direction: HistoryDirection,
    ) -> Result<HistoryBatch, SyncError>;

    async fn send_message(&self, message: &CachedMessage) -> Result<SentMessage, SyncError>;

    async fn create_upload_task(
        &self,
        file: &FileAttachment,
        progress: ProgressSink,
    ) -> Result<UploadHandle, SyncError>;

    /// Resolves to the download URL of the uploaded file.
    async fn await_upload(&self, handle: UploadHandle) -> Result<String, SyncError>;

    /// Returns false when the upload can no longer be stopped.
    fn abort_upload(&self, handle: UploadHandle) -> bool;

    /// Conversations older than `start_time` (0 for the newest), newest first.
    async fn fetch_conversations(
        &self,
        start_time: i64,
        count: usize,
    ) -> Result<Vec<RemoteConversation>, SyncError>;

    async fn remove_conversation(&self, conversation: &ConversationId) -> Result<(), SyncError>;

    async fn set_top(&self, conversation: &ConversationId, is_top: bool) -> Result<(), SyncError>;

    async fn set_notification_level(
        &self,
        conversation: &ConversationId,
        level: NotificationLevel,
    ) -> Result<(), SyncError>;

    async fn clear_unread(
        &self,
        conversation: &ConversationId,
        timestamp: i64,
    ) -> Result<(), SyncError>;

    async fn unread_count(&self, conversation: &ConversationId) -> Result<u32, SyncError>;

    async fn save_draft(&self, conversation: &ConversationId, draft: &str)
    -> Result<(), SyncError>;

    async fn delete_message(&self, message: &CachedMessage) -> Result<(), SyncError>;

    /// Returns the recall notice that replaces the message.
    async fn recall_message(&self, message: &CachedMessage) -> Result<CachedMessage, SyncError>;

    async fn send_read_receipt(
        &self,
        conversation: &ConversationId,
        message_uid: &str,
        sent_time: i64,
    ) -> Result<(), SyncError>;

    async fn clear_history(
        &self,
        conversation: &ConversationId,
        before: i64,
    ) -> Result<(), SyncError>;
}
