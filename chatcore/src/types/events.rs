use crate::types::conversation::{CachedConversation, ConversationId};
use crate::types::message::{CachedMessage, FileAttachment};
use serde::Serialize;

/// A conversation together with the list position it landed on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionedConversation {
    pub position: usize,
    pub conversation: CachedConversation,
}

/// A message removed from a window, with the recall notice that took its place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletedMessage {
    pub target: CachedMessage,
    pub recall: Option<CachedMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadProgress {
    pub conversation: ConversationId,
    pub transaction_id: u64,
    pub progress: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatchAction {
    Delete,
    Recall,
}

/// Count based warning for a batch where only some items succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartialFailure {
    pub action: BatchAction,
    pub attempted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Event {
    /// Locally created messages entered a window.
    MessagesInserted(Vec<CachedMessage>),
    MessageStateChanged(Vec<CachedMessage>),
    MessagesDeleted(Vec<DeletedMessage>),
    /// Messages delivered by the transport, after caching.
    MessagesReceived(Vec<CachedMessage>),
    /// Messages that are not cached (transient or for unsupported conversations).
    UnscheduledMessages(Vec<CachedMessage>),
    UploadProgress(UploadProgress),
    FileSendFailed(Vec<FileAttachment>),
    PartialFailure(PartialFailure),

    ConversationOrderChanged(Vec<PositionedConversation>),
    ConversationStatusChanged(Vec<CachedConversation>),
    ConversationListReset(Vec<CachedConversation>),
    ConversationRemoved(Vec<CachedConversation>),
    ConversationSelected(Option<CachedConversation>),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::MessagesInserted(_) => "messages_inserted",
            Event::MessageStateChanged(_) => "message_state_changed",
            Event::MessagesDeleted(_) => "messages_deleted",
            Event::MessagesReceived(_) => "messages_received",
            Event::UnscheduledMessages(_) => "unscheduled_messages",
            Event::UploadProgress(_) => "upload_progress",
            Event::FileSendFailed(_) => "file_send_failed",
            Event::PartialFailure(_) => "partial_failure",
            Event::ConversationOrderChanged(_) => "conversation_order_changed",
            Event::ConversationStatusChanged(_) => "conversation_status_changed",
            Event::ConversationListReset(_) => "conversation_list_reset",
            Event::ConversationRemoved(_) => "conversation_removed",
            Event::ConversationSelected(_) => "conversation_selected",
        }
    }
}
