use chatcore::bus::EventHandler;
use chatcore::types::{CachedConversation, CachedMessage, FileAttachment};
use std::sync::Arc;
use tokio::sync::broadcast;

pub use chatcore::types::events::*;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with one broadcast channel per UI-facing event.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Conversation list
    (conversation_order_changed, Arc<Vec<PositionedConversation>>),
    (conversation_status_changed, Arc<Vec<CachedConversation>>),
    (conversation_list_reset, Arc<Vec<CachedConversation>>),
    (conversation_removed, Arc<Vec<CachedConversation>>),
    (conversation_selected, Arc<Option<CachedConversation>>),

    // Messages
    (messages_inserted, Arc<Vec<CachedMessage>>),
    (message_state_changed, Arc<Vec<CachedMessage>>),
    (messages_deleted, Arc<Vec<DeletedMessage>>),
    (messages_received, Arc<Vec<CachedMessage>>),
    (unscheduled_messages, Arc<Vec<CachedMessage>>),

    // Uploads and warnings
    (upload_progress, Arc<UploadProgress>),
    (file_send_failed, Arc<Vec<FileAttachment>>),
    (partial_failure, Arc<PartialFailure>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for EventBus {
    fn handle_event(&self, event: &Event) {
        // A send error only means nobody is subscribed.
        let _ = match event.clone() {
            Event::ConversationOrderChanged(v) => {
                self.conversation_order_changed.send(Arc::new(v)).map(drop).ok()
            }
            Event::ConversationStatusChanged(v) => {
                self.conversation_status_changed.send(Arc::new(v)).map(drop).ok()
            }
            Event::ConversationListReset(v) => {
                self.conversation_list_reset.send(Arc::new(v)).map(drop).ok()
            }
            Event::ConversationRemoved(v) => self.conversation_removed.send(Arc::new(v)).map(drop).ok(),
            Event::ConversationSelected(v) => {
                self.conversation_selected.send(Arc::new(v)).map(drop).ok()
            }
            Event::MessagesInserted(v) => self.messages_inserted.send(Arc::new(v)).map(drop).ok(),
            Event::MessageStateChanged(v) => self.message_state_changed.send(Arc::new(v)).map(drop).ok(),
            Event::MessagesDeleted(v) => self.messages_deleted.send(Arc::new(v)).map(drop).ok(),
            Event::MessagesReceived(v) => self.messages_received.send(Arc::new(v)).map(drop).ok(),
            Event::UnscheduledMessages(v) => self.unscheduled_messages.send(Arc::new(v)).map(drop).ok(),
            Event::UploadProgress(v) => self.upload_progress.send(Arc::new(v)).map(drop).ok(),
            Event::FileSendFailed(v) => self.file_send_failed.send(Arc::new(v)).map(drop).ok(),
            Event::PartialFailure(v) => self.partial_failure.send(Arc::new(v)).map(drop).ok(),
        };
    }
}
