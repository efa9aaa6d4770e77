//! Per-conversation message windows and the pure parts of message handling
//! that do not need the transport.

use crate::types::conversation::{ConversationId, ConversationKey};
use crate::types::events::DeletedMessage;
use crate::types::message::{
    CachedMessage, MessageDirection, MessageDraft, MessageIdentity, SentStatus,
};
use crate::window::MessageWindow;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct MessageCache {
    windows: HashMap<ConversationKey, MessageWindow>,
    last_transaction_id: u64,
}

/// Result of routing a batch of received messages through the cache.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReceivedBatch {
    /// Messages that are not recall notices, in arrival order.
    pub messages: Vec<CachedMessage>,
    /// Window entries replaced by recall notices.
    pub recalled: Vec<DeletedMessage>,
    /// Messages the cache does not keep.
    pub unscheduled: Vec<CachedMessage>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the window for `conversation`, creating it when missing. An
    /// existing window's bounds are never touched.
    pub fn get_or_create_window(
        &mut self,
        conversation: &ConversationId,
        ref_time: i64,
        server_now: i64,
        has_more_after_end: bool,
        has_more_before_start: bool,
    ) -> &mut MessageWindow {
        self.windows.entry(conversation.key()).or_insert_with(|| {
            let end_time = if ref_time == 0 { server_now } else { ref_time };
            MessageWindow::new(end_time, has_more_after_end, has_more_before_start)
        })
    }

    pub fn window(&self, conversation: &ConversationId) -> Option<&MessageWindow> {
        self.windows.get(&conversation.key())
    }

    pub fn window_mut(&mut self, conversation: &ConversationId) -> Option<&mut MessageWindow> {
        self.windows.get_mut(&conversation.key())
    }

    pub fn remove_window(&mut self, conversation: &ConversationId) -> Option<MessageWindow> {
        self.windows.remove(&conversation.key())
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Drops every window. Transaction ids keep increasing so that tasks still
    /// in a queue can never be confused with new ones.
    pub fn clear(&mut self) {
        self.windows.clear();
    }

    pub fn next_transaction_id(&mut self) -> u64 {
        self.last_transaction_id += 1;
        self.last_transaction_id
    }

    pub fn latest_message(&self, conversation: &ConversationId) -> Option<CachedMessage> {
        self.window(conversation)?.latest().cloned()
    }

    pub fn find(
        &self,
        conversation: &ConversationId,
        identity: &MessageIdentity,
    ) -> Option<&CachedMessage> {
        self.window(conversation)?.find(identity)
    }

    /// Builds a pending outgoing message from a draft.
    pub fn create_local_message(
        &mut self,
        conversation: &ConversationId,
        draft: MessageDraft,
        sender_user_id: &str,
        sent_time: i64,
    ) -> CachedMessage {
        CachedMessage {
            conversation: conversation.clone(),
            kind: draft.kind,
            content: draft.content,
            message_uid: None,
            message_id: None,
            transaction_id: Some(self.next_transaction_id()),
            sender_user_id: sender_user_id.to_string(),
            direction: MessageDirection::Send,
            sent_time,
            sent_status: SentStatus::Sending,
            is_persisted: draft.is_persisted,
            is_counted: draft.is_counted,
            is_offline: false,
            mentioned: draft.mentioned,
            progress: None,
            attachment: None,
            recalled_uid: None,
        }
    }

    /// Inserts a locally created message, resetting a window that is not
    /// connected to the present. Returns true when a reset happened.
    pub fn insert_local(&mut self, message: CachedMessage, server_now: i64) -> bool {
        let window = self.get_or_create_window(&message.conversation, 0, server_now, false, true);
        window.insert_local(message)
    }

    /// Routes received messages into their windows.
    ///
    /// A recall notice replaces its target in place when the target is either
    /// earlier in the same batch or in the window. Other messages are appended
    /// only to windows that reach the present.
    pub fn apply_received(&mut self, incoming: Vec<CachedMessage>) -> ReceivedBatch {
        let mut batch = ReceivedBatch::default();

        for message in incoming {
            if !message.is_persisted || !message.conversation.is_valid() {
                batch.unscheduled.push(message);
                continue;
            }

            if message.is_recall() {
                if let Some(target_uid) = message.recalled_uid.clone() {
                    if let Some(pos) = batch
                        .messages
                        .iter()
                        .position(|m| m.message_uid.as_deref() == Some(target_uid.as_str()))
                    {
                        let mut notice = message.clone();
                        notice.sent_time = batch.messages[pos].sent_time;
                        let target = std::mem::replace(&mut batch.messages[pos], notice.clone());
                        if let Some(window) = self.window_mut(&message.conversation) {
                            window.replace_in_place(&MessageIdentity::Uid(target_uid.clone()), notice.clone());
                        }
                        batch.recalled.push(DeletedMessage {
                            target,
                            recall: Some(notice),
                        });
                        continue;
                    }

                    let window = self.get_or_create_window(
                        &message.conversation,
                        message.sent_time + 1,
                        message.sent_time + 1,
                        false,
                        true,
                    );
                    if let Some((target, notice)) =
                        window.replace_in_place(&MessageIdentity::Uid(target_uid), message)
                    {
                        batch.recalled.push(DeletedMessage {
                            target,
                            recall: Some(notice),
                        });
                    }
                }
                continue;
            }

            let window = self.get_or_create_window(
                &message.conversation,
                message.sent_time + 1,
                message.sent_time + 1,
                false,
                true,
            );
            if !window.has_more_after_end {
                window.merge_backward([message.clone()]);
            }
            batch.messages.push(message);
        }

        batch
    }
}
