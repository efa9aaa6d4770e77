//! An in-process [`Transport`] that keeps "server" state in memory.
//!
//! Used by the demo binary and the integration tests. Failures can be
//! injected per operation, and sends and uploads can be slowed down to
//! exercise the queues.

use async_trait::async_trait;
use chatcore::SyncError;
use chatcore::transport::{
    HistoryBatch, HistoryDirection, ProgressSink, Transport, UploadHandle,
};
use chatcore::types::{
    CachedMessage, ConversationId, ConversationKey, FileAttachment, MessageDirection,
    MessageKind, NotificationLevel, RemoteConversation, SentMessage, SentStatus,
};
use dashmap::DashMap;
use log::trace;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Status code reported for an aborted upload.
pub const UPLOAD_ABORTED: i32 = 30010;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopbackOp {
    FetchHistory,
    Send,
    Upload,
    FetchConversations,
    RemoveConversation,
    UpdateConversation,
    UnreadCount,
    Delete,
    Recall,
    ReadReceipt,
}

struct PendingUpload {
    file: FileAttachment,
    progress: ProgressSink,
    aborted: Arc<AtomicBool>,
}

#[derive(Default)]
struct ServerState {
    history: HashMap<ConversationKey, Vec<CachedMessage>>,
    conversations: Vec<RemoteConversation>,
    sent: Vec<CachedMessage>,
    receipts: Vec<(ConversationId, String, i64)>,
}

pub struct LoopbackTransport {
    clock: AtomicI64,
    next_uid: AtomicU64,
    next_upload: AtomicU64,
    send_delay_ms: AtomicU64,
    upload_delay_ms: AtomicU64,
    state: Mutex<ServerState>,
    uploads: DashMap<u64, PendingUpload>,
    failures: DashMap<LoopbackOp, VecDeque<i32>>,
    calls: DashMap<LoopbackOp, usize>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new(1_000_000)
    }
}

impl LoopbackTransport {
    pub fn new(start_time: i64) -> Self {
        Self {
            clock: AtomicI64::new(start_time),
            next_uid: AtomicU64::new(0),
            next_upload: AtomicU64::new(0),
            send_delay_ms: AtomicU64::new(0),
            upload_delay_ms: AtomicU64::new(0),
            state: Mutex::new(ServerState::default()),
            uploads: DashMap::new(),
            failures: DashMap::new(),
            calls: DashMap::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().expect("Mutex should not be poisoned")
    }

    // --- test controls ---

    pub fn set_time(&self, time: i64) {
        self.clock.store(time, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) -> i64 {
        self.clock.fetch_add(millis, Ordering::SeqCst) + millis
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.send_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_upload_delay(&self, delay: Duration) {
        self.upload_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// The next call of `op` fails with `code`. Calls queue up.
    pub fn fail_next(&self, op: LoopbackOp, code: i32) {
        self.failures.entry(op).or_default().push_back(code);
    }

    pub fn calls(&self, op: LoopbackOp) -> usize {
        self.calls.get(&op).map(|c| *c).unwrap_or(0)
    }

    /// Adds messages to the server history of their conversations.
    pub fn seed_history(&self, messages: impl IntoIterator<Item = CachedMessage>) {
        let mut state = self.state();
        for message in messages {
            let history = state.history.entry(message.conversation.key()).or_default();
            let at = history.partition_point(|m| m.sent_time <= message.sent_time);
            history.insert(at, message);
        }
    }

    pub fn seed_conversations(&self, conversations: impl IntoIterator<Item = RemoteConversation>) {
        let mut state = self.state();
        for conversation in conversations {
            state
                .conversations
                .retain(|c| c.id.key() != conversation.id.key());
            state.conversations.push(conversation);
        }
    }

    pub fn sent_messages(&self) -> Vec<CachedMessage> {
        self.state().sent.clone()
    }

    pub fn read_receipts(&self) -> Vec<(ConversationId, String, i64)> {
        self.state().receipts.clone()
    }

    pub fn remote_conversations(&self) -> Vec<RemoteConversation> {
        self.state().conversations.clone()
    }

    fn enter(&self, op: LoopbackOp) -> Result<(), SyncError> {
        *self.calls.entry(op).or_default() += 1;
        let code = self.failures.get_mut(&op).and_then(|mut queue| queue.pop_front());
        match code {
            Some(code) => {
                trace!(target: "Loopback", "{op:?} fails with {code}");
                Err(SyncError::Transport(code))
            }
            None => Ok(()),
        }
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn update_remote<F>(&self, id: &ConversationId, update: F)
    where
        F: FnOnce(&mut RemoteConversation),
    {
        let mut state = self.state();
        if let Some(remote) = state
            .conversations
            .iter_mut()
            .find(|c| c.id.key() == id.key())
        {
            update(remote);
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn server_time(&self) -> i64 {
        self.clock.load(Ordering::SeqCst)
    }

    async fn fetch_history(
        &self,
        conversation: &ConversationId,
        timestamp: i64,
        count: usize,
        direction: HistoryDirection,
    ) -> Result<HistoryBatch, SyncError> {
        self.enter(LoopbackOp::FetchHistory)?;
        let state = self.state();
        let Some(history) = state.history.get(&conversation.key()) else {
            return Ok(HistoryBatch::default());
        };
        let batch = match direction {
            HistoryDirection::Older => {
                let end = if timestamp == 0 {
                    history.len()
                } else {
                    history.partition_point(|m| m.sent_time < timestamp)
                };
                let begin = end.saturating_sub(count);
                HistoryBatch {
                    messages: history[begin..end].to_vec(),
                    has_more: begin > 0,
                }
            }
            HistoryDirection::Newer => {
                let begin = history.partition_point(|m| m.sent_time <= timestamp);
                let end = (begin + count).min(history.len());
                HistoryBatch {
                    messages: history[begin..end].to_vec(),
                    has_more: end < history.len(),
                }
            }
        };
        Ok(batch)
    }

    async fn send_message(&self, message: &CachedMessage) -> Result<SentMessage, SyncError> {
        let delay = self.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.enter(LoopbackOp::Send)?;
        let sent = SentMessage {
            message_uid: format!("srv-{}", self.next_uid.fetch_add(1, Ordering::SeqCst) + 1),
            sent_time: self.tick(),
            message_id: None,
        };
        let mut stored = message.clone();
        stored.message_uid = Some(sent.message_uid.clone());
        stored.sent_time = sent.sent_time;
        stored.sent_status = SentStatus::Sent;
        stored.transaction_id = None;
        let mut state = self.state();
        if stored.is_persisted {
            state
                .history
                .entry(stored.conversation.key())
                .or_default()
                .push(stored.clone());
        }
        state.sent.push(stored);
        Ok(sent)
    }

    async fn create_upload_task(
        &self,
        file: &FileAttachment,
        progress: ProgressSink,
    ) -> Result<UploadHandle, SyncError> {
        self.enter(LoopbackOp::Upload)?;
        let id = self.next_upload.fetch_add(1, Ordering::SeqCst) + 1;
        progress(0, file.size);
        self.uploads.insert(
            id,
            PendingUpload {
                file: file.clone(),
                progress,
                aborted: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(UploadHandle(id))
    }

    async fn await_upload(&self, handle: UploadHandle) -> Result<String, SyncError> {
        let (size, progress, aborted) = {
            let upload = self
                .uploads
                .get(&handle.0)
                .ok_or(SyncError::Transport(UPLOAD_ABORTED))?;
            (
                upload.file.size,
                upload.progress.clone(),
                upload.aborted.clone(),
            )
        };
        let delay = self.upload_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay / 2)).await;
            progress(size / 2, size);
            tokio::time::sleep(Duration::from_millis(delay - delay / 2)).await;
        }
        let upload = self.uploads.remove(&handle.0);
        if aborted.load(Ordering::SeqCst) {
            return Err(SyncError::Transport(UPLOAD_ABORTED));
        }
        progress(size, size);
        let name = upload.map(|(_, u)| u.file.name).unwrap_or_default();
        Ok(format!("loopback://files/{}/{name}", handle.0))
    }

    fn abort_upload(&self, handle: UploadHandle) -> bool {
        match self.uploads.get(&handle.0) {
            Some(upload) => {
                upload.aborted.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    async fn fetch_conversations(
        &self,
        start_time: i64,
        count: usize,
    ) -> Result<Vec<RemoteConversation>, SyncError> {
        self.enter(LoopbackOp::FetchConversations)?;
        let mut list: Vec<RemoteConversation> = self
            .state()
            .conversations
            .iter()
            .filter(|c| start_time == 0 || c.ordering_time() < start_time)
            .cloned()
            .collect();
        list.sort_by_key(|c| std::cmp::Reverse(c.ordering_time()));
        list.truncate(count);
        Ok(list)
    }

    async fn remove_conversation(&self, conversation: &ConversationId) -> Result<(), SyncError> {
        self.enter(LoopbackOp::RemoveConversation)?;
        self.state()
            .conversations
            .retain(|c| c.id.key() != conversation.key());
        Ok(())
    }

    async fn set_top(&self, conversation: &ConversationId, is_top: bool) -> Result<(), SyncError> {
        self.enter(LoopbackOp::UpdateConversation)?;
        self.update_remote(conversation, |c| c.is_top = is_top);
        Ok(())
    }

    async fn set_notification_level(
        &self,
        conversation: &ConversationId,
        level: NotificationLevel,
    ) -> Result<(), SyncError> {
        self.enter(LoopbackOp::UpdateConversation)?;
        self.update_remote(conversation, |c| c.notification_level = level);
        Ok(())
    }

    async fn clear_unread(
        &self,
        conversation: &ConversationId,
        _timestamp: i64,
    ) -> Result<(), SyncError> {
        self.enter(LoopbackOp::UpdateConversation)?;
        self.update_remote(conversation, |c| c.unread_count = 0);
        Ok(())
    }

    async fn unread_count(&self, conversation: &ConversationId) -> Result<u32, SyncError> {
        self.enter(LoopbackOp::UnreadCount)?;
        Ok(self
            .state()
            .conversations
            .iter()
            .find(|c| c.id.key() == conversation.key())
            .map(|c| c.unread_count)
            .unwrap_or(0))
    }

    async fn save_draft(
        &self,
        conversation: &ConversationId,
        draft: &str,
    ) -> Result<(), SyncError> {
        self.enter(LoopbackOp::UpdateConversation)?;
        self.update_remote(conversation, |c| c.draft = draft.to_string());
        Ok(())
    }

    async fn delete_message(&self, message: &CachedMessage) -> Result<(), SyncError> {
        self.enter(LoopbackOp::Delete)?;
        if let Some(history) = self.state().history.get_mut(&message.conversation.key()) {
            history.retain(|m| !m.same_message(message));
        }
        Ok(())
    }

    async fn recall_message(&self, message: &CachedMessage) -> Result<CachedMessage, SyncError> {
        self.enter(LoopbackOp::Recall)?;
        let uid = message.message_uid.clone().unwrap_or_default();
        let mut notice = CachedMessage::received(
            message.conversation.clone(),
            format!("recall-{uid}"),
            message.sender_user_id.clone(),
            message.sent_time,
            MessageKind::Recall,
            serde_json::json!({ "operatorId": message.sender_user_id }),
        );
        notice.direction = MessageDirection::Send;
        notice.recalled_uid = Some(uid);
        if let Some(history) = self.state().history.get_mut(&message.conversation.key()) {
            if let Some(slot) = history.iter_mut().find(|m| m.same_message(message)) {
                *slot = notice.clone();
            }
        }
        Ok(notice)
    }

    async fn send_read_receipt(
        &self,
        conversation: &ConversationId,
        message_uid: &str,
        sent_time: i64,
    ) -> Result<(), SyncError> {
        self.enter(LoopbackOp::ReadReceipt)?;
        self.state()
            .receipts
            .push((conversation.clone(), message_uid.to_string(), sent_time));
        Ok(())
    }

    async fn clear_history(
        &self,
        conversation: &ConversationId,
        before: i64,
    ) -> Result<(), SyncError> {
        self.enter(LoopbackOp::Delete)?;
        if let Some(history) = self.state().history.get_mut(&conversation.key()) {
            history.retain(|m| m.sent_time > before);
        }
        Ok(())
    }
}
