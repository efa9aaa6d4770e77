//! Message side of the client: history paging over the window cache, the
//! send and upload pipelines, delete and recall, and read receipts.
//!
//! Cache mutations happen under a short synchronous lock that is never held
//! across an await. Events for the conversation engine are published
//! immediately after the lock is released; UI-only notifications are
//! deferred.

use crate::config::ClientConfig;
use crate::queue::TaskQueue;
use crate::send::{SendHandler, SendJob};
use crate::store::StateStore;
use crate::upload::{UploadHandler, UploadJob, percent};
use chatcore::SyncError;
use chatcore::bus::{CoreEventBus, Delivery};
use chatcore::cache::MessageCache;
use chatcore::store::StatePatch;
use chatcore::transport::{HistoryBatch, HistoryDirection, ProgressSink, ReadReceipt, Transport};
use chatcore::types::events::{
    BatchAction, DeletedMessage, Event, PartialFailure, UploadProgress,
};
use chatcore::types::{
    CachedMessage, ConversationId, ConversationType, FileAttachment, MessageDirection,
    MessageDraft, MessageIdentity, MessageKind, SentMessage, SentStatus,
};
use chatcore::window::MessageWindow;
use futures_util::future::join_all;
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

pub type SharedCache = Arc<Mutex<MessageCache>>;

/// One page of history, ascending by `sent_time`.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage {
    pub has_more: bool,
    pub messages: Vec<CachedMessage>,
    /// Set when a top-up fetch failed after part of the page was served
    /// from memory.
    pub fetch_error: Option<SyncError>,
}

impl HistoryPage {
    fn new(mut messages: Vec<CachedMessage>, has_more: bool) -> Self {
        messages.sort_by_key(|m| m.sent_time);
        Self {
            has_more,
            messages,
            fetch_error: None,
        }
    }
}

struct Served {
    messages: Vec<CachedMessage>,
    truncated: bool,
    remote_more: bool,
}

pub struct MessageManager {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    bus: Arc<CoreEventBus>,
    cache: SharedCache,
    state: Arc<StateStore>,
    send_queue: Arc<TaskQueue<SendHandler>>,
    upload_queue: Arc<TaskQueue<UploadHandler>>,
    user_id: RwLock<String>,
    generation: AtomicU64,
}

impl MessageManager {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        bus: Arc<CoreEventBus>,
        state: Arc<StateStore>,
    ) -> Self {
        let send_queue = TaskQueue::new(
            "Queue/send",
            Arc::new(SendHandler::new(transport.clone())),
            config.send_parallel,
            config.send_fps,
        );
        let upload_queue = TaskQueue::new(
            "Queue/upload",
            Arc::new(UploadHandler::new(transport.clone())),
            config.upload_parallel,
            config.upload_fps,
        );
        Self {
            config,
            transport,
            bus,
            cache: Arc::new(Mutex::new(MessageCache::new())),
            state,
            send_queue,
            upload_queue,
            user_id: RwLock::new(String::new()),
            generation: AtomicU64::new(0),
        }
    }

    fn cache(&self) -> MutexGuard<'_, MessageCache> {
        self.cache.lock().expect("Mutex should not be poisoned")
    }

    pub fn shared_cache(&self) -> SharedCache {
        Arc::clone(&self.cache)
    }

    fn user_id(&self) -> String {
        self.user_id
            .read()
            .expect("RwLock should not be poisoned")
            .clone()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    fn publish(&self, event: Event) {
        self.bus.publish(event, Delivery::Immediate);
    }

    fn notify(&self, event: Event) {
        self.bus.publish(event, Delivery::Deferred);
    }

    pub fn start_session(&self, user_id: &str) {
        *self.user_id.write().expect("RwLock should not be poisoned") = user_id.to_string();
    }

    /// Stops both queues and forgets every window. Results of work started
    /// before the reset are dropped when they arrive.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.send_queue.shutdown();
        self.upload_queue.shutdown();
        self.cache().clear();
        self.user_id
            .write()
            .expect("RwLock should not be poisoned")
            .clear();
    }

    pub fn latest_message(&self, conversation: &ConversationId) -> Option<CachedMessage> {
        self.cache().latest_message(conversation)
    }

    /// A copy of the cached window, if any.
    pub fn window(&self, conversation: &ConversationId) -> Option<MessageWindow> {
        self.cache().window(conversation).cloned()
    }

    pub fn remove_cached_messages(&self, conversation: &ConversationId) {
        self.cache().remove_window(conversation);
    }

    // --- history ---

    /// Returns up to one page of messages next to `timestamp`. `forward`
    /// walks into older history; a zero timestamp with `forward` means the
    /// newest messages. Memory is used while the window covers the cursor,
    /// the transport tops the page up until it is full or history runs out.
    pub async fn request_history(
        &self,
        conversation: &ConversationId,
        timestamp: i64,
        forward: bool,
    ) -> Result<HistoryPage, SyncError> {
        conversation.validate()?;
        let generation = self.generation();
        let page_size = self.config.history_page_size.max(1);
        let mut collected = Vec::new();
        let mut cursor = timestamp;

        loop {
            let need = page_size - collected.len();
            if let Some(served) = self.serve_from_window(conversation, cursor, forward, need) {
                let Served {
                    messages,
                    truncated,
                    remote_more,
                } = served;
                absorb(&mut collected, &mut cursor, messages, forward);
                if collected.len() >= page_size {
                    return Ok(HistoryPage::new(collected, truncated || remote_more));
                }
                if !remote_more {
                    return Ok(HistoryPage::new(collected, false));
                }
            }

            let need = page_size - collected.len();
            let direction = if forward {
                HistoryDirection::Older
            } else {
                HistoryDirection::Newer
            };
            let batch = match self
                .transport
                .fetch_history(conversation, cursor, need, direction)
                .await
            {
                Ok(batch) => batch,
                Err(e) if collected.is_empty() => return Err(e),
                Err(e) => {
                    warn!(
                        target: "Messages",
                        "History top-up for {} failed, returning {} cached messages: {e}",
                        conversation.key().as_str(),
                        collected.len()
                    );
                    let mut page = HistoryPage::new(collected, true);
                    page.fetch_error = Some(e);
                    return Ok(page);
                }
            };
            if !self.is_current(generation) {
                debug!(target: "Messages", "Dropping history fetched before logout");
                return Err(SyncError::TaskCancelled);
            }

            let has_more = batch.has_more;
            let fetched = self.merge_fetched(conversation, cursor, forward, batch);
            let before = collected.len();
            absorb(&mut collected, &mut cursor, fetched, forward);
            if collected.len() >= page_size || !has_more || collected.len() == before {
                return Ok(HistoryPage::new(collected, has_more));
            }
        }
    }

    fn serve_from_window(
        &self,
        conversation: &ConversationId,
        cursor: i64,
        forward: bool,
        need: usize,
    ) -> Option<Served> {
        let cache = self.cache();
        let window = cache.window(conversation)?;
        let reaches_present = !window.has_more_after_end;
        let beyond_end = cursor == 0 || cursor > window.end_time();

        if forward {
            let anchor = if beyond_end && reaches_present {
                i64::MAX
            } else if cursor != 0 && window.covers(cursor) {
                cursor
            } else {
                return None;
            };
            let slice = window.older_than(anchor, need);
            return Some(Served {
                messages: slice.messages,
                truncated: slice.truncated,
                remote_more: window.has_more_before_start,
            });
        }

        if cursor > window.end_time() && reaches_present {
            return Some(Served {
                messages: Vec::new(),
                truncated: false,
                remote_more: false,
            });
        }
        if !window.covers(cursor) {
            return None;
        }
        let slice = window.newer_than(cursor, need);
        Some(Served {
            messages: slice.messages,
            truncated: slice.truncated,
            remote_more: window.has_more_after_end,
        })
    }

    /// Merges a fetched page into the window. A window that is not contiguous
    /// with the cursor is re-anchored first so no gap is ever cached.
    fn merge_fetched(
        &self,
        conversation: &ConversationId,
        cursor: i64,
        forward: bool,
        batch: HistoryBatch,
    ) -> Vec<CachedMessage> {
        let mut fetched = batch.messages;
        if conversation.conversation_type == ConversationType::Private {
            let last_read = self.state.get(conversation).last_read_time;
            let user_id = self.user_id();
            for message in fetched.iter_mut() {
                if message.is_own(&user_id)
                    && message.sent_status == SentStatus::Sent
                    && message.sent_time <= last_read
                {
                    message.sent_status = SentStatus::Read;
                }
            }
        }

        let now = self.transport.server_time();
        let mut cache = self.cache();
        let contiguous = cache.window(conversation).map(|w| {
            w.covers(cursor)
                || (!w.has_more_after_end && (cursor == 0 || cursor > w.end_time()))
        });
        let window = match contiguous {
            Some(true) => cache.get_or_create_window(conversation, cursor, now, true, true),
            Some(false) => {
                let window = cache.get_or_create_window(conversation, cursor, now, true, true);
                window.reset_at(if cursor == 0 { now } else { cursor });
                window.has_more_after_end = cursor != 0;
                window
            }
            None => cache.get_or_create_window(
                conversation,
                cursor,
                now,
                cursor != 0 || !forward,
                true,
            ),
        };

        if forward {
            window.merge_forward(fetched.iter().cloned());
            window.has_more_before_start = batch.has_more;
        } else {
            if cursor != 0 {
                window.lower_start_to(cursor);
            }
            window.merge_backward(fetched.iter().cloned());
            window.has_more_after_end = batch.has_more;
            if !batch.has_more {
                window.align_end_to_latest();
            }
        }
        fetched
    }

    // --- sending ---

    /// Sends a message: it is inserted optimistically as SENDING, then
    /// flips to SENT or FAILED when the send queue resolves it.
    pub async fn send(
        &self,
        conversation: &ConversationId,
        draft: MessageDraft,
    ) -> Result<CachedMessage, SyncError> {
        conversation.validate_outgoing()?;
        let now = self.transport.server_time();
        let user_id = self.user_id();
        let message = self
            .cache()
            .create_local_message(conversation, draft, &user_id, now);
        self.insert_created(message.clone(), now);
        self.dispatch(message).await
    }

    /// Inserts a message without sending it.
    pub fn insert_local(
        &self,
        conversation: &ConversationId,
        draft: MessageDraft,
        sent_status: SentStatus,
    ) -> Result<CachedMessage, SyncError> {
        conversation.validate_outgoing()?;
        let now = self.transport.server_time();
        let user_id = self.user_id();
        let mut message = self
            .cache()
            .create_local_message(conversation, draft, &user_id, now);
        message.sent_status = sent_status;
        self.insert_created(message.clone(), now);
        Ok(message)
    }

    fn insert_created(&self, message: CachedMessage, now: i64) {
        if !message.is_persisted {
            return;
        }
        let reset = self.cache().insert_local(message.clone(), now);
        if reset {
            debug!(
                target: "Messages",
                "Window of {} was not connected to the present and was reset",
                message.conversation.key().as_str()
            );
        }
        self.publish(Event::MessagesInserted(vec![message]));
    }

    async fn dispatch(&self, message: CachedMessage) -> Result<CachedMessage, SyncError> {
        let generation = self.generation();
        let tid = message.transaction_id.unwrap_or_default();
        let outcome = self
            .send_queue
            .push(SendJob {
                message: message.clone(),
            })
            .await;
        if !self.is_current(generation) {
            return outcome.map(|sent| confirmed_copy(message, &sent));
        }

        match outcome {
            Ok(sent) => {
                let confirmed = self
                    .cache()
                    .window_mut(&message.conversation)
                    .and_then(|w| w.confirm_sent(tid, &sent));
                match confirmed {
                    Some(confirmed) => {
                        self.publish(Event::MessageStateChanged(vec![confirmed.clone()]));
                        Ok(confirmed)
                    }
                    None => Ok(confirmed_copy(message, &sent)),
                }
            }
            Err(e) => {
                self.mark_failed(&message, None);
                Err(e)
            }
        }
    }

    fn mark_failed(&self, message: &CachedMessage, progress: Option<i32>) {
        let Some(tid) = message.transaction_id else {
            return;
        };
        let updated = self
            .cache()
            .window_mut(&message.conversation)
            .and_then(|w| {
                w.update(&MessageIdentity::Transaction(tid), |m| {
                    m.transition(SentStatus::Failed);
                    if progress.is_some() {
                        m.progress = progress;
                    }
                })
            });
        if let Some(updated) = updated {
            self.publish(Event::MessageStateChanged(vec![updated]));
        }
    }

    /// Uploads and sends each file. Files over the size limit or empty are
    /// reported in one `FileSendFailed` event and skipped.
    pub async fn send_files(
        &self,
        conversation: &ConversationId,
        files: Vec<FileAttachment>,
    ) -> Result<Vec<Result<CachedMessage, SyncError>>, SyncError> {
        conversation.validate_outgoing()?;
        if files.len() > self.config.max_upload_files {
            return Err(SyncError::TooManyFiles {
                max: self.config.max_upload_files,
            });
        }
        let max_bytes = self.config.max_upload_bytes;
        let (accepted, rejected): (Vec<_>, Vec<_>) = files
            .into_iter()
            .partition(|f| f.size > 0 && f.size <= max_bytes);
        if !rejected.is_empty() {
            warn!(target: "Messages", "Skipping {} files with invalid size", rejected.len());
            self.notify(Event::FileSendFailed(rejected));
        }

        let sends = accepted
            .into_iter()
            .map(|file| self.send_file(conversation, file));
        Ok(join_all(sends).await)
    }

    async fn send_file(
        &self,
        conversation: &ConversationId,
        file: FileAttachment,
    ) -> Result<CachedMessage, SyncError> {
        let draft = MessageDraft::new(
            MessageKind::for_file_name(&file.name),
            serde_json::json!({ "name": file.name, "size": file.size }),
        );
        let now = self.transport.server_time();
        let user_id = self.user_id();
        let mut message = self
            .cache()
            .create_local_message(conversation, draft, &user_id, now);
        message.progress = Some(0);
        message.attachment = Some(file);
        self.insert_created(message.clone(), now);
        self.upload_and_send(message).await
    }

    async fn upload_and_send(&self, message: CachedMessage) -> Result<CachedMessage, SyncError> {
        let Some(file) = message.attachment.clone() else {
            return self.dispatch(message).await;
        };
        let generation = self.generation();
        let tid = message.transaction_id.unwrap_or_default();
        let progress = self.progress_sink(&message.conversation, tid);
        let outcome = self
            .upload_queue
            .push(UploadJob {
                transaction_id: tid,
                file,
                progress,
            })
            .await;
        if !self.is_current(generation) {
            return Err(SyncError::TaskCancelled);
        }

        let url = match outcome {
            Ok(url) => url,
            Err(e) => {
                self.mark_failed(&message, Some(-1));
                return Err(e);
            }
        };
        let finish = |m: &mut CachedMessage| {
            m.set_media_url(&url);
            m.progress = Some(100);
        };
        let updated = self
            .cache()
            .window_mut(&message.conversation)
            .and_then(|w| w.update(&MessageIdentity::Transaction(tid), finish));
        let uploaded = match updated {
            Some(updated) => {
                self.publish(Event::MessageStateChanged(vec![updated.clone()]));
                updated
            }
            None => {
                let mut copy = message;
                finish(&mut copy);
                copy
            }
        };
        self.dispatch(uploaded).await
    }

    fn progress_sink(&self, conversation: &ConversationId, tid: u64) -> ProgressSink {
        let cache = Arc::clone(&self.cache);
        let bus = Arc::clone(&self.bus);
        let conversation = conversation.clone();
        Arc::new(move |sent, total| {
            let progress = percent(sent, total);
            if let Some(window) = cache
                .lock()
                .expect("Mutex should not be poisoned")
                .window_mut(&conversation)
            {
                window.update(&MessageIdentity::Transaction(tid), |m| {
                    m.progress = Some(progress)
                });
            }
            bus.publish(
                Event::UploadProgress(UploadProgress {
                    conversation: conversation.clone(),
                    transaction_id: tid,
                    progress,
                }),
                Delivery::Deferred,
            );
        })
    }

    /// Re-sends copies of `messages` into `conversation`. Mentions are not
    /// carried over.
    pub async fn forward(
        &self,
        conversation: &ConversationId,
        messages: Vec<CachedMessage>,
    ) -> Result<Vec<Result<CachedMessage, SyncError>>, SyncError> {
        conversation.validate_outgoing()?;
        let sends = messages.into_iter().map(|original| {
            let mut draft = MessageDraft::new(original.kind, original.content);
            draft.is_persisted = original.is_persisted;
            draft.is_counted = original.is_counted;
            self.send(conversation, draft)
        });
        Ok(join_all(sends).await)
    }

    /// Withdraws a message that has not reached the server. Returns false
    /// once the send is already on the wire.
    pub fn cancel_pending_send(&self, message: &CachedMessage) -> bool {
        let Some(tid) = message.transaction_id else {
            return false;
        };
        if message.sent_status != SentStatus::Sending {
            return false;
        }
        if !(self.upload_queue.remove(tid) || self.send_queue.remove(tid)) {
            return false;
        }
        debug!(target: "Messages", "Cancelled pending send of transaction {tid}");
        let removed = self
            .cache()
            .window_mut(&message.conversation)
            .and_then(|w| w.remove(&MessageIdentity::Transaction(tid)));
        if let Some(target) = removed {
            self.publish(Event::MessagesDeleted(vec![DeletedMessage {
                target,
                recall: None,
            }]));
        }
        true
    }

    /// Sends a FAILED message again as a new message; the failed copy is
    /// removed. Other statuses are returned unchanged.
    pub async fn resend(&self, message: &CachedMessage) -> Result<CachedMessage, SyncError> {
        let conversation = message.conversation.clone();
        conversation.validate_outgoing()?;
        if message.sent_status != SentStatus::Failed {
            return Ok(message.clone());
        }

        if let Some(identity) = message.identity() {
            let removed = self
                .cache()
                .window_mut(&conversation)
                .and_then(|w| w.remove(&identity));
            if let Some(target) = removed {
                self.publish(Event::MessagesDeleted(vec![DeletedMessage {
                    target,
                    recall: None,
                }]));
            }
        }

        let draft = MessageDraft {
            kind: message.kind.clone(),
            content: message.content.clone(),
            mentioned: message.mentioned.clone(),
            is_persisted: message.is_persisted,
            is_counted: message.is_counted,
        };
        let now = self.transport.server_time();
        let user_id = self.user_id();
        let mut fresh = self
            .cache()
            .create_local_message(&conversation, draft, &user_id, now);
        fresh.attachment = message.attachment.clone();
        let needs_upload = fresh.attachment.is_some() && fresh.media_url().is_none();
        if needs_upload {
            fresh.progress = Some(0);
        } else {
            fresh.progress = message.progress.map(|_| 100);
        }
        self.insert_created(fresh.clone(), now);
        if needs_upload {
            self.upload_and_send(fresh).await
        } else {
            self.dispatch(fresh).await
        }
    }

    // --- delete / recall ---

    /// Deletes or recalls messages. Messages the server never confirmed are
    /// removed locally. When only some of the transport calls fail, one
    /// `PartialFailure` warning is emitted; when all fail, the first error is
    /// returned.
    pub async fn delete_messages(
        &self,
        conversation: &ConversationId,
        messages: Vec<CachedMessage>,
        recall: bool,
    ) -> Result<Vec<DeletedMessage>, SyncError> {
        conversation.validate()?;
        let attempted = messages.len();
        let generation = self.generation();
        let outcomes = join_all(
            messages
                .into_iter()
                .map(|message| self.delete_one(message, recall)),
        )
        .await;
        if !self.is_current(generation) {
            return Err(SyncError::TaskCancelled);
        }

        let mut deleted = Vec::new();
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(item) => deleted.push(item),
                Err(e) => failures.push(e),
            }
        }
        if !deleted.is_empty() {
            self.publish(Event::MessagesDeleted(deleted.clone()));
        }
        if let Some(first) = failures.first() {
            if failures.len() == attempted {
                return Err(first.clone());
            }
            let action = if recall {
                BatchAction::Recall
            } else {
                BatchAction::Delete
            };
            warn!(
                target: "Messages",
                "{action:?} failed for {} of {attempted} messages",
                failures.len()
            );
            self.notify(Event::PartialFailure(PartialFailure {
                action,
                attempted,
                failed: failures.len(),
            }));
        }
        Ok(deleted)
    }

    async fn delete_one(
        &self,
        message: CachedMessage,
        recall: bool,
    ) -> Result<DeletedMessage, SyncError> {
        let conversation = message.conversation.clone();
        let identity = message.identity();
        let on_server = message.message_uid.is_some() && message.sent_status != SentStatus::Failed;

        if !on_server {
            if let Some(tid) = message.transaction_id {
                if message.sent_status == SentStatus::Sending {
                    let _ = self.upload_queue.remove(tid) || self.send_queue.remove(tid);
                }
            }
            let removed = identity.and_then(|identity| {
                self.cache()
                    .window_mut(&conversation)
                    .and_then(|w| w.remove(&identity))
            });
            return Ok(DeletedMessage {
                target: removed.unwrap_or(message),
                recall: None,
            });
        }

        if recall {
            let notice = self.transport.recall_message(&message).await?;
            let replaced = identity.and_then(|identity| {
                self.cache()
                    .window_mut(&conversation)
                    .and_then(|w| w.replace_in_place(&identity, notice.clone()))
            });
            let (target, notice) = replaced.unwrap_or_else(|| {
                let mut notice = notice;
                notice.sent_time = message.sent_time;
                (message, notice)
            });
            return Ok(DeletedMessage {
                target,
                recall: Some(notice),
            });
        }

        self.transport.delete_message(&message).await?;
        let removed = identity.and_then(|identity| {
            self.cache()
                .window_mut(&conversation)
                .and_then(|w| w.remove(&identity))
        });
        Ok(DeletedMessage {
            target: removed.unwrap_or(message),
            recall: None,
        })
    }

    // --- inbound ---

    /// Routes messages from the transport through the cache and returns the
    /// ones that were cached, recall notices included.
    pub fn on_messages_received(&self, messages: Vec<CachedMessage>) -> Vec<CachedMessage> {
        let batch = self.cache().apply_received(messages);
        if !batch.messages.is_empty() {
            self.publish(Event::MessagesReceived(batch.messages.clone()));
        }
        if !batch.recalled.is_empty() {
            self.publish(Event::MessagesDeleted(batch.recalled));
        }
        if !batch.unscheduled.is_empty() {
            self.notify(Event::UnscheduledMessages(batch.unscheduled));
        }
        batch.messages
    }

    /// Applies a read receipt to the cached window. Returns `None` for a
    /// private receipt when the conversation has no window, so the caller can
    /// fall back to the conversation's latest message.
    pub async fn apply_read_receipt(&self, receipt: &ReadReceipt) -> Option<Vec<CachedMessage>> {
        let user_id = self.user_id();
        let changed = match receipt {
            ReadReceipt::Private {
                conversation,
                end_time,
            } => {
                if *end_time > self.state.get(conversation).last_read_time {
                    self.state
                        .update(
                            conversation,
                            StatePatch {
                                last_read_time: Some(*end_time),
                                ..Default::default()
                            },
                        )
                        .await;
                }
                let mut cache = self.cache();
                let window = cache.window_mut(conversation)?;
                window.fold_read_receipt(*end_time, &user_id)
            }
            ReadReceipt::Group {
                conversation,
                message_uid,
            } => {
                let mut cache = self.cache();
                cache
                    .window_mut(conversation)
                    .and_then(|w| w.mark_read_by_uid(message_uid, &user_id))
                    .into_iter()
                    .collect()
            }
        };
        if !changed.is_empty() {
            self.publish(Event::MessageStateChanged(changed.clone()));
        }
        Some(changed)
    }

    /// Tells the peer of a private conversation that everything up to the
    /// newest received message was read. Nothing is sent when that message
    /// was already acknowledged.
    pub async fn send_read_receipt(
        &self,
        conversation: &ConversationId,
        latest_hint: Option<CachedMessage>,
    ) -> Result<(), SyncError> {
        conversation.validate()?;
        if conversation.conversation_type != ConversationType::Private {
            return Ok(());
        }
        let is_candidate =
            |m: &CachedMessage| m.direction == MessageDirection::Receive && m.message_uid.is_some();
        let newest = self
            .cache()
            .window(conversation)
            .and_then(|w| w.messages().iter().rev().find(|m| is_candidate(m)).cloned())
            .or_else(|| latest_hint.filter(|m| is_candidate(m)));
        let Some(message) = newest else {
            return Ok(());
        };
        let Some(uid) = message.message_uid.as_deref() else {
            return Ok(());
        };
        if message.sent_time <= self.state.get(conversation).send_read_receipt_time {
            return Ok(());
        }

        self.transport
            .send_read_receipt(conversation, uid, message.sent_time)
            .await?;
        self.state
            .update(
                conversation,
                StatePatch {
                    send_read_receipt_time: Some(message.sent_time),
                    ..Default::default()
                },
            )
            .await;
        Ok(())
    }
}

fn confirmed_copy(mut message: CachedMessage, sent: &SentMessage) -> CachedMessage {
    message.transition(SentStatus::Sent);
    message.message_uid = Some(sent.message_uid.clone());
    message.message_id = sent.message_id.or(message.message_id);
    message.sent_time = sent.sent_time;
    message
}

/// Adds unseen messages to a page being assembled and moves the cursor past
/// them.
fn absorb(
    collected: &mut Vec<CachedMessage>,
    cursor: &mut i64,
    incoming: Vec<CachedMessage>,
    forward: bool,
) {
    for message in incoming {
        if collected.iter().any(|m| m.same_message(&message)) {
            continue;
        }
        let time = message.sent_time;
        if forward {
            if *cursor == 0 || time < *cursor {
                *cursor = time;
            }
        } else if time > *cursor {
            *cursor = time;
        }
        collected.push(message);
    }
}
