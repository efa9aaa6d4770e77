use crate::config::ClientConfig;
use crate::conversations::ConversationManager;
use crate::messages::{HistoryPage, MessageManager};
use crate::store::{FileStore, StateStore};
use crate::types::events::{DeletedMessage, Event, EventBus};
use chatcore::SyncError;
use chatcore::bus::{CoreEventBus, Delivery};
use chatcore::engine::SyncPhase;
use chatcore::store::StateBackend;
use chatcore::transport::{ReadReceipt, Transport, TransportEvent};
use chatcore::types::{
    CachedConversation, CachedMessage, ConversationId, ConversationProfile, FileAttachment,
    MessageDraft, NotificationLevel, SentStatus,
};
use chatcore::window::MessageWindow;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("user id must not be empty")]
    InvalidUserId,
    #[error("failed to open state directory: {0}")]
    Storage(#[from] std::io::Error),
}

/// Entry point for applications: owns the managers, wires their events into
/// the broadcast [`EventBus`] and forwards transport events.
pub struct Client {
    config: ClientConfig,
    core_bus: Arc<CoreEventBus>,
    event_bus: Arc<EventBus>,
    state: Arc<StateStore>,
    messages: Arc<MessageManager>,
    conversations: Arc<ConversationManager>,
    user_id: RwLock<Option<String>>,
    is_running: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Builds a client whose conversation state lives in memory.
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::with_state(config, transport, Arc::new(StateStore::in_memory()))
    }

    /// Like [`Client::new`], but persists conversation state under
    /// `config.state_dir` when it is set.
    pub async fn build(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, ClientError> {
        let state = match &config.state_dir {
            Some(dir) => {
                let backend: Arc<dyn StateBackend> = Arc::new(FileStore::new(dir.clone()).await?);
                Arc::new(StateStore::new(backend))
            }
            None => Arc::new(StateStore::in_memory()),
        };
        Ok(Self::with_state(config, transport, state))
    }

    pub fn with_state(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        state: Arc<StateStore>,
    ) -> Arc<Self> {
        let core_bus = Arc::new(CoreEventBus::new());
        let event_bus = Arc::new(EventBus::new());
        let messages = Arc::new(MessageManager::new(
            config.clone(),
            transport.clone(),
            core_bus.clone(),
            state.clone(),
        ));
        let conversations = ConversationManager::new(
            config.clone(),
            transport,
            core_bus.clone(),
            messages.shared_cache(),
        );
        // The list reacts to message events before subscribers see them.
        core_bus.add_handler(conversations.clone());
        core_bus.add_handler(event_bus.clone());

        let wake = Arc::new(Notify::new());
        let notifier = wake.clone();
        core_bus.set_waker(move || notifier.notify_one());
        let pump_bus = core_bus.clone();
        let pump = tokio::spawn(async move {
            loop {
                wake.notified().await;
                pump_bus.flush();
            }
        });

        Arc::new(Self {
            config,
            core_bus,
            event_bus,
            state,
            messages,
            conversations,
            user_id: RwLock::new(None),
            is_running: AtomicBool::new(false),
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Broadcast channels for UI subscribers.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Delivers queued conversation-list events right away instead of
    /// waiting for the pump. Returns how many were delivered.
    pub fn flush_events(&self) -> usize {
        self.core_bus.flush()
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id
            .read()
            .expect("RwLock should not be poisoned")
            .clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.user_id().is_some()
    }

    // --- session ---

    /// Starts a session for `user_id`. Logging in as another user first logs
    /// the current one out; logging in again as the same user is a no-op.
    pub async fn login(&self, user_id: &str) -> Result<(), ClientError> {
        if user_id.is_empty() {
            return Err(ClientError::InvalidUserId);
        }
        match self.user_id() {
            Some(current) if current == user_id => return Ok(()),
            Some(_) => self.logout(),
            None => {}
        }
        self.state.load(user_id).await;
        self.messages.start_session(user_id);
        self.conversations.login(user_id);
        *self.user_id.write().expect("RwLock should not be poisoned") = Some(user_id.to_string());
        info!(target: "Client", "Logged in as {user_id}");
        Ok(())
    }

    /// Ends the session: queued sends and uploads are cancelled, caches are
    /// emptied and subscribers receive an empty list.
    pub fn logout(&self) {
        let Some(user_id) = self
            .user_id
            .write()
            .expect("RwLock should not be poisoned")
            .take()
        else {
            return;
        };
        self.conversations.logout();
        self.messages.reset();
        self.state.clear();
        self.core_bus.discard_pending();
        self.core_bus.publish(
            Event::ConversationListReset(Vec::new()),
            Delivery::Deferred,
        );
        info!(target: "Client", "Logged out {user_id}");
    }

    // --- transport ---

    pub async fn handle_transport_event(&self, event: TransportEvent) {
        if !self.is_logged_in() {
            debug!(target: "Client", "Dropping transport event while logged out");
            return;
        }
        match event {
            TransportEvent::MessagesReceived(messages) => {
                self.messages.on_messages_received(messages);
            }
            TransportEvent::ConversationChanged(notifications) => {
                self.conversations.on_conversation_changed(notifications);
            }
            TransportEvent::OfflineSyncFinished => {
                self.conversations.on_offline_sync_finished();
            }
            TransportEvent::ReadReceipt(receipt) => {
                let updated = self.messages.apply_read_receipt(&receipt).await;
                // No cached window: only the list's latest message can change.
                if updated.is_none()
                    && let ReadReceipt::Private {
                        conversation,
                        end_time,
                    } = &receipt
                {
                    self.conversations.mark_latest_read(conversation, *end_time);
                }
            }
            TransportEvent::ReadStatusSynced(id) => {
                if let Err(e) = self.conversations.on_sync_read_status(&id).await {
                    warn!(target: "Client", "Failed to sync read status of {}: {e}", id.key());
                }
            }
        }
    }

    /// Forwards transport events until the channel closes.
    pub async fn run(self: &Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!(target: "Client", "Client `run` method called while already running.");
            return;
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_running.store(false, Ordering::Relaxed);
        });
        while let Some(event) = events.recv().await {
            self.handle_transport_event(event).await;
        }
        info!(target: "Client", "Transport event channel closed.");
    }

    // --- messages ---

    pub async fn request_history(
        &self,
        conversation: &ConversationId,
        timestamp: i64,
        forward: bool,
    ) -> Result<HistoryPage, SyncError> {
        self.messages
            .request_history(conversation, timestamp, forward)
            .await
    }

    pub async fn send(
        &self,
        conversation: &ConversationId,
        draft: MessageDraft,
    ) -> Result<CachedMessage, SyncError> {
        self.messages.send(conversation, draft).await
    }

    pub fn insert_local(
        &self,
        conversation: &ConversationId,
        draft: MessageDraft,
        sent_status: SentStatus,
    ) -> Result<CachedMessage, SyncError> {
        self.messages.insert_local(conversation, draft, sent_status)
    }

    pub async fn send_files(
        &self,
        conversation: &ConversationId,
        files: Vec<FileAttachment>,
    ) -> Result<Vec<Result<CachedMessage, SyncError>>, SyncError> {
        self.messages.send_files(conversation, files).await
    }

    pub async fn forward(
        &self,
        conversation: &ConversationId,
        messages: Vec<CachedMessage>,
    ) -> Result<Vec<Result<CachedMessage, SyncError>>, SyncError> {
        self.messages.forward(conversation, messages).await
    }

    pub fn cancel_pending_send(&self, message: &CachedMessage) -> bool {
        self.messages.cancel_pending_send(message)
    }

    pub async fn resend(&self, message: &CachedMessage) -> Result<CachedMessage, SyncError> {
        self.messages.resend(message).await
    }

    pub async fn delete_messages(
        &self,
        conversation: &ConversationId,
        messages: Vec<CachedMessage>,
        recall: bool,
    ) -> Result<Vec<DeletedMessage>, SyncError> {
        self.messages
            .delete_messages(conversation, messages, recall)
            .await
    }

    pub async fn send_read_receipt(&self, conversation: &ConversationId) -> Result<(), SyncError> {
        let hint = self
            .conversations
            .find(conversation)
            .and_then(|c| c.latest_message);
        self.messages.send_read_receipt(conversation, hint).await
    }

    pub fn latest_message(&self, conversation: &ConversationId) -> Option<CachedMessage> {
        self.messages.latest_message(conversation)
    }

    /// A copy of the cached history window of `conversation`.
    pub fn cached_window(&self, conversation: &ConversationId) -> Option<MessageWindow> {
        self.messages.window(conversation)
    }

    // --- conversations ---

    pub fn sync_phase(&self) -> SyncPhase {
        self.conversations.phase()
    }

    pub fn conversation_list(&self) -> Vec<CachedConversation> {
        self.conversations.conversation_list()
    }

    pub fn find_conversation(&self, id: &ConversationId) -> Option<CachedConversation> {
        self.conversations.find(id)
    }

    pub fn selected_conversation(&self) -> Option<CachedConversation> {
        self.conversations.selected()
    }

    pub fn more_conversations(
        &self,
        anchor: Option<&ConversationId>,
        count: usize,
    ) -> (Vec<CachedConversation>, bool) {
        self.conversations.more_conversations(anchor, count)
    }

    pub fn open_conversation(&self, id: &ConversationId) -> Result<CachedConversation, SyncError> {
        self.conversations.open(id)
    }

    pub async fn set_top(&self, id: &ConversationId, is_top: bool) -> Result<(), SyncError> {
        self.conversations.set_top(id, is_top).await
    }

    pub async fn set_notification_level(
        &self,
        id: &ConversationId,
        level: NotificationLevel,
    ) -> Result<(), SyncError> {
        self.conversations.set_notification_level(id, level).await
    }

    pub async fn mark_read(&self, id: &ConversationId) -> Result<(), SyncError> {
        self.conversations.mark_read(id).await
    }

    pub fn mark_unread(&self, id: &ConversationId) -> Result<(), SyncError> {
        self.conversations.mark_unread(id)
    }

    pub async fn set_draft(&self, id: &ConversationId, draft: &str) -> Result<(), SyncError> {
        self.conversations.set_draft(id, draft).await
    }

    /// Removes a conversation remotely and locally, together with its read
    /// state and, when configured, its cached messages.
    pub async fn delete_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<CachedConversation, SyncError> {
        let removed = self.conversations.delete(id).await?;
        if self.config.clear_messages_on_delete {
            self.messages.remove_cached_messages(id);
        }
        self.state.remove(id).await;
        Ok(removed)
    }

    pub fn apply_profiles(&self, profiles: &[ConversationProfile]) {
        self.conversations.apply_profiles(profiles);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.conversations.logout();
        self.messages.reset();
        if let Some(pump) = self.pump.lock().expect("Mutex should not be poisoned").take() {
            pump.abort();
        }
    }
}
