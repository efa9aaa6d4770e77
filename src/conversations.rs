//! Conversation side of the client.
//!
//! Drives the [`ConversationEngine`] through the sync protocol: a first
//! screen page right after login, the paged full sync once offline replay is
//! over, and a background loop that drains buffered events in time-boxed
//! passes. Local actions call the transport first and only touch the list
//! once the server agreed.

use crate::config::ClientConfig;
use crate::messages::SharedCache;
use chatcore::SyncError;
use chatcore::bus::{CoreEventBus, Delivery, EventHandler};
use chatcore::engine::{ConversationEngine, ListDiff, PassOutcome, SyncPhase};
use chatcore::transport::Transport;
use chatcore::types::events::Event;
use chatcore::types::{
    CachedConversation, CachedMessage, ConversationId, ConversationNotification,
    ConversationProfile, NotificationLevel,
};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

pub struct ConversationManager {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    bus: Arc<CoreEventBus>,
    cache: SharedCache,
    engine: Mutex<ConversationEngine>,
    generation: AtomicU64,
    pass_wake: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    me: Weak<ConversationManager>,
}

impl ConversationManager {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        bus: Arc<CoreEventBus>,
        cache: SharedCache,
    ) -> Arc<Self> {
        let threshold = config.first_screen_threshold;
        Arc::new_cyclic(|me| Self {
            config,
            transport,
            bus,
            cache,
            engine: Mutex::new(ConversationEngine::new("", threshold)),
            generation: AtomicU64::new(0),
            pass_wake: Notify::new(),
            tasks: Mutex::new(Vec::new()),
            me: me.clone(),
        })
    }

    fn engine(&self) -> MutexGuard<'_, ConversationEngine> {
        self.engine.lock().expect("Mutex should not be poisoned")
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn emit(&self, diff: ListDiff) {
        for event in diff.into_events() {
            self.bus.publish(event, Delivery::Deferred);
        }
    }

    fn emit_reset(&self) {
        let snapshot = self.engine().snapshot();
        self.bus
            .publish(Event::ConversationListReset(snapshot), Delivery::Deferred);
    }

    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(task);
        let mut tasks = self.tasks.lock().expect("Mutex should not be poisoned");
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    // --- lifecycle ---

    /// Starts over for `user_id`: the list is emptied, the first screen is
    /// fetched and the pass loop is started.
    pub fn login(&self, user_id: &str) {
        self.stop_tasks();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.engine().reset(user_id);
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let first_screen = Arc::clone(&me);
        self.spawn(async move { first_screen.first_screen(generation).await });
        self.spawn(async move { me.pass_loop(generation).await });
    }

    /// Stops background work and empties the list. Fetches that are still
    /// running are ignored when they come back.
    pub fn logout(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.stop_tasks();
        self.engine().reset("");
    }

    fn stop_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("Mutex should not be poisoned"));
        for task in tasks {
            task.abort();
        }
    }

    async fn first_screen(self: Arc<Self>, generation: u64) {
        loop {
            match self
                .transport
                .fetch_conversations(0, self.config.first_page_count)
                .await
            {
                Ok(page) => {
                    if !self.is_current(generation) {
                        debug!(target: "Conversations/Sync", "Dropping first screen fetched before logout");
                        return;
                    }
                    {
                        let mut engine = self.engine();
                        if engine.phase() != SyncPhase::InitialSync {
                            return;
                        }
                        engine.apply_remote_page(&page, false);
                    }
                    debug!(target: "Conversations/Sync", "First screen holds {} conversations", page.len());
                    self.emit_reset();
                    self.pass_wake.notify_one();
                    return;
                }
                Err(e) => {
                    warn!(target: "Conversations/Sync", "First screen fetch failed: {e}, retrying");
                    sleep(self.config.retry_backoff()).await;
                    if !self.is_current(generation) || self.phase() != SyncPhase::InitialSync {
                        return;
                    }
                }
            }
        }
    }

    /// Offline replay is over; pages in the complete list.
    pub fn on_offline_sync_finished(&self) {
        if !self.engine().begin_full_sync() {
            return;
        }
        info!(target: "Conversations/Sync", "Offline sync finished, starting full sync");
        self.pass_wake.notify_one();
        let generation = self.generation.load(Ordering::SeqCst);
        if let Some(me) = self.me.upgrade() {
            self.spawn(async move { me.full_sync(generation).await });
        }
    }

    async fn full_sync(self: Arc<Self>, generation: u64) {
        let mut cursor = 0;
        let mut first = true;
        loop {
            let count = if first {
                self.config.first_page_count
            } else {
                self.config.full_page_count
            };
            let page = match self.transport.fetch_conversations(cursor, count).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(target: "Conversations/Sync", "Conversation page at {cursor} failed: {e}, retrying");
                    sleep(self.config.retry_backoff()).await;
                    if !self.is_current(generation) {
                        return;
                    }
                    continue;
                }
            };
            if !self.is_current(generation) {
                debug!(target: "Conversations/Sync", "Dropping conversation page fetched before logout");
                return;
            }

            let next = self.engine().apply_remote_page(&page, first);
            first = false;
            self.emit_reset();
            self.pass_wake.notify_one();
            if page.len() < count || next == 0 || next == cursor {
                break;
            }
            cursor = next;
            sleep(self.config.page_interval()).await;
        }

        let (dropped, total) = {
            let mut engine = self.engine();
            let dropped = engine.finish_full_sync();
            (dropped, engine.list().len())
        };
        info!(target: "Conversations/Sync", "Full sync complete with {total} conversations");
        if !dropped.is_empty() {
            self.bus
                .publish(Event::ConversationRemoved(dropped), Delivery::Deferred);
        }
        self.emit_reset();
        self.pass_wake.notify_one();
    }

    async fn pass_loop(self: Arc<Self>, generation: u64) {
        loop {
            self.pass_wake.notified().await;
            loop {
                if !self.is_current(generation) {
                    return;
                }
                let deadline = Instant::now() + self.config.pass_budget();
                let (outcome, diff) = self
                    .engine()
                    .process_pending(|| Instant::now() >= deadline);
                self.emit(diff);
                if outcome != PassOutcome::BudgetExhausted {
                    break;
                }
                sleep(self.config.pass_interval()).await;
            }
        }
    }

    // --- queries ---

    pub fn phase(&self) -> SyncPhase {
        self.engine().phase()
    }

    pub fn pending_len(&self) -> usize {
        self.engine().pending_len()
    }

    pub fn conversation_list(&self) -> Vec<CachedConversation> {
        self.engine().snapshot()
    }

    pub fn find(&self, id: &ConversationId) -> Option<CachedConversation> {
        self.engine().find(id).cloned()
    }

    pub fn selected(&self) -> Option<CachedConversation> {
        self.engine().selected().cloned()
    }

    /// Up to `count` conversations after `anchor`, and whether more may follow.
    pub fn more_conversations(
        &self,
        anchor: Option<&ConversationId>,
        count: usize,
    ) -> (Vec<CachedConversation>, bool) {
        self.engine().page_after(anchor, count)
    }

    // --- inbound ---

    pub fn on_conversation_changed(&self, notifications: Vec<ConversationNotification>) {
        let (diff, pending) = {
            let mut engine = self.engine();
            let diff = engine.ingest_notifications(notifications);
            (diff, engine.pending_len() > 0)
        };
        self.emit(diff);
        if pending {
            self.pass_wake.notify_one();
        }
    }

    /// Another device changed the read state; refetch the unread count.
    pub async fn on_sync_read_status(&self, id: &ConversationId) -> Result<(), SyncError> {
        id.validate()?;
        if self.find(id).is_none() {
            return Ok(());
        }
        let unread = self.transport.unread_count(id).await?;
        let diff = self.engine().set_unread_count(id, unread)?;
        self.emit(diff);
        Ok(())
    }

    /// Marks the latest message read for a private receipt that found no
    /// cached window.
    pub fn mark_latest_read(&self, id: &ConversationId, end_time: i64) -> Option<CachedMessage> {
        let (message, diff) = self.engine().mark_latest_read(id, end_time)?;
        self.emit(diff);
        Some(message)
    }

    pub fn apply_profiles(&self, profiles: &[ConversationProfile]) {
        let diff = self.engine().apply_profiles(profiles);
        self.emit(diff);
    }

    // --- local actions ---

    fn require_known(&self, id: &ConversationId) -> Result<(), SyncError> {
        id.validate()?;
        if self.engine().find(id).is_none() {
            return Err(SyncError::ConversationNotFound);
        }
        Ok(())
    }

    /// Selects the conversation, adding it on top when it is not listed.
    pub fn open(&self, id: &ConversationId) -> Result<CachedConversation, SyncError> {
        let now = self.transport.server_time();
        let opened = self.engine().open(id, now)?;
        let Some((conversation, diff)) = opened else {
            return self.find(id).ok_or(SyncError::ConversationNotFound);
        };
        self.emit(diff);
        self.bus.publish(
            Event::ConversationSelected(Some(conversation.clone())),
            Delivery::Deferred,
        );
        Ok(conversation)
    }

    pub async fn set_top(&self, id: &ConversationId, is_top: bool) -> Result<(), SyncError> {
        self.require_known(id)?;
        self.transport.set_top(id, is_top).await?;
        let diff = self.engine().set_top(id, is_top)?;
        self.emit(diff);
        Ok(())
    }

    pub async fn set_notification_level(
        &self,
        id: &ConversationId,
        level: NotificationLevel,
    ) -> Result<(), SyncError> {
        self.require_known(id)?;
        self.transport.set_notification_level(id, level).await?;
        let diff = self.engine().set_notification_level(id, level)?;
        self.emit(diff);
        Ok(())
    }

    /// Clears the unread state up to the latest message.
    pub async fn mark_read(&self, id: &ConversationId) -> Result<(), SyncError> {
        self.require_known(id)?;
        let timestamp = self
            .find(id)
            .and_then(|c| c.latest_message.map(|m| m.sent_time))
            .unwrap_or_else(|| self.transport.server_time());
        self.transport.clear_unread(id, timestamp).await?;
        let diff = self.engine().clear_unread(id)?;
        self.emit(diff);
        Ok(())
    }

    pub fn mark_unread(&self, id: &ConversationId) -> Result<(), SyncError> {
        let diff = self.engine().mark_unread(id)?;
        self.emit(diff);
        Ok(())
    }

    pub async fn set_draft(&self, id: &ConversationId, draft: &str) -> Result<(), SyncError> {
        self.require_known(id)?;
        self.transport.save_draft(id, draft).await?;
        let diff = self.engine().set_draft(id, draft)?;
        self.emit(diff);
        Ok(())
    }

    /// Removes the conversation on the server and from the list. History is
    /// cleared too when configured so.
    pub async fn delete(&self, id: &ConversationId) -> Result<CachedConversation, SyncError> {
        self.require_known(id)?;
        self.transport.remove_conversation(id).await?;
        if self.config.clear_messages_on_delete {
            let before = self.transport.server_time();
            self.transport.clear_history(id, before).await?;
        }
        let (removed, was_selected) = {
            let mut engine = self.engine();
            let was_selected = engine.is_selected(id);
            (engine.remove(id), was_selected)
        };
        let removed = removed.ok_or(SyncError::ConversationNotFound)?;
        self.bus.publish(
            Event::ConversationRemoved(vec![removed.clone()]),
            Delivery::Deferred,
        );
        if was_selected {
            self.bus
                .publish(Event::ConversationSelected(None), Delivery::Deferred);
        }
        Ok(removed)
    }
}

impl EventHandler for ConversationManager {
    fn handle_event(&self, event: &Event) {
        let (diff, pending) = {
            let mut engine = self.engine();
            let diff = match event {
                Event::MessagesReceived(messages) => engine.ingest_messages(messages.clone()),
                Event::MessagesInserted(messages) => engine.on_messages_inserted(messages),
                Event::MessageStateChanged(messages) => engine.on_message_state_changed(messages),
                Event::MessagesDeleted(deleted) => engine.on_messages_deleted(deleted, |id| {
                    self.cache
                        .lock()
                        .expect("Mutex should not be poisoned")
                        .latest_message(id)
                }),
                _ => return,
            };
            (diff, engine.pending_len() > 0)
        };
        self.emit(diff);
        if pending {
            self.pass_wake.notify_one();
        }
    }
}
