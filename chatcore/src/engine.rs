//! Conversation reconciliation.
//!
//! The engine merges incoming messages, remote conversation notifications and
//! local actions into one ordered [`ConversationList`], and reports each batch
//! as a [`ListDiff`] split into order changes and status-only changes.
//!
//! Until the full remote list has been paged in, live events are held in two
//! FIFO buffers. Offline replay events are applied as they come, except while
//! the first screen is still being rendered. Offline events still buffered
//! when the full list arrives are already counted by it and are dropped.

use crate::conversation_list::{ConversationHandle, ConversationList};
use crate::error::SyncError;
use crate::types::conversation::{
    CachedConversation, ConversationId, ConversationKey, ConversationNotification,
    ConversationProfile, ConversationType, MentionedType, NotificationLevel, RemoteConversation,
};
use crate::types::events::{DeletedMessage, Event, PositionedConversation};
use crate::types::message::{CachedMessage, MessageDirection, SentStatus};
use log::debug;
use std::collections::{BTreeMap, HashSet, VecDeque};

/// Engine phases; transitions only move forward until [`ConversationEngine::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncPhase {
    /// A temporary first page drives early rendering.
    InitialSync,
    /// Offline replay is done and the complete list is being paged in.
    FullSyncInProgress,
    Steady,
}

/// How much of a conversation changed. Order changes outrank status changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    Status,
    Order,
}

#[derive(Debug, Default)]
struct ChangeSet(BTreeMap<ConversationHandle, ChangeKind>);

impl ChangeSet {
    fn mark(&mut self, handle: ConversationHandle, kind: ChangeKind) {
        let entry = self.0.entry(handle).or_insert(kind);
        if kind > *entry {
            *entry = kind;
        }
    }
}

/// Changes produced by one engine call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListDiff {
    pub order_changed: Vec<PositionedConversation>,
    pub status_changed: Vec<CachedConversation>,
}

impl ListDiff {
    pub fn is_empty(&self) -> bool {
        self.order_changed.is_empty() && self.status_changed.is_empty()
    }

    pub fn extend(&mut self, other: ListDiff) {
        self.order_changed.extend(other.order_changed);
        self.status_changed.extend(other.status_changed);
    }

    pub fn into_events(self) -> Vec<Event> {
        let mut events = Vec::new();
        if !self.order_changed.is_empty() {
            events.push(Event::ConversationOrderChanged(self.order_changed));
        }
        if !self.status_changed.is_empty() {
            events.push(Event::ConversationStatusChanged(self.status_changed));
        }
        events
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Both buffers are empty.
    Drained,
    /// Work remains; schedule another pass.
    BudgetExhausted,
    /// Initial rendering in progress; nothing was processed.
    Paused,
    /// Only live events remain and they wait for the full sync.
    Holding,
}

enum Pending {
    Message(CachedMessage),
    Notification(ConversationNotification),
}

#[derive(Debug)]
pub struct ConversationEngine {
    list: ConversationList,
    phase: SyncPhase,
    messages: VecDeque<CachedMessage>,
    notifications: VecDeque<ConversationNotification>,
    self_user_id: String,
    selected: Option<ConversationKey>,
    first_screen_threshold: usize,
    /// Records known before the full list was reset and not seen since.
    unconfirmed: HashSet<ConversationKey>,
}

impl ConversationEngine {
    pub fn new(self_user_id: impl Into<String>, first_screen_threshold: usize) -> Self {
        Self {
            list: ConversationList::new(),
            phase: SyncPhase::InitialSync,
            messages: VecDeque::new(),
            notifications: VecDeque::new(),
            self_user_id: self_user_id.into(),
            selected: None,
            first_screen_threshold,
            unconfirmed: HashSet::new(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn list(&self) -> &ConversationList {
        &self.list
    }

    pub fn self_user_id(&self) -> &str {
        &self.self_user_id
    }

    pub fn pending_len(&self) -> usize {
        self.messages.len() + self.notifications.len()
    }

    /// Forgets everything and starts over for `self_user_id`.
    pub fn reset(&mut self, self_user_id: impl Into<String>) {
        self.list.clear();
        self.messages.clear();
        self.notifications.clear();
        self.selected = None;
        self.unconfirmed.clear();
        self.phase = SyncPhase::InitialSync;
        self.self_user_id = self_user_id.into();
    }

    /// Initial rendering: the first screen is not filled and the full list
    /// has not been requested yet.
    pub fn is_paused(&self) -> bool {
        self.phase == SyncPhase::InitialSync && self.list.len() < self.first_screen_threshold
    }

    fn has_pending_offline(&self) -> bool {
        self.messages.iter().any(|m| m.is_offline)
            || self.notifications.iter().any(|n| n.is_offline())
    }

    fn applies_directly(&self, is_offline: bool) -> bool {
        match self.phase {
            SyncPhase::Steady => self.pending_len() == 0,
            _ => is_offline && !self.is_paused() && !self.has_pending_offline(),
        }
    }

    pub fn snapshot(&self) -> Vec<CachedConversation> {
        self.list.snapshot()
    }

    pub fn find(&self, id: &ConversationId) -> Option<&CachedConversation> {
        self.list.find(id)
    }

    pub fn selected(&self) -> Option<&CachedConversation> {
        let key = self.selected.as_ref()?;
        self.list.iter().find(|c| &c.key == key)
    }

    /// Up to `count` conversations listed after `anchor` (from the top when
    /// the anchor is missing), and whether more may follow.
    pub fn page_after(
        &self,
        anchor: Option<&ConversationId>,
        count: usize,
    ) -> (Vec<CachedConversation>, bool) {
        let start = anchor
            .and_then(|id| self.list.handle_of(id))
            .and_then(|h| self.list.position(h))
            .map(|p| p + 1)
            .unwrap_or(0);
        let end = start + count;
        let page = self.list.iter().skip(start).take(count).cloned().collect();
        let has_more = self.list.len() > end || self.phase != SyncPhase::Steady;
        (page, has_more)
    }

    // --- inbound streams ---

    pub fn ingest_messages(&mut self, messages: Vec<CachedMessage>) -> ListDiff {
        let mut changes = ChangeSet::default();
        for message in messages {
            if self.applies_directly(message.is_offline) {
                self.apply_message(&message, &mut changes);
            } else {
                self.messages.push_back(message);
            }
        }
        self.finish(changes)
    }

    pub fn ingest_notifications(&mut self, notifications: Vec<ConversationNotification>) -> ListDiff {
        let mut changes = ChangeSet::default();
        for notification in notifications {
            if self.applies_directly(notification.is_offline()) {
                self.apply_notification(&notification, &mut changes);
            } else {
                self.notifications.push_back(notification);
            }
        }
        self.finish(changes)
    }

    fn next_pending(&mut self) -> Option<Pending> {
        if self.phase == SyncPhase::Steady {
            if let Some(message) = self.messages.pop_front() {
                return Some(Pending::Message(message));
            }
            return self.notifications.pop_front().map(Pending::Notification);
        }
        if let Some(index) = self.messages.iter().position(|m| m.is_offline) {
            return self.messages.remove(index).map(Pending::Message);
        }
        let index = self.notifications.iter().position(|n| n.is_offline())?;
        self.notifications.remove(index).map(Pending::Notification)
    }

    /// Applies buffered events until they run out or `out_of_budget` reports
    /// true. At least one event is applied per pass when any is eligible.
    pub fn process_pending<F>(&mut self, mut out_of_budget: F) -> (PassOutcome, ListDiff)
    where
        F: FnMut() -> bool,
    {
        if self.is_paused() {
            return (PassOutcome::Paused, ListDiff::default());
        }
        let mut changes = ChangeSet::default();
        let mut applied = 0usize;
        let outcome = loop {
            if applied > 0 && out_of_budget() {
                break PassOutcome::BudgetExhausted;
            }
            match self.next_pending() {
                Some(Pending::Message(message)) => self.apply_message(&message, &mut changes),
                Some(Pending::Notification(n)) => self.apply_notification(&n, &mut changes),
                None if self.pending_len() == 0 => break PassOutcome::Drained,
                None => break PassOutcome::Holding,
            }
            applied += 1;
        };
        if applied > 0 {
            debug!(target: "Conversations/Engine", "applied {applied} buffered events ({outcome:?})");
        }
        (outcome, self.finish(changes))
    }

    fn apply_message(&mut self, message: &CachedMessage, changes: &mut ChangeSet) {
        if !message.is_persisted || !message.conversation.is_valid() {
            return;
        }
        let (handle, created) = self.list.get_or_create(&message.conversation);
        if created {
            changes.mark(handle, ChangeKind::Order);
        }
        self.unconfirmed.remove(&message.conversation.key());
        let self_user_id = self.self_user_id.clone();
        let Some(record) = self.list.get_mut(handle) else {
            return;
        };
        let from_self = message.sender_user_id == self_user_id;

        if record.id.conversation_type == ConversationType::Group
            && record.mentioned_type != MentionedType::AtMe
            && !from_self
        {
            let mentioned = message.mentioned_type_for(&self_user_id);
            if mentioned > record.mentioned_type {
                record.mentioned_type = mentioned;
                changes.mark(handle, ChangeKind::Status);
            }
        }

        if record.offer_latest_message(message) {
            changes.mark(handle, ChangeKind::Order);
        }

        if message.is_counted
            && !message.is_recall()
            && !from_self
            && message.direction == MessageDirection::Receive
        {
            record.unread_count += 1;
            record.mark_read = false;
            changes.mark(handle, ChangeKind::Status);
        }
    }

    fn apply_notification(&mut self, notification: &ConversationNotification, changes: &mut ChangeSet) {
        let remote = &notification.conversation;
        let updated = &notification.updated;
        if !remote.id.is_valid() {
            return;
        }

        let handle = match self.list.handle_of(&remote.id) {
            Some(handle) => handle,
            None if updated.latest_message.is_some() => {
                let (handle, _) = self.list.get_or_create(&remote.id);
                changes.mark(handle, ChangeKind::Order);
                handle
            }
            None => return,
        };
        self.unconfirmed.remove(&remote.id.key());
        let Some(record) = self.list.get_mut(handle) else {
            return;
        };

        if let Some(is_top) = updated.is_top {
            if record.is_top != is_top {
                record.is_top = is_top;
                changes.mark(handle, ChangeKind::Order);
            }
        }
        if let Some(level) = updated.notification_level {
            if record.notification_level != level {
                record.notification_level = level;
                changes.mark(handle, ChangeKind::Status);
            }
        }
        if let Some(latest) = &updated.latest_message {
            merge_remote(record, remote);
            record.offer_latest_message(latest);
            changes.mark(handle, ChangeKind::Order);
        }
    }

    /// Repositions order-changed entries (oldest first, so the newest ends on
    /// top) and snapshots everything that changed.
    fn finish(&mut self, changes: ChangeSet) -> ListDiff {
        let mut diff = ListDiff::default();
        let mut reorder = Vec::new();
        for (handle, kind) in changes.0 {
            let Some(record) = self.list.get(handle) else {
                continue;
            };
            match kind {
                ChangeKind::Order => reorder.push((record.update_time, handle)),
                ChangeKind::Status => diff.status_changed.push(record.clone()),
            }
        }
        reorder.sort_by_key(|(time, _)| *time);
        for (_, handle) in &reorder {
            self.list.place(*handle);
        }
        for (_, handle) in reorder {
            if let (Some(position), Some(record)) = (self.list.position(handle), self.list.get(handle)) {
                diff.order_changed.push(PositionedConversation {
                    position,
                    conversation: record.clone(),
                });
            }
        }
        diff
    }

    fn single(&mut self, handle: ConversationHandle, kind: ChangeKind) -> ListDiff {
        let mut changes = ChangeSet::default();
        changes.mark(handle, kind);
        self.finish(changes)
    }

    // --- sync protocol ---

    /// Offline replay finished; the full list is about to be paged in.
    pub fn begin_full_sync(&mut self) -> bool {
        if self.phase != SyncPhase::InitialSync {
            return false;
        }
        self.phase = SyncPhase::FullSyncInProgress;
        true
    }

    /// Merges one page of the remote list. With `reset`, the visible order is
    /// rebuilt from this page on; records stay in the arena. Returns the
    /// cursor for the next page.
    pub fn apply_remote_page(&mut self, page: &[RemoteConversation], reset: bool) -> i64 {
        if reset {
            self.unconfirmed = self.list.keys().cloned().collect();
            self.list.clear_order();
        }
        let mut cursor = i64::MAX;
        for remote in page {
            cursor = cursor.min(remote.ordering_time());
            if !remote.id.is_valid() {
                continue;
            }
            let (handle, _) = self.list.get_or_create(&remote.id);
            self.unconfirmed.remove(&remote.id.key());
            if let Some(record) = self.list.get_mut(handle) {
                merge_remote(record, remote);
            }
            self.list.place(handle);
        }
        if cursor == i64::MAX { 0 } else { cursor }
    }

    /// The complete list is present. Records the remote list no longer has
    /// are dropped unless an event touched them after the reset; those are
    /// listed again.
    pub fn finish_full_sync(&mut self) -> Vec<CachedConversation> {
        let mut dropped = Vec::new();
        for handle in self.list.unlisted() {
            let Some(record) = self.list.get(handle) else {
                continue;
            };
            if self.unconfirmed.contains(&record.key) {
                let id = record.id.clone();
                dropped.extend(self.remove(&id));
            } else if record.update_time > 0 {
                self.list.place(handle);
            }
        }
        self.unconfirmed.clear();
        self.discard_offline();
        self.phase = SyncPhase::Steady;
        dropped
    }

    fn discard_offline(&mut self) {
        let before = self.pending_len();
        self.messages.retain(|m| !m.is_offline);
        self.notifications.retain(|n| !n.is_offline());
        let discarded = before - self.pending_len();
        if discarded > 0 {
            debug!(target: "Conversations/Engine", "discarded {discarded} offline events covered by the full list");
        }
    }

    // --- local actions ---

    fn require_steady(&self) -> Result<(), SyncError> {
        if self.phase == SyncPhase::Steady {
            Ok(())
        } else {
            Err(SyncError::ListNotReady)
        }
    }

    /// Selects the conversation, creating it on top when unknown. Returns
    /// `None` when it was already selected.
    pub fn open(
        &mut self,
        id: &ConversationId,
        now: i64,
    ) -> Result<Option<(CachedConversation, ListDiff)>, SyncError> {
        id.validate()?;
        self.require_steady()?;
        if self.selected.as_ref() == Some(&id.key()) {
            return Ok(None);
        }
        let (handle, created) = self.list.get_or_create(id);
        let mut diff = ListDiff::default();
        if created || !self.list.is_listed(handle) {
            if let Some(record) = self.list.get_mut(handle) {
                record.update_time = record.update_time.max(now);
            }
            diff = self.single(handle, ChangeKind::Order);
        }
        self.selected = Some(id.key());
        let record = self
            .list
            .get(handle)
            .cloned()
            .ok_or(SyncError::ConversationNotFound)?;
        Ok(Some((record, diff)))
    }

    fn update_existing<F>(&mut self, id: &ConversationId, kind: ChangeKind, f: F) -> Result<ListDiff, SyncError>
    where
        F: FnOnce(&mut CachedConversation) -> bool,
    {
        id.validate()?;
        let handle = self
            .list
            .handle_of(id)
            .ok_or(SyncError::ConversationNotFound)?;
        let record = self
            .list
            .get_mut(handle)
            .ok_or(SyncError::ConversationNotFound)?;
        if !f(record) {
            return Ok(ListDiff::default());
        }
        Ok(self.single(handle, kind))
    }

    pub fn set_top(&mut self, id: &ConversationId, is_top: bool) -> Result<ListDiff, SyncError> {
        self.update_existing(id, ChangeKind::Order, |c| {
            let changed = c.is_top != is_top;
            c.is_top = is_top;
            changed
        })
    }

    pub fn set_notification_level(
        &mut self,
        id: &ConversationId,
        level: NotificationLevel,
    ) -> Result<ListDiff, SyncError> {
        self.update_existing(id, ChangeKind::Status, |c| {
            let changed = c.notification_level != level;
            c.notification_level = level;
            changed
        })
    }

    pub fn clear_unread(&mut self, id: &ConversationId) -> Result<ListDiff, SyncError> {
        self.update_existing(id, ChangeKind::Status, |c| {
            let changed = c.unread_count > 0 || c.mark_unread || !c.mark_read;
            c.clear_unread();
            changed
        })
    }

    pub fn mark_unread(&mut self, id: &ConversationId) -> Result<ListDiff, SyncError> {
        self.update_existing(id, ChangeKind::Status, |c| {
            let changed = !c.mark_unread;
            c.mark_unread = true;
            c.mark_read = false;
            changed
        })
    }

    /// Sets the unread count reported by another device.
    pub fn set_unread_count(&mut self, id: &ConversationId, unread: u32) -> Result<ListDiff, SyncError> {
        self.update_existing(id, ChangeKind::Status, |c| {
            if c.unread_count == unread {
                return false;
            }
            c.unread_count = unread;
            if unread == 0 {
                c.mentioned_type = MentionedType::None;
                c.mark_read = true;
            }
            true
        })
    }

    /// A non-empty draft pins the conversation to the head of its partition;
    /// clearing it puts the conversation back by time.
    pub fn set_draft(&mut self, id: &ConversationId, draft: &str) -> Result<ListDiff, SyncError> {
        id.validate()?;
        let handle = self
            .list
            .handle_of(id)
            .ok_or(SyncError::ConversationNotFound)?;
        let Some(record) = self.list.get_mut(handle) else {
            return Err(SyncError::ConversationNotFound);
        };
        if record.draft == draft {
            return Ok(ListDiff::default());
        }
        record.draft = draft.to_string();
        if draft.is_empty() {
            return Ok(self.single(handle, ChangeKind::Order));
        }
        let position = self
            .list
            .place_first_in_partition(handle)
            .ok_or(SyncError::ConversationNotFound)?;
        let conversation = self
            .list
            .get(handle)
            .cloned()
            .ok_or(SyncError::ConversationNotFound)?;
        Ok(ListDiff {
            order_changed: vec![PositionedConversation {
                position,
                conversation,
            }],
            status_changed: Vec::new(),
        })
    }

    /// Removes the conversation from every index. Clears the selection when
    /// it pointed at it.
    pub fn remove(&mut self, id: &ConversationId) -> Option<CachedConversation> {
        let removed = self.list.remove(id)?;
        if self.selected.as_ref() == Some(&removed.key) {
            self.selected = None;
        }
        Some(removed)
    }

    pub fn is_selected(&self, id: &ConversationId) -> bool {
        self.selected.as_ref() == Some(&id.key())
    }

    pub fn apply_profiles(&mut self, profiles: &[ConversationProfile]) -> ListDiff {
        let mut changes = ChangeSet::default();
        for profile in profiles {
            let Some(handle) = self.list.handle_of(&profile.id) else {
                continue;
            };
            if let Some(record) = self.list.get_mut(handle) {
                if record.name != profile.name || record.portrait_uri != profile.portrait_uri {
                    record.name = profile.name.clone();
                    record.portrait_uri = profile.portrait_uri.clone();
                    changes.mark(handle, ChangeKind::Status);
                }
            }
        }
        self.finish(changes)
    }

    // --- reactions to the message cache ---

    /// Locally created messages move their conversation up.
    pub fn on_messages_inserted(&mut self, messages: &[CachedMessage]) -> ListDiff {
        let mut changes = ChangeSet::default();
        for message in messages {
            if !message.is_persisted || !message.conversation.is_valid() {
                continue;
            }
            let (handle, _) = self.list.get_or_create(&message.conversation);
            self.unconfirmed.remove(&message.conversation.key());
            if let Some(record) = self.list.get_mut(handle) {
                record.offer_latest_message(message);
                record.mark_unread = false;
                changes.mark(handle, ChangeKind::Order);
            }
        }
        self.finish(changes)
    }

    /// Refreshes latest messages whose status changed.
    pub fn on_message_state_changed(&mut self, messages: &[CachedMessage]) -> ListDiff {
        let mut changes = ChangeSet::default();
        for message in messages {
            let Some(handle) = self.list.handle_of(&message.conversation) else {
                continue;
            };
            let Some(record) = self.list.get_mut(handle) else {
                continue;
            };
            let Some(latest) = record.latest_message.as_mut() else {
                continue;
            };
            if !latest.same_message(message) {
                continue;
            }
            let moved = latest.sent_time != message.sent_time;
            *latest = message.clone();
            if message.sent_time > record.update_time {
                record.update_time = message.sent_time;
            }
            changes.mark(
                handle,
                if moved {
                    ChangeKind::Order
                } else {
                    ChangeKind::Status
                },
            );
        }
        self.finish(changes)
    }

    /// Replaces a deleted latest message with its recall notice, or with
    /// whatever `fallback` reports as the newest remaining message.
    pub fn on_messages_deleted<F>(&mut self, deleted: &[DeletedMessage], fallback: F) -> ListDiff
    where
        F: Fn(&ConversationId) -> Option<CachedMessage>,
    {
        let mut changes = ChangeSet::default();
        for item in deleted {
            let Some(handle) = self.list.handle_of(&item.target.conversation) else {
                continue;
            };
            let Some(record) = self.list.get_mut(handle) else {
                continue;
            };
            let is_latest = record
                .latest_message
                .as_ref()
                .is_some_and(|latest| latest.same_message(&item.target));
            if !is_latest {
                continue;
            }
            record.latest_message = match &item.recall {
                Some(recall) => Some(recall.clone()),
                None => fallback(&item.target.conversation),
            };
            changes.mark(handle, ChangeKind::Status);
        }
        self.finish(changes)
    }

    /// Private read receipt for a conversation without a cached window.
    pub fn mark_latest_read(
        &mut self,
        id: &ConversationId,
        end_time: i64,
    ) -> Option<(CachedMessage, ListDiff)> {
        let handle = self.list.handle_of(id)?;
        let self_user_id = self.self_user_id.clone();
        let record = self.list.get_mut(handle)?;
        let latest = record.latest_message.as_mut()?;
        if !latest.is_own(&self_user_id)
            || latest.sent_status != SentStatus::Sent
            || latest.sent_time > end_time
        {
            return None;
        }
        latest.sent_status = SentStatus::Read;
        let message = latest.clone();
        Some((message, self.single(handle, ChangeKind::Status)))
    }
}

/// Copies a remote snapshot onto the local record. Unread counts are taken
/// as reported; the mention flag only rises until unread drops to zero.
fn merge_remote(record: &mut CachedConversation, remote: &RemoteConversation) {
    if let Some(latest) = &remote.latest_message {
        record.offer_latest_message(latest);
    }
    record.update_time = record.update_time.max(remote.ordering_time());
    record.unread_count = remote.unread_count;
    record.is_top = remote.is_top;
    record.notification_level = remote.notification_level;
    record.draft = remote.draft.clone();
    if remote.unread_count == 0 {
        record.mentioned_type = MentionedType::None;
    } else {
        record.mentioned_type = record.mentioned_type.accumulate(remote.mentioned_type);
        record.mark_read = false;
    }
}
