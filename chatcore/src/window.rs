//! Contiguous, time-bounded slice of one conversation's history.
//!
//! A window holds messages sorted ascending by `sent_time`, unique by
//! identity, all within `[start_time, end_time]`. A `start_time` of `None`
//! means the lower bound has not been anchored yet. Merges widen the bounds one tick
//! past the merged messages so a repeated fetch at the boundary is neither
//! lost nor duplicated.
//!
//! Direction follows the history API: "forward" walks into older history,
//! "backward" towards the present.

use crate::types::message::{CachedMessage, MessageIdentity, SentMessage, SentStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct MessageWindow {
    messages: Vec<CachedMessage>,
    start_time: Option<i64>,
    end_time: i64,
    pub has_more_before_start: bool,
    pub has_more_after_end: bool,
}

/// Messages served from a window for one history request.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSlice {
    pub messages: Vec<CachedMessage>,
    /// More matching messages exist in the window beyond this slice.
    pub truncated: bool,
}

impl MessageWindow {
    pub fn new(end_time: i64, has_more_after_end: bool, has_more_before_start: bool) -> Self {
        Self {
            messages: Vec::new(),
            start_time: None,
            end_time,
            has_more_before_start,
            has_more_after_end,
        }
    }

    pub fn messages(&self) -> &[CachedMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn start_time(&self) -> Option<i64> {
        self.start_time
    }

    pub fn end_time(&self) -> i64 {
        self.end_time
    }

    pub fn latest(&self) -> Option<&CachedMessage> {
        self.messages.last()
    }

    pub fn covers(&self, timestamp: i64) -> bool {
        self.start_time.is_none_or(|start| start <= timestamp) && timestamp <= self.end_time
    }

    /// Moves the lower bound below `timestamp`, used when a caller anchors a
    /// newer-history request before the first cached message.
    pub fn lower_start_to(&mut self, timestamp: i64) {
        if self.start_time.is_none_or(|start| timestamp < start) {
            self.start_time = Some(timestamp);
        }
    }

    /// Pulls `end_time` up to just past the newest cached message.
    pub fn align_end_to_latest(&mut self) -> i64 {
        if let Some(last) = self.messages.last() {
            if last.sent_time >= self.end_time {
                self.end_time = last.sent_time + 1;
            }
        }
        self.end_time
    }

    /// Merges older history. Returns the number of messages actually added.
    pub fn merge_forward<I>(&mut self, messages: I) -> usize
    where
        I: IntoIterator<Item = CachedMessage>,
    {
        self.merge(messages)
    }

    /// Merges newer history. Returns the number of messages actually added.
    pub fn merge_backward<I>(&mut self, messages: I) -> usize
    where
        I: IntoIterator<Item = CachedMessage>,
    {
        self.merge(messages)
    }

    fn merge<I>(&mut self, messages: I) -> usize
    where
        I: IntoIterator<Item = CachedMessage>,
    {
        let mut added = 0;
        for message in messages {
            if self.messages.iter().any(|m| m.same_message(&message)) {
                continue;
            }
            let time = message.sent_time;
            self.insert_sorted(message);
            self.cover(time);
            added += 1;
        }
        added
    }

    fn insert_sorted(&mut self, message: CachedMessage) {
        let at = self
            .messages
            .partition_point(|m| m.sent_time <= message.sent_time);
        self.messages.insert(at, message);
    }

    fn cover(&mut self, time: i64) {
        if self.start_time.is_none_or(|start| time - 1 < start) {
            self.start_time = Some(time - 1);
        }
        if time + 1 > self.end_time {
            self.end_time = time + 1;
        }
    }

    /// Drops all messages and re-anchors the window at `anchor_time`, marking
    /// everything before it as unknown.
    pub fn reset_at(&mut self, anchor_time: i64) {
        self.messages.clear();
        self.start_time = Some(anchor_time);
        self.end_time = anchor_time;
        self.has_more_before_start = true;
        self.has_more_after_end = false;
    }

    /// Inserts a locally created message. A window that is not connected to
    /// the present is discarded first, so the cache never holds a silent gap.
    /// Returns true when the window was reset.
    pub fn insert_local(&mut self, message: CachedMessage) -> bool {
        let reset = self.has_more_after_end;
        if reset {
            self.reset_at(message.sent_time);
        }
        self.merge_backward([message]);
        reset
    }

    pub fn find(&self, identity: &MessageIdentity) -> Option<&CachedMessage> {
        self.messages.iter().find(|m| m.matches_identity(identity))
    }

    pub fn find_transaction(&self, transaction_id: u64) -> Option<&CachedMessage> {
        self.find(&MessageIdentity::Transaction(transaction_id))
    }

    fn index_of(&self, identity: &MessageIdentity) -> Option<usize> {
        self.messages.iter().position(|m| m.matches_identity(identity))
    }

    pub fn remove(&mut self, identity: &MessageIdentity) -> Option<CachedMessage> {
        let index = self.index_of(identity)?;
        Some(self.messages.remove(index))
    }

    /// Puts `replacement` exactly where the identified message was. The
    /// replacement inherits the original's `sent_time`, so ordering is kept.
    pub fn replace_in_place(
        &mut self,
        identity: &MessageIdentity,
        mut replacement: CachedMessage,
    ) -> Option<(CachedMessage, CachedMessage)> {
        let index = self.index_of(identity)?;
        replacement.sent_time = self.messages[index].sent_time;
        let original = std::mem::replace(&mut self.messages[index], replacement.clone());
        Some((original, replacement))
    }

    /// Applies `update` to the identified message. The closure must not change
    /// `sent_time`; use [`confirm_sent`](Self::confirm_sent) for that.
    pub fn update<F>(&mut self, identity: &MessageIdentity, update: F) -> Option<CachedMessage>
    where
        F: FnOnce(&mut CachedMessage),
    {
        let index = self.index_of(identity)?;
        let message = &mut self.messages[index];
        let sent_time = message.sent_time;
        update(message);
        message.sent_time = sent_time;
        Some(message.clone())
    }

    /// Applies the server confirmation to a pending message, moving it to the
    /// position matching the server-assigned time.
    pub fn confirm_sent(&mut self, transaction_id: u64, sent: &SentMessage) -> Option<CachedMessage> {
        let index = self.index_of(&MessageIdentity::Transaction(transaction_id))?;
        let mut message = self.messages.remove(index);
        message.transition(SentStatus::Sent);
        message.message_uid = Some(sent.message_uid.clone());
        message.message_id = sent.message_id.or(message.message_id);
        message.sent_time = sent.sent_time;
        let confirmed = message.clone();
        self.insert_sorted(message);
        self.cover(sent.sent_time);
        Some(confirmed)
    }

    /// Marks own sent messages up to `end_time` as read, walking back from the
    /// newest and stopping at the first own message that is already read.
    pub fn fold_read_receipt(&mut self, end_time: i64, self_user_id: &str) -> Vec<CachedMessage> {
        let mut changed = Vec::new();
        for message in self.messages.iter_mut().rev() {
            if !message.is_own(self_user_id) {
                continue;
            }
            match message.sent_status {
                SentStatus::Sending | SentStatus::Failed => continue,
                SentStatus::Read => break,
                SentStatus::Sent => {
                    if message.sent_time <= end_time {
                        message.sent_status = SentStatus::Read;
                        changed.push(message.clone());
                    }
                }
            }
        }
        changed.reverse();
        changed
    }

    /// Marks one own message as read, as reported by a group receipt.
    pub fn mark_read_by_uid(&mut self, uid: &str, self_user_id: &str) -> Option<CachedMessage> {
        let message = self
            .messages
            .iter_mut()
            .find(|m| m.message_uid.as_deref() == Some(uid))?;
        if !message.is_own(self_user_id) || !message.transition(SentStatus::Read) {
            return None;
        }
        Some(message.clone())
    }

    /// Up to `limit` newest messages strictly older than `timestamp`.
    pub fn older_than(&self, timestamp: i64, limit: usize) -> WindowSlice {
        let end = self.messages.partition_point(|m| m.sent_time < timestamp);
        let begin = end.saturating_sub(limit);
        WindowSlice {
            messages: self.messages[begin..end].to_vec(),
            truncated: begin > 0,
        }
    }

    /// Up to `limit` oldest messages strictly newer than `timestamp`.
    pub fn newer_than(&self, timestamp: i64, limit: usize) -> WindowSlice {
        let begin = self.messages.partition_point(|m| m.sent_time <= timestamp);
        let end = (begin + limit).min(self.messages.len());
        WindowSlice {
            messages: self.messages[begin..end].to_vec(),
            truncated: end < self.messages.len(),
        }
    }

    /// Checks the ordering, uniqueness and bounds invariants.
    pub fn is_consistent(&self) -> bool {
        let sorted = self
            .messages
            .windows(2)
            .all(|pair| pair[0].sent_time <= pair[1].sent_time);
        let unique = self.messages.iter().enumerate().all(|(i, m)| {
            self.messages[i + 1..]
                .iter()
                .all(|other| !other.same_message(m))
        });
        let bounded = self
            .messages
            .iter()
            .all(|m| self.covers(m.sent_time));
        sorted && unique && bounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::conversation::ConversationId;

    fn msg(uid: &str, t: i64) -> CachedMessage {
        CachedMessage::text(ConversationId::private("bob"), uid, "bob", t, uid)
    }

    fn own(uid: &str, t: i64, status: SentStatus) -> CachedMessage {
        let mut m = msg(uid, t);
        m.sender_user_id = "me".into();
        m.direction = crate::types::message::MessageDirection::Send;
        m.sent_status = status;
        m
    }

    fn pending(tid: u64, t: i64) -> CachedMessage {
        let mut m = own("", t, SentStatus::Sending);
        m.message_uid = None;
        m.transaction_id = Some(tid);
        m
    }

    fn times(w: &MessageWindow) -> Vec<i64> {
        w.messages().iter().map(|m| m.sent_time).collect()
    }

    #[test]
    fn test_merges_keep_window_contiguous() {
        let mut w = MessageWindow::new(1000, false, true);
        w.merge_forward(vec![msg("c", 300), msg("d", 400)]);
        w.merge_backward(vec![msg("e", 1500), msg("d", 400)]);
        w.merge_forward(vec![msg("a", 100), msg("b", 200), msg("c", 300)]);

        assert_eq!(times(&w), vec![100, 200, 300, 400, 1500]);
        assert_eq!(w.start_time(), Some(99));
        assert_eq!(w.end_time(), 1501);
        assert!(w.is_consistent());
    }

    #[test]
    fn test_bounds_hold_near_time_zero() {
        let mut w = MessageWindow::new(0, false, true);
        w.merge_forward(vec![msg("one", 1)]);
        assert_eq!(w.start_time(), Some(0));
        assert_eq!(w.end_time(), 2);

        w.merge_backward(vec![msg("late", 500)]);
        assert_eq!(w.start_time(), Some(0));
        assert!(w.is_consistent());

        w.merge_forward(vec![msg("zero", 0)]);
        assert_eq!(times(&w), vec![0, 1, 500]);
        assert_eq!(w.start_time(), Some(-1));
        assert!(w.is_consistent());
    }

    #[test]
    fn test_merge_out_of_order_input() {
        let mut w = MessageWindow::new(0, false, true);
        let added = w.merge_backward(vec![msg("z", 900), msg("x", 100), msg("y", 500)]);
        assert_eq!(added, 3);
        assert_eq!(times(&w), vec![100, 500, 900]);
        assert!(w.is_consistent());
    }

    #[test]
    fn test_equal_times_keep_arrival_order() {
        let mut w = MessageWindow::new(0, false, true);
        w.merge_backward(vec![msg("first", 100), msg("second", 100)]);
        let uids: Vec<_> = w
            .messages()
            .iter()
            .map(|m| m.message_uid.clone().unwrap())
            .collect();
        assert_eq!(uids, vec!["first", "second"]);
    }

    #[test]
    fn test_serves_page_from_cache() {
        let mut w = MessageWindow::new(500, false, false);
        w.merge_forward((0..20).map(|i| msg(&format!("m{i}"), 101 + i * 10)));
        assert!(w.covers(500));

        let slice = w.older_than(500, 30);
        assert_eq!(slice.messages.len(), 20);
        assert!(!slice.truncated);

        let slice = w.older_than(500, 5);
        assert_eq!(slice.messages.len(), 5);
        assert_eq!(slice.messages[4].sent_time, 291);
        assert!(slice.truncated);

        let slice = w.newer_than(101, 3);
        assert_eq!(
            slice.messages.iter().map(|m| m.sent_time).collect::<Vec<_>>(),
            vec![111, 121, 131]
        );
    }

    #[test]
    fn test_local_insert_resets_stale_window() {
        let mut w = MessageWindow::new(500, true, false);
        w.merge_forward(vec![msg("a", 100), msg("b", 200)]);

        let reset = w.insert_local(pending(1, 9000));
        assert!(reset);
        assert_eq!(w.len(), 1);
        assert!(w.has_more_before_start);
        assert!(!w.has_more_after_end);
        assert!(w.is_consistent());
    }

    #[test]
    fn test_local_insert_appends_to_live_window() {
        let mut w = MessageWindow::new(500, false, false);
        w.merge_forward(vec![msg("a", 100)]);
        assert!(!w.insert_local(pending(1, 700)));
        assert_eq!(times(&w), vec![100, 700]);
        assert_eq!(w.end_time(), 701);
    }

    #[test]
    fn test_recall_replaces_in_place() {
        let mut w = MessageWindow::new(0, false, true);
        w.merge_backward(vec![msg("a", 100), msg("b", 200), msg("c", 300)]);

        let mut notice = msg("r", 999);
        notice.kind = crate::types::message::MessageKind::Recall;
        let (original, placed) = w
            .replace_in_place(&MessageIdentity::Uid("b".into()), notice)
            .unwrap();
        assert_eq!(original.message_uid.as_deref(), Some("b"));
        assert_eq!(placed.sent_time, 200);
        assert_eq!(w.messages()[1].message_uid.as_deref(), Some("r"));
        assert!(w.is_consistent());

        assert!(w.remove(&MessageIdentity::Uid("a".into())).is_some());
        assert!(w.remove(&MessageIdentity::Uid("a".into())).is_none());
    }

    #[test]
    fn test_confirm_sent_repositions() {
        let mut w = MessageWindow::new(0, false, true);
        w.merge_backward(vec![msg("a", 100), pending(7, 150), msg("b", 200)]);

        let confirmed = w
            .confirm_sent(
                7,
                &SentMessage {
                    message_uid: "srv".into(),
                    sent_time: 250,
                    message_id: Some(3),
                },
            )
            .unwrap();
        assert_eq!(confirmed.sent_status, SentStatus::Sent);
        assert_eq!(times(&w), vec![100, 200, 250]);
        assert_eq!(w.messages()[2].transaction_id, Some(7));
        assert!(w.is_consistent());
    }

    #[test]
    fn test_read_receipt_fold_is_monotonic() {
        let mut w = MessageWindow::new(0, false, true);
        w.merge_backward(vec![
            own("a", 100, SentStatus::Sent),
            msg("x", 150),
            own("b", 200, SentStatus::Sent),
            own("c", 300, SentStatus::Failed),
            own("d", 400, SentStatus::Sent),
        ]);

        let changed = w.fold_read_receipt(250, "me");
        assert_eq!(
            changed
                .iter()
                .map(|m| m.message_uid.clone().unwrap())
                .collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        // An older receipt after a newer one changes nothing.
        assert!(w.fold_read_receipt(120, "me").is_empty());

        let changed = w.fold_read_receipt(500, "me");
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].message_uid.as_deref(), Some("d"));
        assert_eq!(w.messages()[3].sent_status, SentStatus::Failed);
        assert!(
            w.messages()
                .iter()
                .filter(|m| m.is_own("me") && m.sent_time <= 250)
                .all(|m| m.sent_status == SentStatus::Read)
        );
    }

    #[test]
    fn test_group_receipt_marks_single_message() {
        let mut w = MessageWindow::new(0, false, true);
        w.merge_backward(vec![own("a", 100, SentStatus::Sent), msg("x", 150)]);
        assert!(w.mark_read_by_uid("x", "me").is_none());
        let read = w.mark_read_by_uid("a", "me").unwrap();
        assert_eq!(read.sent_status, SentStatus::Read);
        assert!(w.mark_read_by_uid("a", "me").is_none());
    }

    #[test]
    fn test_align_end_to_latest() {
        let mut w = MessageWindow::new(100, false, true);
        w.merge_backward(vec![msg("a", 300)]);
        assert_eq!(w.align_end_to_latest(), 301);
    }
}
