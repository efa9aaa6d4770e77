use crate::types::conversation::{ConversationId, MentionedType};
use serde::{Deserialize, Serialize};

/// Delivery status of a message.
///
/// Only `Sending` may become `Sent` or `Failed`, only `Sent` may become `Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SentStatus {
    #[default]
    Sending,
    Sent,
    Failed,
    Read,
}

impl SentStatus {
    pub fn can_become(self, next: SentStatus) -> bool {
        matches!(
            (self, next),
            (SentStatus::Sending, SentStatus::Sent)
                | (SentStatus::Sending, SentStatus::Failed)
                | (SentStatus::Sent, SentStatus::Read)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MessageDirection {
    #[default]
    Send,
    Receive,
}

/// Kind of a message, used for upload handling and recall detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Image,
    Gif,
    Sight,
    File,
    Combine,
    Recall,
    Custom(String),
}

impl MessageKind {
    /// Kinds whose content points at an uploaded file.
    pub fn carries_media(&self) -> bool {
        matches!(
            self,
            MessageKind::Image
                | MessageKind::Gif
                | MessageKind::Sight
                | MessageKind::File
                | MessageKind::Combine
        )
    }

    /// JSON field of the content that holds the downloadable location.
    pub fn media_url_field(&self) -> Option<&'static str> {
        match self {
            MessageKind::Image | MessageKind::Gif => Some("imageUri"),
            MessageKind::Sight | MessageKind::File | MessageKind::Combine => Some("remoteUrl"),
            _ => None,
        }
    }

    pub fn for_file_name(name: &str) -> MessageKind {
        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "gif" => MessageKind::Gif,
            "png" | "jpg" | "jpeg" | "bmp" | "webp" => MessageKind::Image,
            "mp4" | "mov" => MessageKind::Sight,
            _ => MessageKind::File,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MentionScope {
    All,
    Users,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionedInfo {
    pub scope: MentionScope,
    #[serde(default)]
    pub user_ids: Vec<String>,
}

impl MentionedInfo {
    pub fn mentioned_type_for(&self, user_id: &str) -> MentionedType {
        match self.scope {
            MentionScope::All => MentionedType::AtAll,
            MentionScope::Users if self.user_ids.iter().any(|u| u == user_id) => {
                MentionedType::AtMe
            }
            MentionScope::Users => MentionedType::None,
        }
    }
}

/// A file waiting to be uploaded before its message can be sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub name: String,
    pub size: u64,
    pub path: String,
}

impl FileAttachment {
    pub fn new(name: impl Into<String>, size: u64, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            path: path.into(),
        }
    }
}

/// Identity of a message inside one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageIdentity {
    Uid(String),
    Transaction(u64),
}

/// A message as held by the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedMessage {
    pub conversation: ConversationId,
    pub kind: MessageKind,
    pub content: serde_json::Value,
    pub message_uid: Option<String>,
    pub message_id: Option<i64>,
    /// Assigned locally; never present on messages that came from the server.
    pub transaction_id: Option<u64>,
    pub sender_user_id: String,
    pub direction: MessageDirection,
    pub sent_time: i64,
    pub sent_status: SentStatus,
    pub is_persisted: bool,
    pub is_counted: bool,
    pub is_offline: bool,
    pub mentioned: Option<MentionedInfo>,
    /// Upload percent for file messages, 100 when done and -1 on failure.
    pub progress: Option<i32>,
    pub attachment: Option<FileAttachment>,
    /// For recall notices, the uid of the message they replace.
    pub recalled_uid: Option<String>,
}

impl CachedMessage {
    /// A message received from the server.
    pub fn received(
        conversation: ConversationId,
        uid: impl Into<String>,
        sender_user_id: impl Into<String>,
        sent_time: i64,
        kind: MessageKind,
        content: serde_json::Value,
    ) -> Self {
        Self {
            conversation,
            kind,
            content,
            message_uid: Some(uid.into()),
            message_id: None,
            transaction_id: None,
            sender_user_id: sender_user_id.into(),
            direction: MessageDirection::Receive,
            sent_time,
            sent_status: SentStatus::Sent,
            is_persisted: true,
            is_counted: true,
            is_offline: false,
            mentioned: None,
            progress: None,
            attachment: None,
            recalled_uid: None,
        }
    }

    pub fn text(
        conversation: ConversationId,
        uid: impl Into<String>,
        sender_user_id: impl Into<String>,
        sent_time: i64,
        text: &str,
    ) -> Self {
        Self::received(
            conversation,
            uid,
            sender_user_id,
            sent_time,
            MessageKind::Text,
            serde_json::json!({ "content": text }),
        )
    }

    pub fn offline(mut self) -> Self {
        self.is_offline = true;
        self
    }

    pub fn with_mention(mut self, mentioned: MentionedInfo) -> Self {
        self.mentioned = Some(mentioned);
        self
    }

    pub fn identity(&self) -> Option<MessageIdentity> {
        match (&self.message_uid, self.transaction_id) {
            (Some(uid), _) => Some(MessageIdentity::Uid(uid.clone())),
            (None, Some(tid)) => Some(MessageIdentity::Transaction(tid)),
            (None, None) => None,
        }
    }

    /// Two cached messages are the same logical message when their uids match,
    /// or, before a uid is known, when their transaction ids match.
    pub fn same_message(&self, other: &CachedMessage) -> bool {
        if let (Some(a), Some(b)) = (&self.message_uid, &other.message_uid) {
            return a == b;
        }
        matches!((self.transaction_id, other.transaction_id), (Some(a), Some(b)) if a == b)
    }

    pub fn matches_identity(&self, identity: &MessageIdentity) -> bool {
        match identity {
            MessageIdentity::Uid(uid) => self.message_uid.as_deref() == Some(uid.as_str()),
            MessageIdentity::Transaction(tid) => self.transaction_id == Some(*tid),
        }
    }

    pub fn is_recall(&self) -> bool {
        self.kind == MessageKind::Recall
    }

    pub fn is_own(&self, user_id: &str) -> bool {
        self.direction == MessageDirection::Send && self.sender_user_id == user_id
    }

    pub fn mentioned_type_for(&self, user_id: &str) -> MentionedType {
        self.mentioned
            .as_ref()
            .map(|m| m.mentioned_type_for(user_id))
            .unwrap_or_default()
    }

    /// Moves to `next` if the transition is allowed.
    pub fn transition(&mut self, next: SentStatus) -> bool {
        if self.sent_status.can_become(next) {
            self.sent_status = next;
            true
        } else {
            false
        }
    }

    pub fn set_media_url(&mut self, url: &str) {
        if let Some(field) = self.kind.media_url_field() {
            if let Some(obj) = self.content.as_object_mut() {
                obj.insert(field.to_string(), serde_json::Value::String(url.to_string()));
            }
        }
    }

    pub fn media_url(&self) -> Option<&str> {
        let field = self.kind.media_url_field()?;
        self.content.get(field)?.as_str()
    }
}

/// Content a caller wants to send or insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub kind: MessageKind,
    pub content: serde_json::Value,
    pub mentioned: Option<MentionedInfo>,
    pub is_persisted: bool,
    pub is_counted: bool,
}

impl MessageDraft {
    pub fn new(kind: MessageKind, content: serde_json::Value) -> Self {
        Self {
            kind,
            content,
            mentioned: None,
            is_persisted: true,
            is_counted: true,
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new(MessageKind::Text, serde_json::json!({ "content": text }))
    }

    pub fn with_mention(mut self, mentioned: MentionedInfo) -> Self {
        self.mentioned = Some(mentioned);
        self
    }

    /// Drafts that are not persisted never enter the cache.
    pub fn transient(mut self) -> Self {
        self.is_persisted = false;
        self.is_counted = false;
        self
    }
}

/// Server confirmation of a sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub message_uid: String,
    pub sent_time: i64,
    pub message_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(tid: u64) -> CachedMessage {
        let mut m = CachedMessage::text(ConversationId::private("bob"), "x", "me", 1, "hi");
        m.message_uid = None;
        m.transaction_id = Some(tid);
        m
    }

    #[test]
    fn test_status_transitions() {
        assert!(SentStatus::Sending.can_become(SentStatus::Sent));
        assert!(SentStatus::Sending.can_become(SentStatus::Failed));
        assert!(SentStatus::Sent.can_become(SentStatus::Read));
        assert!(!SentStatus::Failed.can_become(SentStatus::Read));
        assert!(!SentStatus::Read.can_become(SentStatus::Sent));
        assert!(!SentStatus::Sent.can_become(SentStatus::Failed));
    }

    #[test]
    fn test_identity_prefers_uid() {
        let mut m = local(7);
        assert_eq!(m.identity(), Some(MessageIdentity::Transaction(7)));
        m.message_uid = Some("u1".into());
        assert_eq!(m.identity(), Some(MessageIdentity::Uid("u1".into())));
        assert!(m.same_message(&local(7)));
        assert!(!local(7).same_message(&local(8)));
    }

    #[test]
    fn test_mention_resolution() {
        let info = MentionedInfo {
            scope: MentionScope::Users,
            user_ids: vec!["me".into()],
        };
        assert_eq!(info.mentioned_type_for("me"), MentionedType::AtMe);
        assert_eq!(info.mentioned_type_for("other"), MentionedType::None);
        let all = MentionedInfo {
            scope: MentionScope::All,
            user_ids: vec![],
        };
        assert_eq!(all.mentioned_type_for("me"), MentionedType::AtAll);
    }

    #[test]
    fn test_media_url_field_by_kind() {
        let mut m = CachedMessage::received(
            ConversationId::private("bob"),
            "u",
            "me",
            1,
            MessageKind::Image,
            serde_json::json!({}),
        );
        m.set_media_url("https://cdn/x.png");
        assert_eq!(m.media_url(), Some("https://cdn/x.png"));
        assert_eq!(MessageKind::for_file_name("a.GIF"), MessageKind::Gif);
        assert_eq!(MessageKind::for_file_name("report.pdf"), MessageKind::File);
    }
}
