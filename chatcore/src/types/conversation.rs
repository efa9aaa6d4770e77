use crate::error::SyncError;
use crate::types::message::CachedMessage;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum ConversationType {
    Private = 1,
    Discussion = 2,
    Group = 3,
    ChatRoom = 4,
    CustomerService = 5,
    System = 6,
    UltraGroup = 10,
}

impl ConversationType {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Conversation types this library keeps state for.
    pub fn is_supported(self) -> bool {
        matches!(
            self,
            ConversationType::Private | ConversationType::Group | ConversationType::System
        )
    }

    /// Conversation types a local user can post into.
    pub fn accepts_outgoing(self) -> bool {
        matches!(self, ConversationType::Private | ConversationType::Group)
    }
}

impl From<ConversationType> for i32 {
    fn from(value: ConversationType) -> Self {
        value as i32
    }
}

impl TryFrom<i32> for ConversationType {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => ConversationType::Private,
            2 => ConversationType::Discussion,
            3 => ConversationType::Group,
            4 => ConversationType::ChatRoom,
            5 => ConversationType::CustomerService,
            6 => ConversationType::System,
            10 => ConversationType::UltraGroup,
            other => return Err(format!("unknown conversation type {other}")),
        })
    }
}

/// Identity of a conversation. Equal iff all three fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId {
    pub target_id: String,
    pub conversation_type: ConversationType,
    #[serde(default)]
    pub channel_id: String,
}

impl ConversationId {
    pub fn new(conversation_type: ConversationType, target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            conversation_type,
            channel_id: String::new(),
        }
    }

    pub fn private(target_id: impl Into<String>) -> Self {
        Self::new(ConversationType::Private, target_id)
    }

    pub fn group(target_id: impl Into<String>) -> Self {
        Self::new(ConversationType::Group, target_id)
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = channel_id.into();
        self
    }

    pub fn key(&self) -> ConversationKey {
        ConversationKey(format!(
            "[{}][{}][{}]",
            self.target_id,
            self.conversation_type.as_i32(),
            self.channel_id
        ))
    }

    pub fn is_valid(&self) -> bool {
        !self.target_id.is_empty() && self.conversation_type.is_supported()
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(SyncError::InvalidConversation)
        }
    }

    /// Like [`validate`](Self::validate), but also rejects types that cannot
    /// carry outgoing messages.
    pub fn validate_outgoing(&self) -> Result<(), SyncError> {
        self.validate()?;
        if self.conversation_type.accepts_outgoing() {
            Ok(())
        } else {
            Err(SyncError::InvalidConversation)
        }
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Canonical map key derived from a [`ConversationId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NotificationLevel {
    AllMessages,
    #[default]
    NotSet,
    MentionsOnly,
    MentionUsersOnly,
    MentionAllOnly,
    Muted,
}

/// Summary of the unread mentions of a conversation.
///
/// Variants are ordered by priority; accumulation keeps the maximum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum MentionedType {
    #[default]
    None,
    AtAll,
    AtMe,
}

impl MentionedType {
    pub fn accumulate(self, other: MentionedType) -> MentionedType {
        self.max(other)
    }
}

/// A conversation as kept in the local list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedConversation {
    pub key: ConversationKey,
    pub id: ConversationId,
    pub name: String,
    pub portrait_uri: String,
    pub draft: String,
    pub latest_message: Option<CachedMessage>,
    pub is_top: bool,
    pub notification_level: NotificationLevel,
    pub unread_count: u32,
    pub update_time: i64,
    pub mentioned_type: MentionedType,
    pub mark_read: bool,
    pub mark_unread: bool,
}

impl CachedConversation {
    pub fn new(id: ConversationId) -> Self {
        Self {
            key: id.key(),
            name: id.target_id.clone(),
            id,
            portrait_uri: String::new(),
            draft: String::new(),
            latest_message: None,
            is_top: false,
            notification_level: NotificationLevel::default(),
            unread_count: 0,
            update_time: 0,
            mentioned_type: MentionedType::None,
            mark_read: false,
            mark_unread: false,
        }
    }

    /// Replaces the latest message unless it would move the conversation back
    /// in time. Returns true when the message was taken.
    pub fn offer_latest_message(&mut self, message: &CachedMessage) -> bool {
        if let Some(current) = &self.latest_message {
            if message.sent_time < current.sent_time {
                return false;
            }
        }
        self.latest_message = Some(message.clone());
        if message.sent_time > self.update_time {
            self.update_time = message.sent_time;
        }
        true
    }

    pub fn clear_unread(&mut self) {
        self.unread_count = 0;
        self.mentioned_type = MentionedType::None;
        self.mark_read = true;
        self.mark_unread = false;
    }
}

/// Conversation snapshot as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConversation {
    pub id: ConversationId,
    pub latest_message: Option<CachedMessage>,
    pub unread_count: u32,
    pub is_top: bool,
    pub notification_level: NotificationLevel,
    pub mentioned_type: MentionedType,
    #[serde(default)]
    pub draft: String,
    /// Server side ordering time, used when there is no latest message.
    #[serde(default)]
    pub operation_time: i64,
}

impl RemoteConversation {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            latest_message: None,
            unread_count: 0,
            is_top: false,
            notification_level: NotificationLevel::default(),
            mentioned_type: MentionedType::None,
            draft: String::new(),
            operation_time: 0,
        }
    }

    pub fn with_latest(mut self, message: CachedMessage) -> Self {
        self.latest_message = Some(message);
        self
    }

    pub fn ordering_time(&self) -> i64 {
        self.latest_message
            .as_ref()
            .map(|m| m.sent_time)
            .unwrap_or(0)
            .max(self.operation_time)
    }
}

/// Fields a remote conversation-change notification reports as updated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdatedItems {
    pub is_top: Option<bool>,
    pub notification_level: Option<NotificationLevel>,
    pub latest_message: Option<CachedMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationNotification {
    pub conversation: RemoteConversation,
    pub updated: UpdatedItems,
}

impl ConversationNotification {
    /// Notifications inherit the offline flag of the updated latest message;
    /// pin or mute only updates are never offline.
    pub fn is_offline(&self) -> bool {
        self.updated
            .latest_message
            .as_ref()
            .is_some_and(|m| m.is_offline)
    }
}

/// Display profile for a conversation's target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationProfile {
    pub id: ConversationId,
    pub name: String,
    #[serde(default)]
    pub portrait_uri: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let id = ConversationId::group("team").with_channel("ops");
        assert_eq!(id.key().as_str(), "[team][3][ops]");
        assert_eq!(ConversationId::private("bob").key().as_str(), "[bob][1][]");
    }

    #[test]
    fn test_validation() {
        assert!(ConversationId::private("bob").validate().is_ok());
        assert_eq!(
            ConversationId::private("").validate(),
            Err(SyncError::InvalidConversation)
        );
        let chatroom = ConversationId::new(ConversationType::ChatRoom, "room");
        assert_eq!(chatroom.validate(), Err(SyncError::InvalidConversation));

        let system = ConversationId::new(ConversationType::System, "notice");
        assert!(system.validate().is_ok());
        assert_eq!(
            system.validate_outgoing(),
            Err(SyncError::InvalidConversation)
        );
    }

    #[test]
    fn test_offline_flag_comes_from_updated_message() {
        let replayed =
            CachedMessage::text(ConversationId::private("bob"), "1", "bob", 100, "hi").offline();
        let mut pin = ConversationNotification {
            conversation: RemoteConversation::new(ConversationId::private("bob"))
                .with_latest(replayed.clone()),
            updated: UpdatedItems {
                is_top: Some(true),
                ..Default::default()
            },
        };
        assert!(!pin.is_offline());

        pin.updated.latest_message = Some(replayed);
        assert!(pin.is_offline());
    }

    #[test]
    fn test_mentioned_type_priority() {
        assert_eq!(
            MentionedType::AtMe.accumulate(MentionedType::AtAll),
            MentionedType::AtMe
        );
        assert_eq!(
            MentionedType::AtAll.accumulate(MentionedType::AtMe),
            MentionedType::AtMe
        );
        assert_eq!(
            MentionedType::None.accumulate(MentionedType::AtAll),
            MentionedType::AtAll
        );
    }

    #[test]
    fn test_conversation_type_serializes_as_number() {
        let json = serde_json::to_string(&ConversationId::group("g")).unwrap();
        assert!(json.contains("\"conversation_type\":3"));
        let back: ConversationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ConversationId::group("g"));
    }
}
