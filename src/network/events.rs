use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::bridge::Portal;
use crate::database::{DisappearingSetting, Message as DbMessage};
use crate::error::EventResult;
use crate::matrix::{MatrixApi, MessageContent};

use super::{ChatInfo, ChatInfoChange, EventSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEventType {
    Unknown,
    Message,
    MessageUpsert,
    Edit,
    Reaction,
    ReactionRemove,
    ReactionSync,
    MessageRemove,
    ReadReceipt,
    MarkUnread,
    DeliveryReceipt,
    Typing,
    ChatInfoChange,
    ChatResync,
    ChatDelete,
}

impl RemoteEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Message => "message",
            Self::MessageUpsert => "message_upsert",
            Self::Edit => "edit",
            Self::Reaction => "reaction",
            Self::ReactionRemove => "reaction_remove",
            Self::ReactionSync => "reaction_sync",
            Self::MessageRemove => "message_remove",
            Self::ReadReceipt => "read_receipt",
            Self::MarkUnread => "mark_unread",
            Self::DeliveryReceipt => "delivery_receipt",
            Self::Typing => "typing",
            Self::ChatInfoChange => "chat_info_change",
            Self::ChatResync => "chat_resync",
            Self::ChatDelete => "chat_delete",
        }
    }
}

impl std::fmt::Display for RemoteEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An event received from the remote network. The dispatcher probes each
/// optional facet through the `as_*` accessors; implementations return
/// `Some(self)` for the variants they support.
#[async_trait]
pub trait RemoteEvent: Send + Sync {
    fn event_type(&self) -> RemoteEventType;

    fn sender(&self) -> EventSender;

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Whether this event is allowed to create the Matrix room when it
    /// arrives for a portal that doesn't have one yet.
    fn should_create_portal(&self) -> bool {
        false
    }

    /// Extra key/value pairs for the handler's log line.
    fn add_log_context(&self, _fields: &mut Vec<(&'static str, String)>) {}

    /// Hook invoked before dispatch, after portal creation.
    async fn pre_handle(&self, _portal: &Portal) {}

    fn as_message(&self) -> Option<&dyn RemoteMessage> {
        None
    }

    fn as_edit(&self) -> Option<&dyn RemoteEdit> {
        None
    }

    fn as_reaction(&self) -> Option<&dyn RemoteReaction> {
        None
    }

    fn as_reaction_remove(&self) -> Option<&dyn RemoteReactionRemove> {
        None
    }

    fn as_reaction_sync(&self) -> Option<&dyn RemoteReactionSync> {
        None
    }

    fn as_message_remove(&self) -> Option<&dyn RemoteMessageRemove> {
        None
    }

    fn as_read_receipt(&self) -> Option<&dyn RemoteReadReceipt> {
        None
    }

    fn as_mark_unread(&self) -> Option<&dyn RemoteMarkUnread> {
        None
    }

    fn as_delivery_receipt(&self) -> Option<&dyn RemoteDeliveryReceipt> {
        None
    }

    fn as_typing(&self) -> Option<&dyn RemoteTyping> {
        None
    }

    fn as_chat_info_change(&self) -> Option<&dyn RemoteChatInfoChange> {
        None
    }

    fn as_chat_resync(&self) -> Option<&dyn RemoteChatResync> {
        None
    }
}

/// A reference to a remote message, optionally narrowed to one part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyRef {
    pub message_id: String,
    pub part_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConvertedMessagePart {
    pub part_id: String,
    pub event_type: String,
    pub content: MessageContent,
    pub extra: Option<serde_json::Map<String, serde_json::Value>>,
    /// Track the part in the database without emitting a Matrix event.
    pub dont_bridge: bool,
    pub metadata: String,
}

impl ConvertedMessagePart {
    pub fn text(part_id: impl Into<String>, content: MessageContent) -> Self {
        Self {
            part_id: part_id.into(),
            event_type: crate::matrix::EVENT_MESSAGE.to_string(),
            content,
            extra: None,
            dont_bridge: false,
            metadata: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConvertedMessage {
    pub parts: Vec<ConvertedMessagePart>,
    pub thread_root: Option<String>,
    pub reply_to: Option<ReplyRef>,
    pub disappear: Option<DisappearingSetting>,
}

/// One edited part: the updated row plus the replacement content.
#[derive(Debug, Clone)]
pub struct ConvertedEditPart {
    pub part: DbMessage,
    pub event_type: String,
    pub content: MessageContent,
    pub top_level_extra: Option<serde_json::Map<String, serde_json::Value>>,
    pub new_content_extra: Option<serde_json::Map<String, serde_json::Value>>,
    pub dont_bridge: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConvertedEdit {
    pub modified_parts: Vec<ConvertedEditPart>,
    pub deleted_parts: Vec<DbMessage>,
    pub added_parts: Option<ConvertedMessage>,
}

pub struct UpsertResult {
    pub save_parts: bool,
    pub sub_events: Vec<Box<dyn RemoteEvent>>,
    pub continue_message_handling: bool,
}

impl Default for UpsertResult {
    fn default() -> Self {
        Self {
            save_parts: false,
            sub_events: Vec::new(),
            continue_message_handling: false,
        }
    }
}

#[async_trait]
pub trait RemoteMessage: RemoteEvent {
    fn message_id(&self) -> String;

    /// Transaction id correlating this event with a send we initiated.
    fn transaction_id(&self) -> Option<String> {
        None
    }

    async fn convert(
        &self,
        portal: &Portal,
        intent: &Arc<dyn MatrixApi>,
    ) -> EventResult<ConvertedMessage>;

    fn as_upsert(&self) -> Option<&dyn RemoteMessageUpsert> {
        None
    }
}

#[async_trait]
pub trait RemoteMessageUpsert: RemoteMessage {
    async fn handle_existing(
        &self,
        portal: &Portal,
        intent: &Arc<dyn MatrixApi>,
        existing: &mut [DbMessage],
    ) -> EventResult<UpsertResult>;
}

#[async_trait]
pub trait RemoteEdit: RemoteEvent {
    fn target_message(&self) -> String;

    /// Target rows bundled with the event, skipping the database lookup.
    fn target_db_messages(&self) -> Option<Vec<DbMessage>> {
        None
    }

    async fn convert_edit(
        &self,
        portal: &Portal,
        intent: &Arc<dyn MatrixApi>,
        existing: &[DbMessage],
    ) -> EventResult<ConvertedEdit>;
}

pub trait RemoteReaction: RemoteEvent {
    fn target_message(&self) -> String;

    fn target_part(&self) -> Option<String> {
        None
    }

    /// `(emoji, emoji id)`; the id is empty for emoji-keyed networks.
    fn reaction_emoji(&self) -> (String, String);

    fn reaction_extra_content(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        None
    }

    fn reaction_metadata(&self) -> String {
        String::new()
    }
}

pub trait RemoteReactionRemove: RemoteEvent {
    fn target_message(&self) -> String;

    fn target_part(&self) -> Option<String> {
        None
    }

    fn removed_emoji_id(&self) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct SyncedReaction {
    pub sender: EventSender,
    pub emoji_id: String,
    pub emoji: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub extra_content: Option<serde_json::Map<String, serde_json::Value>>,
    pub metadata: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReactionSyncUser {
    pub reactions: Vec<SyncedReaction>,
    /// Whether reactions absent from this snapshot should be removed.
    pub has_all_reactions: bool,
    /// Per-user cap enforced when the snapshot is partial.
    pub max_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReactionSyncData {
    pub users: HashMap<String, ReactionSyncUser>,
    /// Whether users absent from this snapshot should be fully cleared.
    pub has_all_users: bool,
}

pub trait RemoteReactionSync: RemoteEvent {
    fn target_message(&self) -> String;

    fn target_part(&self) -> Option<String> {
        None
    }

    fn reactions(&self) -> ReactionSyncData;
}

pub trait RemoteMessageRemove: RemoteEvent {
    fn target_message(&self) -> String;
}

pub trait RemoteReadReceipt: RemoteEvent {
    fn last_receipt_target(&self) -> Option<String> {
        None
    }

    fn receipt_targets(&self) -> Vec<String> {
        Vec::new()
    }

    fn read_up_to(&self) -> Option<DateTime<Utc>> {
        None
    }
}

pub trait RemoteMarkUnread: RemoteEvent {
    fn unread(&self) -> bool;
}

pub trait RemoteDeliveryReceipt: RemoteEvent {
    fn receipt_targets(&self) -> Vec<String>;
}

pub trait RemoteTyping: RemoteEvent {
    fn timeout(&self) -> Duration;

    fn typing_type(&self) -> crate::matrix::TypingType {
        crate::matrix::TypingType::Text
    }
}

#[async_trait]
pub trait RemoteChatInfoChange: RemoteEvent {
    async fn get_chat_info_change(&self) -> EventResult<ChatInfoChange>;
}

#[async_trait]
pub trait RemoteChatResync: RemoteEvent {
    async fn get_chat_info(&self, _portal: &Portal) -> EventResult<Option<ChatInfo>> {
        Ok(None)
    }

    /// Whether forward backfill is needed given the latest bridged message.
    async fn check_needs_backfill(&self, _latest: Option<&DbMessage>) -> EventResult<bool> {
        Ok(false)
    }
}
