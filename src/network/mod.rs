mod events;

pub use events::*;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::bridge::Portal;
use crate::database::{
    DisappearingSetting, Message as DbMessage, Reaction as DbReaction, RoomType,
};
use crate::error::EventResult;
use crate::matrix::{JoinRulesContent, MemberContent, MessageContent, PowerLevelsContent};

/// What the network allows in one specific room.
#[derive(Debug, Clone, Default)]
pub struct RoomCapabilities {
    pub threads: bool,
    pub replies: bool,
    pub edits: bool,
    pub edit_max_age: Option<Duration>,
    pub edit_max_count: Option<u32>,
    pub reactions: bool,
    pub max_reactions_per_user: usize,
    pub captions: bool,
    pub location_messages: bool,
    pub delete_for_me: bool,
}

/// The remote-side author of an event.
#[derive(Debug, Clone, Default)]
pub struct EventSender {
    pub sender: String,
    /// Login id when the event was sent by a logged-in user of this bridge.
    pub sender_login: String,
    pub is_from_me: bool,
    /// In DM portals, force the sender to the portal's fixed peer.
    pub force_dm_user: bool,
}

impl EventSender {
    pub fn remote(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            ..Default::default()
        }
    }

    pub fn from_me(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            is_from_me: true,
            ..Default::default()
        }
    }
}

/// The synthetic sender attached to events forwarded through a relay.
#[derive(Debug, Clone, Default)]
pub struct OrigSender {
    pub user_mxid: String,
    pub displayname: String,
    pub disambiguated_name: String,
    pub formatted_name: String,
    pub requires_disambiguation: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Avatar {
    pub id: String,
    pub mxc: String,
    pub hash: String,
    pub remove: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    pub name: Option<String>,
    pub avatar_mxc: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChatMember {
    pub sender: EventSender,
    /// Empty means join.
    pub membership: String,
    /// When set and the current membership disagrees, the transition is skipped.
    pub prev_membership: Option<String>,
    pub power_level: Option<i64>,
    pub user_info: Option<UserInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct ChatMemberList {
    /// Whether members not listed here should be removed from the room.
    pub is_full: bool,
    /// Whether `is_this_user` should be probed for every member, for networks
    /// that can't fill `sender_login` accurately.
    pub check_all_logins: bool,
    pub total_member_count: usize,
    /// For DM portals, the id of the remote peer.
    pub other_user_id: Option<String>,
    pub members: Vec<ChatMember>,
    pub power_levels: Option<PowerLevelChanges>,
}

/// Requested power-level changes. Every change is applied only when the
/// actor outranks both the old and the new level.
#[derive(Debug, Clone, Default)]
pub struct PowerLevelChanges {
    pub events: HashMap<String, i64>,
    pub users_default: Option<i64>,
    pub events_default: Option<i64>,
    pub state_default: Option<i64>,
    pub invite: Option<i64>,
    pub kick: Option<i64>,
    pub ban: Option<i64>,
    pub redact: Option<i64>,
    pub custom: Option<fn(&mut PowerLevelsContent) -> bool>,
}

fn allow_change(new_level: i64, old_level: i64, actor_level: i64) -> bool {
    new_level <= actor_level && old_level <= actor_level
}

impl PowerLevelChanges {
    pub fn apply(&self, actor: Option<&str>, content: &mut PowerLevelsContent) -> bool {
        let mut changed = false;
        for (event_type, level) in &self.events {
            changed = content.ensure_event_level_as(actor, event_type, *level) || changed;
        }
        let actor_level = actor.map_or(crate::matrix::ACTOR_LEVEL_MAX, |a| content.get_user_level(a));
        let mut set_field = |target: &mut i64, requested: Option<i64>, changed: &mut bool| {
            if let Some(requested) = requested {
                if allow_change(requested, *target, actor_level) && *target != requested {
                    *target = requested;
                    *changed = true;
                }
            }
        };
        set_field(&mut content.users_default, self.users_default, &mut changed);
        set_field(&mut content.events_default, self.events_default, &mut changed);
        set_field(&mut content.state_default, self.state_default, &mut changed);
        set_field(&mut content.invite, self.invite, &mut changed);
        set_field(&mut content.kick, self.kick, &mut changed);
        set_field(&mut content.ban, self.ban, &mut changed);
        set_field(&mut content.redact, self.redact, &mut changed);
        if let Some(custom) = self.custom {
            changed = custom(content) || changed;
        }
        changed
    }
}

/// Per-user room settings applied through the double puppet.
#[derive(Debug, Clone, Default)]
pub struct UserLocalPortalInfo {
    pub muted_until: Option<DateTime<Utc>>,
    pub tag: Option<String>,
}

/// A full or partial snapshot of remote chat metadata. `None` fields are
/// unchanged.
#[derive(Debug, Clone, Default)]
pub struct ChatInfo {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub avatar: Option<Avatar>,
    pub members: Option<ChatMemberList>,
    pub join_rule: Option<JoinRulesContent>,
    pub room_type: Option<RoomType>,
    pub disappear: Option<DisappearingSetting>,
    pub parent_id: Option<String>,
    pub user_local: Option<UserLocalPortalInfo>,
    pub can_backfill: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ChatInfoChange {
    pub chat_info: Option<ChatInfo>,
    /// Only the changes, not the whole list. Full resyncs go through
    /// `ChatInfo::members` instead.
    pub member_changes: Option<ChatMemberList>,
}

/// A Matrix message forwarded to the network connector.
#[derive(Debug, Clone)]
pub struct MatrixMessageEvent {
    pub event_id: String,
    pub event_type: String,
    pub sender_mxid: String,
    pub timestamp: DateTime<Utc>,
    pub content: MessageContent,
    pub orig_sender: Option<OrigSender>,
    pub thread_root: Option<DbMessage>,
    pub reply_to: Option<DbMessage>,
}

/// Callback finalizing a pending message once the remote echo arrives.
/// Returns whether the row should be saved plus an optional status error.
pub type EchoHandler =
    Box<dyn FnOnce(&dyn RemoteEvent, &mut DbMessage) -> (bool, Option<crate::error::EventError>) + Send + Sync>;

/// Result of dispatching a Matrix message to the connector. The draft row is
/// persisted immediately unless `pending_transaction_id` is set, in which
/// case it waits in the pending-echo table.
pub struct MessageResponse {
    pub message: DbMessage,
    pub pending_transaction_id: Option<String>,
    pub echo_handler: Option<EchoHandler>,
}

impl MessageResponse {
    pub fn new(message: DbMessage) -> Self {
        Self {
            message,
            pending_transaction_id: None,
            echo_handler: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatrixEditEvent {
    pub event_id: String,
    pub sender_mxid: String,
    pub timestamp: DateTime<Utc>,
    pub content: MessageContent,
    pub orig_sender: Option<OrigSender>,
    pub edit_target: DbMessage,
}

#[derive(Debug, Clone)]
pub struct MatrixReactionEvent {
    pub event_id: String,
    pub sender_mxid: String,
    pub timestamp: DateTime<Utc>,
    pub emoji: String,
    pub target_message: DbMessage,
}

/// Connector-resolved identity of a Matrix reaction before dispatch.
#[derive(Debug, Clone, Default)]
pub struct ReactionPreResponse {
    pub sender_id: String,
    pub emoji_id: String,
    pub emoji: String,
    pub max_reactions: usize,
}

#[derive(Debug, Clone)]
pub struct MatrixReactionRequest {
    pub event: MatrixReactionEvent,
    pub pre: ReactionPreResponse,
    pub reaction_to_override: Option<DbReaction>,
    pub existing_reactions_to_keep: Vec<DbReaction>,
}

#[derive(Debug, Clone)]
pub struct MatrixMessageRemoveEvent {
    pub event_id: String,
    pub sender_mxid: String,
    pub orig_sender: Option<OrigSender>,
    pub target_message: DbMessage,
}

#[derive(Debug, Clone)]
pub struct MatrixReactionRemoveEvent {
    pub event_id: String,
    pub sender_mxid: String,
    pub orig_sender: Option<OrigSender>,
    pub target_reaction: DbReaction,
}

#[derive(Debug, Clone)]
pub struct MatrixReadReceiptEvent {
    pub event_id: String,
    pub receipt_timestamp: DateTime<Utc>,
    /// Timestamp the receipt resolves to: the exact message's timestamp when
    /// known, the receipt timestamp otherwise.
    pub read_up_to: DateTime<Utc>,
    pub last_read: Option<DateTime<Utc>>,
    pub exact_message: Option<DbMessage>,
}

#[derive(Debug, Clone)]
pub struct MatrixRoomNameEvent {
    pub event_id: String,
    pub name: String,
    pub prev_name: Option<String>,
    pub orig_sender: Option<OrigSender>,
}

#[derive(Debug, Clone)]
pub struct MatrixRoomTopicEvent {
    pub event_id: String,
    pub topic: String,
    pub prev_topic: Option<String>,
    pub orig_sender: Option<OrigSender>,
}

#[derive(Debug, Clone)]
pub struct MatrixRoomAvatarEvent {
    pub event_id: String,
    pub url: String,
    pub prev_url: Option<String>,
    pub orig_sender: Option<OrigSender>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub from: String,
    pub to: String,
    pub is_self: bool,
}

#[derive(Debug, Clone)]
pub struct MatrixMembershipEvent {
    pub event_id: String,
    pub sender_mxid: String,
    pub target_mxid: String,
    /// Remote id when the target is a ghost.
    pub target_ghost_id: Option<String>,
    /// Login id when the target is a logged-in Matrix user.
    pub target_login_id: Option<String>,
    pub change: MembershipChange,
    pub content: MemberContent,
    pub orig_sender: Option<OrigSender>,
}

#[async_trait]
pub trait EditHandler: Send + Sync {
    /// Returns the updated row to persist.
    async fn handle_edit(&self, portal: &Portal, evt: MatrixEditEvent) -> EventResult<DbMessage>;
}

#[async_trait]
pub trait ReactionHandler: Send + Sync {
    async fn pre_handle_reaction(
        &self,
        portal: &Portal,
        evt: &MatrixReactionEvent,
    ) -> EventResult<ReactionPreResponse>;

    /// Returns the row to upsert; unset fields are defaulted by the portal.
    async fn handle_reaction(
        &self,
        portal: &Portal,
        req: MatrixReactionRequest,
    ) -> EventResult<Option<DbReaction>>;

    async fn handle_reaction_remove(
        &self,
        portal: &Portal,
        evt: MatrixReactionRemoveEvent,
    ) -> EventResult<()>;
}

#[async_trait]
pub trait RedactionHandler: Send + Sync {
    async fn handle_message_remove(
        &self,
        portal: &Portal,
        evt: MatrixMessageRemoveEvent,
    ) -> EventResult<()>;
}

#[async_trait]
pub trait ReadReceiptHandler: Send + Sync {
    async fn handle_read_receipt(
        &self,
        portal: &Portal,
        evt: MatrixReadReceiptEvent,
    ) -> EventResult<()>;
}

#[async_trait]
pub trait TypingHandler: Send + Sync {
    async fn handle_typing(&self, portal: &Portal, is_typing: bool) -> EventResult<()>;
}

#[async_trait]
pub trait RoomNameHandler: Send + Sync {
    /// Returns whether the remote side actually changed.
    async fn handle_room_name(&self, portal: &Portal, evt: MatrixRoomNameEvent) -> EventResult<bool>;
}

#[async_trait]
pub trait RoomTopicHandler: Send + Sync {
    async fn handle_room_topic(&self, portal: &Portal, evt: MatrixRoomTopicEvent) -> EventResult<bool>;
}

#[async_trait]
pub trait RoomAvatarHandler: Send + Sync {
    async fn handle_room_avatar(&self, portal: &Portal, evt: MatrixRoomAvatarEvent) -> EventResult<bool>;
}

#[async_trait]
pub trait MarkedUnreadHandler: Send + Sync {
    async fn handle_marked_unread(&self, portal: &Portal, unread: bool) -> EventResult<()>;
}

#[async_trait]
pub trait RoomTagHandler: Send + Sync {
    async fn handle_room_tag(&self, portal: &Portal, tag: Option<String>) -> EventResult<()>;
}

#[async_trait]
pub trait MuteHandler: Send + Sync {
    async fn handle_mute(&self, portal: &Portal, muted_until: Option<DateTime<Utc>>) -> EventResult<()>;
}

#[async_trait]
pub trait MembershipHandler: Send + Sync {
    async fn handle_membership(&self, portal: &Portal, evt: MatrixMembershipEvent) -> EventResult<()>;
}

/// One login's connection to the remote network: message handling is
/// required, everything else is an optional capability probed through the
/// accessor methods.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    fn is_logged_in(&self) -> bool;

    async fn is_this_user(&self, user_id: &str) -> bool;

    async fn get_capabilities(&self, portal: &Portal) -> RoomCapabilities;

    async fn get_chat_info(&self, portal: &Portal) -> EventResult<ChatInfo>;

    async fn handle_message(
        &self,
        portal: &Portal,
        evt: MatrixMessageEvent,
    ) -> EventResult<MessageResponse>;

    fn edit_handler(&self) -> Option<&dyn EditHandler> {
        None
    }

    fn reaction_handler(&self) -> Option<&dyn ReactionHandler> {
        None
    }

    fn redaction_handler(&self) -> Option<&dyn RedactionHandler> {
        None
    }

    fn read_receipt_handler(&self) -> Option<&dyn ReadReceiptHandler> {
        None
    }

    fn typing_handler(&self) -> Option<&dyn TypingHandler> {
        None
    }

    fn room_name_handler(&self) -> Option<&dyn RoomNameHandler> {
        None
    }

    fn room_topic_handler(&self) -> Option<&dyn RoomTopicHandler> {
        None
    }

    fn room_avatar_handler(&self) -> Option<&dyn RoomAvatarHandler> {
        None
    }

    fn marked_unread_handler(&self) -> Option<&dyn MarkedUnreadHandler> {
        None
    }

    fn room_tag_handler(&self) -> Option<&dyn RoomTagHandler> {
        None
    }

    fn mute_handler(&self) -> Option<&dyn MuteHandler> {
        None
    }

    fn membership_handler(&self) -> Option<&dyn MembershipHandler> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_level_changes_apply() {
        let mut content = PowerLevelsContent::default();
        content.users.insert("@bot:x".to_string(), 9001);
        let changes = PowerLevelChanges {
            users_default: Some(10),
            invite: Some(0),
            ..Default::default()
        };
        assert!(changes.apply(Some("@bot:x"), &mut content));
        assert_eq!(content.users_default, 10);
        assert_eq!(content.invite, 0);
        // Re-applying the same changes reports no change.
        assert!(!changes.apply(Some("@bot:x"), &mut content));
    }

    #[test]
    fn test_power_level_changes_respect_actor() {
        let mut content = PowerLevelsContent::default();
        content.state_default = 100;
        let changes = PowerLevelChanges {
            state_default: Some(50),
            ..Default::default()
        };
        // Actor at 50 cannot touch a field currently at 100.
        content.users.insert("@weak:x".to_string(), 50);
        assert!(!changes.apply(Some("@weak:x"), &mut content));
        assert_eq!(content.state_default, 100);
        // No actor is unconstrained.
        assert!(changes.apply(None, &mut content));
        assert_eq!(content.state_default, 50);
    }

    #[test]
    fn test_power_level_changes_custom_hook() {
        fn bump(content: &mut PowerLevelsContent) -> bool {
            content.ensure_user_level("@extra:x", 1)
        }
        let changes = PowerLevelChanges {
            custom: Some(bump),
            ..Default::default()
        };
        let mut content = PowerLevelsContent::default();
        assert!(changes.apply(None, &mut content));
        assert_eq!(content.get_user_level("@extra:x"), 1);
    }
}
