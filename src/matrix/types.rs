use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::EventError;

pub const EVENT_MESSAGE: &str = "m.room.message";
pub const EVENT_STICKER: &str = "m.sticker";
pub const EVENT_REACTION: &str = "m.reaction";
pub const EVENT_REDACTION: &str = "m.room.redaction";
pub const STATE_ROOM_NAME: &str = "m.room.name";
pub const STATE_TOPIC: &str = "m.room.topic";
pub const STATE_ROOM_AVATAR: &str = "m.room.avatar";
pub const STATE_MEMBER: &str = "m.room.member";
pub const STATE_POWER_LEVELS: &str = "m.room.power_levels";
pub const STATE_JOIN_RULES: &str = "m.room.join_rules";
pub const STATE_SPACE_PARENT: &str = "m.space.parent";
pub const STATE_SPACE_CHILD: &str = "m.space.child";
pub const STATE_TOMBSTONE: &str = "m.room.tombstone";
pub const STATE_SERVER_ACL: &str = "m.room.server_acl";
pub const STATE_ENCRYPTION: &str = "m.room.encryption";
pub const STATE_BRIDGE: &str = "m.bridge";
pub const STATE_HALF_SHOT_BRIDGE: &str = "uk.half-shot.bridge";
pub const STATE_FUNCTIONAL_MEMBERS: &str = "io.element.functional_members";
pub const EPHEMERAL_TYPING: &str = "m.typing";
pub const EPHEMERAL_RECEIPT: &str = "m.receipt";
pub const ACCOUNT_DATA_MARKED_UNREAD: &str = "m.marked_unread";
pub const ACCOUNT_DATA_ROOM_TAGS: &str = "m.tag";
pub const ACCOUNT_DATA_MUTE: &str = "com.beeper.mute";

pub const MEMBERSHIP_JOIN: &str = "join";
pub const MEMBERSHIP_LEAVE: &str = "leave";
pub const MEMBERSHIP_INVITE: &str = "invite";
pub const MEMBERSHIP_BAN: &str = "ban";

/// A Matrix event as delivered by the homeserver transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub origin_server_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<String>,
}

impl MatrixEvent {
    pub fn is_ephemeral(&self) -> bool {
        self.event_type == EPHEMERAL_TYPING || self.event_type == EPHEMERAL_RECEIPT
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InReplyTo {
    pub event_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelatesTo {
    #[serde(rename = "rel_type", skip_serializing_if = "Option::is_none")]
    pub rel_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(rename = "m.in_reply_to", skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<InReplyTo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_falling_back: Option<bool>,
}

pub const REL_THREAD: &str = "m.thread";
pub const REL_ANNOTATION: &str = "m.annotation";
pub const REL_REPLACE: &str = "m.replace";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mentions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub room: bool,
}

impl Mentions {
    pub fn add(&mut self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        if !self.user_ids.contains(&user_id) {
            self.user_ids.push(user_id);
        }
    }
}

pub const MSG_TEXT: &str = "m.text";
pub const MSG_NOTICE: &str = "m.notice";
pub const MSG_EMOTE: &str = "m.emote";
pub const MSG_IMAGE: &str = "m.image";
pub const MSG_AUDIO: &str = "m.audio";
pub const MSG_VIDEO: &str = "m.video";
pub const MSG_FILE: &str = "m.file";
pub const MSG_LOCATION: &str = "m.location";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default)]
    pub msgtype: String,
    #[serde(default)]
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
    #[serde(rename = "m.relates_to", skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<RelatesTo>,
    #[serde(rename = "m.mentions", skip_serializing_if = "Option::is_none")]
    pub mentions: Option<Mentions>,
    #[serde(rename = "m.new_content", skip_serializing_if = "Option::is_none")]
    pub new_content: Option<Box<MessageContent>>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msgtype: MSG_TEXT.to_string(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn notice(body: impl Into<String>) -> Self {
        Self {
            msgtype: MSG_NOTICE.to_string(),
            body: body.into(),
            ..Default::default()
        }
    }

    fn relation(&self, rel_type: &str) -> Option<&str> {
        let rel = self.relates_to.as_ref()?;
        if rel.rel_type.as_deref() == Some(rel_type) {
            rel.event_id.as_deref()
        } else {
            None
        }
    }

    /// The edit target, if this content replaces an earlier event.
    pub fn replace_id(&self) -> Option<&str> {
        self.relation(REL_REPLACE)
    }

    pub fn thread_parent(&self) -> Option<&str> {
        self.relation(REL_THREAD)
    }

    /// The reply target, including thread fallback replies.
    pub fn reply_to(&self) -> Option<&str> {
        self.relates_to
            .as_ref()?
            .in_reply_to
            .as_ref()
            .map(|r| r.event_id.as_str())
    }

    /// The reply target, excluding the automatic thread fallback.
    pub fn non_fallback_reply_to(&self) -> Option<&str> {
        let rel = self.relates_to.as_ref()?;
        if rel.rel_type.as_deref() == Some(REL_THREAD) && rel.is_falling_back.unwrap_or(false) {
            return None;
        }
        rel.in_reply_to.as_ref().map(|r| r.event_id.as_str())
    }

    pub fn set_thread(&mut self, root: impl Into<String>, prev: impl Into<String>) {
        let rel = self.relates_to.get_or_insert_with(Default::default);
        rel.rel_type = Some(REL_THREAD.to_string());
        rel.event_id = Some(root.into());
        if rel.in_reply_to.is_none() {
            rel.in_reply_to = Some(InReplyTo { event_id: prev.into() });
            rel.is_falling_back = Some(true);
        }
    }

    pub fn set_reply(&mut self, event_id: impl Into<String>) {
        let rel = self.relates_to.get_or_insert_with(Default::default);
        rel.in_reply_to = Some(InReplyTo { event_id: event_id.into() });
        rel.is_falling_back = None;
    }

    pub fn set_edit(&mut self, target: impl Into<String>) {
        let mut inner = self.clone();
        inner.relates_to = None;
        inner.mentions = None;
        self.new_content = Some(Box::new(inner));
        self.body = format!("* {}", self.body);
        if let Some(formatted) = &self.formatted_body {
            self.formatted_body = Some(format!("* {}", formatted));
        }
        let rel = self.relates_to.get_or_insert_with(Default::default);
        rel.rel_type = Some(REL_REPLACE.to_string());
        rel.event_id = Some(target.into());
        rel.in_reply_to = None;
    }

    pub fn add_mention(&mut self, user_id: impl Into<String>) {
        self.mentions.get_or_insert_with(Default::default).add(user_id);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionContent {
    #[serde(rename = "m.relates_to")]
    pub relates_to: RelatesTo,
}

impl ReactionContent {
    pub fn annotation(event_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            relates_to: RelatesTo {
                rel_type: Some(REL_ANNOTATION.to_string()),
                event_id: Some(event_id.into()),
                key: Some(key.into()),
                in_reply_to: None,
                is_falling_back: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionContent {
    pub redacts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberContent {
    pub membership: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl MemberContent {
    pub fn new(membership: impl Into<String>) -> Self {
        Self {
            membership: membership.into(),
            displayname: None,
            avatar_url: None,
            reason: None,
        }
    }

    pub fn leave() -> Self {
        Self::new(MEMBERSHIP_LEAVE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomNameContent {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicContent {
    pub topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvatarContent {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingContent {
    #[serde(default)]
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkedUnreadContent {
    #[serde(default)]
    pub unread: bool,
}

fn default_level() -> i64 {
    0
}
fn default_moderation_level() -> i64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerLevelsContent {
    #[serde(default = "default_level")]
    pub users_default: i64,
    #[serde(default = "default_level")]
    pub events_default: i64,
    #[serde(default = "default_moderation_level")]
    pub state_default: i64,
    #[serde(default = "default_moderation_level")]
    pub invite: i64,
    #[serde(default = "default_moderation_level")]
    pub kick: i64,
    #[serde(default = "default_moderation_level")]
    pub ban: i64,
    #[serde(default = "default_moderation_level")]
    pub redact: i64,
    #[serde(default)]
    pub users: HashMap<String, i64>,
    #[serde(default)]
    pub events: HashMap<String, i64>,
}

impl Default for PowerLevelsContent {
    fn default() -> Self {
        Self {
            users_default: 0,
            events_default: 0,
            state_default: 50,
            invite: 50,
            kick: 50,
            ban: 50,
            redact: 50,
            users: HashMap::new(),
            events: HashMap::new(),
        }
    }
}

/// Actor level used when no actor is supplied (the bot acts unconstrained).
pub const ACTOR_LEVEL_MAX: i64 = (1 << 31) - 1;

impl PowerLevelsContent {
    pub fn get_user_level(&self, user_id: &str) -> i64 {
        self.users.get(user_id).copied().unwrap_or(self.users_default)
    }

    pub fn get_event_level(&self, event_type: &str) -> i64 {
        self.events
            .get(event_type)
            .copied()
            .unwrap_or(self.events_default)
    }

    pub fn ensure_user_level(&mut self, user_id: &str, level: i64) -> bool {
        if self.get_user_level(user_id) == level {
            return false;
        }
        self.users.insert(user_id.to_string(), level);
        true
    }

    /// Sets a user level only if the actor outranks both the old and new level.
    pub fn ensure_user_level_as(&mut self, actor: Option<&str>, user_id: &str, level: i64) -> bool {
        let actor_level = actor.map_or(ACTOR_LEVEL_MAX, |a| self.get_user_level(a));
        let old = self.get_user_level(user_id);
        if level > actor_level || old > actor_level {
            return false;
        }
        self.ensure_user_level(user_id, level)
    }

    pub fn ensure_event_level_as(&mut self, actor: Option<&str>, event_type: &str, level: i64) -> bool {
        let actor_level = actor.map_or(ACTOR_LEVEL_MAX, |a| self.get_user_level(a));
        let old = self.get_event_level(event_type);
        if level > actor_level || old > actor_level {
            return false;
        }
        if old == level {
            return false;
        }
        self.events.insert(event_type.to_string(), level);
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRulesContent {
    pub join_rule: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceParentContent {
    pub via: Vec<String>,
    #[serde(default)]
    pub canonical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionalMembersContent {
    pub service_members: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeInfoSection {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub displayname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub avatar_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub external_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeInfoContent {
    pub bridgebot: String,
    pub creator: String,
    pub protocol: BridgeInfoSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<BridgeInfoSection>,
    pub channel: BridgeInfoSection,
    #[serde(rename = "com.beeper.room_type", skip_serializing_if = "String::is_empty")]
    pub room_type: String,
    #[serde(rename = "com.beeper.room_type.v2", skip_serializing_if = "String::is_empty")]
    pub room_type_v2: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub state_key: String,
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub invite: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(default)]
    pub is_direct: bool,
    #[serde(default)]
    pub initial_state: Vec<StateEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_level_content_override: Option<PowerLevelsContent>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub creation_content: serde_json::Map<String, serde_json::Value>,
    /// Predictable local room id hint, e.g. `!<portal id>:<server>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_room_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatusCode {
    Success,
    Retriable,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStatus {
    pub status: MessageStatusCode,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub is_certain: bool,
    #[serde(default)]
    pub send_notice: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delivered_to: Vec<String>,
}

impl MessageStatus {
    pub fn success() -> Self {
        Self {
            status: MessageStatusCode::Success,
            message: String::new(),
            is_certain: true,
            send_notice: false,
            delivered_to: Vec::new(),
        }
    }

    pub fn delivered(to: Vec<String>) -> Self {
        Self {
            delivered_to: to,
            ..Self::success()
        }
    }
}

impl From<&EventError> for MessageStatus {
    fn from(err: &EventError) -> Self {
        Self {
            status: if err.is_retriable() {
                MessageStatusCode::Retriable
            } else {
                MessageStatusCode::Fail
            },
            message: err.to_string(),
            is_certain: err.is_certain(),
            send_notice: err.should_send_notice(),
            delivered_to: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStatusEventInfo {
    pub room_id: String,
    pub event_id: String,
    pub sender: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TypingType {
    #[default]
    Text,
    UploadingMedia,
    RecordingMedia,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_level_actor_rule() {
        let mut pl = PowerLevelsContent::default();
        pl.users.insert("@mod:x".to_string(), 50);
        pl.users.insert("@admin:x".to_string(), 100);

        // Moderator cannot promote past their own level.
        assert!(!pl.ensure_user_level_as(Some("@mod:x"), "@u:x", 75));
        assert_eq!(pl.get_user_level("@u:x"), 0);
        // Moderator can set levels at or below their own.
        assert!(pl.ensure_user_level_as(Some("@mod:x"), "@u:x", 50));
        assert_eq!(pl.get_user_level("@u:x"), 50);
        // Moderator cannot demote an admin.
        assert!(!pl.ensure_user_level_as(Some("@mod:x"), "@admin:x", 0));
        // No actor means unconstrained.
        assert!(pl.ensure_user_level_as(None, "@admin:x", 0));
        assert_eq!(pl.get_user_level("@admin:x"), 0);
    }

    #[test]
    fn test_power_level_no_change() {
        let mut pl = PowerLevelsContent::default();
        assert!(!pl.ensure_user_level("@u:x", 0));
        assert!(pl.ensure_user_level("@u:x", 10));
        assert!(!pl.ensure_user_level("@u:x", 10));
    }

    #[test]
    fn test_reply_thread_accessors() {
        let mut content = MessageContent::text("hi");
        assert!(content.reply_to().is_none());
        content.set_thread("$root", "$prev");
        assert_eq!(content.thread_parent(), Some("$root"));
        assert_eq!(content.reply_to(), Some("$prev"));
        // The thread fallback reply is not a real reply.
        assert!(content.non_fallback_reply_to().is_none());

        let mut reply = MessageContent::text("re");
        reply.set_reply("$target");
        assert_eq!(reply.non_fallback_reply_to(), Some("$target"));
        assert!(reply.thread_parent().is_none());
    }

    #[test]
    fn test_set_edit_wraps_content() {
        let mut content = MessageContent::text("fixed");
        content.set_edit("$orig");
        assert_eq!(content.replace_id(), Some("$orig"));
        assert_eq!(content.body, "* fixed");
        assert_eq!(content.new_content.as_ref().unwrap().body, "fixed");
    }

    #[test]
    fn test_content_round_trip() {
        let mut content = MessageContent::text("hello");
        content.set_reply("$evt");
        content.add_mention("@a:x");
        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(value["m.relates_to"]["m.in_reply_to"]["event_id"], "$evt");
        let back: MessageContent = serde_json::from_value(value).unwrap();
        assert_eq!(back.reply_to(), Some("$evt"));
        assert_eq!(back.mentions.unwrap().user_ids, vec!["@a:x".to_string()]);
    }
}
