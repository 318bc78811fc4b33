use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::database::PortalKey;
use crate::error::MatrixResult;

use super::types::{
    CreateRoomRequest, MemberContent, MessageStatus, MessageStatusEventInfo, PowerLevelsContent,
    TypingType,
};

#[derive(Debug, Clone)]
pub struct SendResponse {
    pub event_id: String,
}

/// An intent: the ability to act on the Matrix side as one identity (the
/// bridge bot, a ghost, or a double-puppeted user). Server-level helpers
/// that are identity-independent also live here so a single handle covers
/// everything the portal needs.
#[async_trait]
pub trait MatrixApi: Send + Sync {
    fn user_id(&self) -> String;

    async fn send_message(
        &self,
        room_id: &str,
        event_type: &str,
        content: serde_json::Value,
        ts: Option<DateTime<Utc>>,
    ) -> MatrixResult<SendResponse>;

    async fn send_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: serde_json::Value,
        ts: Option<DateTime<Utc>>,
    ) -> MatrixResult<SendResponse>;

    async fn mark_read(&self, room_id: &str, event_id: &str, ts: DateTime<Utc>) -> MatrixResult<()>;

    async fn mark_typing(
        &self,
        room_id: &str,
        typing_type: TypingType,
        timeout: Duration,
    ) -> MatrixResult<()>;

    async fn mark_unread(&self, room_id: &str, unread: bool) -> MatrixResult<()>;

    async fn mark_as_dm(&self, room_id: &str, with_user: &str) -> MatrixResult<()>;

    async fn mute_room(&self, room_id: &str, until: Option<DateTime<Utc>>) -> MatrixResult<()>;

    async fn tag_room(&self, room_id: &str, tag: &str, set: bool) -> MatrixResult<()>;

    async fn ensure_joined(&self, room_id: &str) -> MatrixResult<()>;

    async fn create_room(&self, req: &CreateRoomRequest) -> MatrixResult<String>;

    async fn delete_room(&self, room_id: &str) -> MatrixResult<()>;

    async fn get_member_info(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> MatrixResult<Option<MemberContent>>;

    async fn get_members(&self, room_id: &str) -> MatrixResult<HashMap<String, MemberContent>>;

    async fn get_power_levels(&self, room_id: &str) -> MatrixResult<PowerLevelsContent>;

    /// Best-effort; failures are logged by the implementation.
    async fn send_message_status(&self, status: &MessageStatus, info: &MessageStatusEventInfo);

    /// Derives the event id a not-yet-sent message part will get, for batch
    /// sends referencing parents that have not been bridged yet.
    fn generate_deterministic_event_id(
        &self,
        room_id: &str,
        portal_key: &PortalKey,
        message_id: &str,
        part_id: &str,
    ) -> String;

    /// Extracts the remote user id from a ghost mxid, if it is one.
    fn parse_ghost_user_id(&self, mxid: &str) -> Option<String>;

    /// Whether `name` is confusable with another member's name in the room.
    /// Returns `None` when the homeserver doesn't support the check.
    async fn is_confusable_name(&self, _room_id: &str, _user_id: &str, _name: &str) -> Option<bool> {
        None
    }

    fn server_name(&self) -> String;

    /// Whether invites in room creation are auto-accepted by the server.
    fn auto_join_invites(&self) -> bool {
        false
    }
}

/// Merges extra top-level fields into a serialized event content.
pub fn content_with_raw(
    content: serde_json::Value,
    raw: Option<&serde_json::Map<String, serde_json::Value>>,
) -> serde_json::Value {
    let Some(raw) = raw else {
        return content;
    };
    match content {
        serde_json::Value::Object(mut map) => {
            for (k, v) in raw {
                map.entry(k.clone()).or_insert_with(|| v.clone());
            }
            serde_json::Value::Object(map)
        }
        other => other,
    }
}
