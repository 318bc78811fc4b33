use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::database::{BackfillTask, RoomType};
use crate::error::{EventError, EventResult, MatrixError};
use crate::matrix::{
    self, BridgeInfoContent, BridgeInfoSection, CreateRoomRequest, FunctionalMembersContent,
    MatrixApi, MemberContent, MessageContent, PowerLevelsContent, RoomNameContent, SpaceParentContent,
    StateEvent, TopicContent, AvatarContent,
};
use crate::network::{
    Avatar, ChatInfo, ChatInfoChange, ChatMember, ChatMemberList, EventSender,
    UserLocalPortalInfo,
};
use crate::util::format_duration;
use crate::database::DisappearingSetting;

use super::identity::UserLogin;
use super::portal::Portal;

impl Portal {
    pub(crate) async fn update_name(
        &self,
        name: &str,
        sender: Option<&Arc<dyn MatrixApi>>,
        ts: Option<DateTime<Utc>>,
    ) -> bool {
        let (current, name_set, has_room) =
            self.with_row(|row| (row.name.clone(), row.name_set, row.mxid.is_some()));
        if current == name && (name_set || !has_room) {
            return false;
        }
        self.with_row(|row| row.name = name.to_string());
        let content = serde_json::to_value(RoomNameContent {
            name: name.to_string(),
        })
        .unwrap_or_default();
        let sent = self
            .send_room_meta(sender, ts, matrix::STATE_ROOM_NAME, "", content)
            .await;
        self.with_row(|row| row.name_set = sent);
        true
    }

    pub(crate) async fn update_topic(
        &self,
        topic: &str,
        sender: Option<&Arc<dyn MatrixApi>>,
        ts: Option<DateTime<Utc>>,
    ) -> bool {
        let (current, topic_set, has_room) =
            self.with_row(|row| (row.topic.clone(), row.topic_set, row.mxid.is_some()));
        if current == topic && (topic_set || !has_room) {
            return false;
        }
        self.with_row(|row| row.topic = topic.to_string());
        let content = serde_json::to_value(TopicContent {
            topic: topic.to_string(),
        })
        .unwrap_or_default();
        let sent = self
            .send_room_meta(sender, ts, matrix::STATE_TOPIC, "", content)
            .await;
        self.with_row(|row| row.topic_set = sent);
        true
    }

    pub(crate) async fn update_avatar(
        &self,
        avatar: &Avatar,
        sender: Option<&Arc<dyn MatrixApi>>,
        ts: Option<DateTime<Utc>>,
    ) -> bool {
        let (current_id, avatar_set, has_room) =
            self.with_row(|row| (row.avatar_id.clone(), row.avatar_set, row.mxid.is_some()));
        if current_id == avatar.id && (avatar_set || !has_room) {
            return false;
        }
        self.with_row(|row| {
            row.avatar_id = avatar.id.clone();
            if avatar.remove {
                row.avatar_mxc = String::new();
                row.avatar_hash = String::new();
            } else {
                row.avatar_mxc = avatar.mxc.clone();
                row.avatar_hash = avatar.hash.clone();
            }
        });
        let url = self.with_row(|row| row.avatar_mxc.clone());
        let content = serde_json::to_value(AvatarContent { url }).unwrap_or_default();
        let sent = self
            .send_room_meta(sender, ts, matrix::STATE_ROOM_AVATAR, "", content)
            .await;
        self.with_row(|row| row.avatar_set = sent);
        true
    }

    pub(crate) async fn update_disappearing_setting(
        &self,
        setting: DisappearingSetting,
        sender: Option<&Arc<dyn MatrixApi>>,
        ts: Option<DateTime<Utc>>,
        implicit: bool,
        save: bool,
    ) -> bool {
        let mut setting = setting;
        if setting.timer.is_zero() {
            setting.disappear_type = crate::database::DisappearingType::None;
        }
        if self.disappear() == setting {
            return false;
        }
        self.with_row(|row| row.set_disappear(&setting));
        if save {
            if let Err(err) = self.save().await {
                error!(
                    portal_id = %self.key(),
                    error = %err,
                    "Failed to save portal to database after updating disappearing setting"
                );
            }
        }
        let body = if implicit {
            format!(
                "Automatically enabled disappearing message timer ({}) because incoming message is disappearing",
                format_duration(setting.timer)
            )
        } else if setting.timer.is_zero() {
            "Disappearing messages disabled".to_string()
        } else {
            format!("Disappearing messages set to {}", format_duration(setting.timer))
        };
        if let Some(room_id) = self.mxid() {
            let sender_api = sender.unwrap_or(&self.bridge.bot);
            let content = serde_json::to_value(MessageContent::notice(body)).unwrap_or_default();
            match sender_api
                .send_message(&room_id, matrix::EVENT_MESSAGE, content, ts)
                .await
            {
                Ok(_) => {
                    debug!(
                        portal_id = %self.key(),
                        new_timer = ?setting.timer,
                        implicit,
                        "Sent disappearing messages notice"
                    );
                }
                Err(err) => {
                    error!(portal_id = %self.key(), error = %err, "Failed to send disappearing messages notice");
                }
            }
        }
        true
    }

    async fn toggle_space(&self, space_mxid: &str, add: bool) -> Result<(), MatrixError> {
        let Some(child_mxid) = self.mxid() else {
            return Ok(());
        };
        let content = if add {
            serde_json::json!({ "via": [self.bridge.bot.server_name()] })
        } else {
            serde_json::json!({})
        };
        self.bridge
            .bot
            .send_state(space_mxid, matrix::STATE_SPACE_CHILD, &child_mxid, content, None)
            .await?;
        Ok(())
    }

    pub(crate) async fn add_to_parent_space_and_save(&self, space_mxid: &str) {
        match self.toggle_space(space_mxid, true).await {
            Ok(()) => {
                self.with_row(|row| row.in_space = true);
                if let Err(err) = self.save().await {
                    error!(portal_id = %self.key(), error = %err, "Failed to save portal after adding to space");
                }
            }
            Err(err) => {
                error!(
                    portal_id = %self.key(),
                    space_mxid = space_mxid,
                    error = %err,
                    "Failed to add portal to space"
                );
            }
        }
    }

    pub(crate) async fn update_parent(
        &self,
        new_parent: &str,
        source: Option<&Arc<UserLogin>>,
    ) -> bool {
        let current = self.parent_id().unwrap_or_default();
        if current == new_parent {
            return false;
        }
        let in_space = self.with_row(|row| row.in_space);
        if self.mxid().is_some() && in_space {
            if let Some(old_parent) = self.parent_portal().await {
                if let Some(old_mxid) = old_parent.mxid() {
                    if let Err(err) = self.toggle_space(&old_mxid, false).await {
                        error!(
                            portal_id = %self.key(),
                            old_space_mxid = %old_mxid,
                            error = %err,
                            "Failed to remove portal from old space"
                        );
                    }
                }
            }
        }
        self.with_row(|row| {
            row.parent_id = if new_parent.is_empty() {
                None
            } else {
                Some(new_parent.to_string())
            };
            row.in_space = false;
        });
        if !new_parent.is_empty() && self.mxid().is_some() {
            if let Some(parent) = self.parent_portal().await {
                if parent.mxid().is_none() {
                    if let Some(source) = source {
                        info!(portal_id = %self.key(), "Parent portal doesn't exist, creating");
                        if let Err(err) = parent.create_matrix_room(source, None).await {
                            error!(portal_id = %self.key(), error = %err, "Failed to create parent portal");
                        }
                    }
                }
                if let Some(parent_mxid) = parent.mxid() {
                    self.add_to_parent_space_and_save(&parent_mxid).await;
                }
            }
        }
        true
    }

    /// DM portals adopt the remote peer's name and avatar unless the chat
    /// has a custom name.
    pub(crate) async fn update_info_from_ghost(
        &self,
        ghost: Option<Arc<super::identity::Ghost>>,
    ) -> bool {
        let (name_is_custom, other_user) =
            self.with_row(|row| (row.name_is_custom, row.other_user_id.clone()));
        if name_is_custom
            || !self.bridge.config.bridge.private_chat_portal_meta
            || (other_user.is_none() && ghost.is_none())
            || self.room_type() != RoomType::Dm
        {
            return false;
        }
        let ghost = match ghost {
            Some(ghost) => ghost,
            None => {
                let Some(other_user) = other_user else {
                    return false;
                };
                match self.bridge.identities.ghost_by_id(&other_user).await {
                    Ok(ghost) => ghost,
                    Err(err) => {
                        error!(portal_id = %self.key(), error = %err, "Failed to get ghost to update info from");
                        return false;
                    }
                }
            }
        };
        let mut changed = self.update_name(&ghost.name(), None, None).await;
        let avatar_mxc = ghost.avatar_mxc();
        changed = self
            .update_avatar(
                &Avatar {
                    id: avatar_mxc.clone(),
                    mxc: avatar_mxc.clone(),
                    hash: String::new(),
                    remove: avatar_mxc.is_empty(),
                },
                None,
                None,
            )
            .await
            || changed;
        changed
    }

    /// Applies a chat info diff: only provided fields are touched. Any
    /// change refreshes the bridge-info state events and persists the row.
    pub(crate) async fn update_info(
        &self,
        info: &ChatInfo,
        source: &Arc<UserLogin>,
        sender: Option<&Arc<dyn MatrixApi>>,
        ts: Option<DateTime<Utc>>,
    ) {
        let mut changed = false;
        if let Some(name) = &info.name {
            self.with_row(|row| row.name_is_custom = true);
            changed = self.update_name(name, sender, ts).await || changed;
        }
        if let Some(topic) = &info.topic {
            changed = self.update_topic(topic, sender, ts).await || changed;
        }
        if let Some(avatar) = &info.avatar {
            self.with_row(|row| row.name_is_custom = true);
            changed = self.update_avatar(avatar, sender, ts).await || changed;
        }
        if let Some(disappear) = &info.disappear {
            changed = self
                .update_disappearing_setting(*disappear, sender, ts, false, false)
                .await
                || changed;
        }
        if let Some(parent_id) = &info.parent_id {
            changed = self.update_parent(parent_id, Some(source)).await || changed;
        }
        if let Some(join_rule) = &info.join_rule {
            let content = serde_json::to_value(join_rule).unwrap_or_default();
            self.send_room_meta(sender, ts, matrix::STATE_JOIN_RULES, "", content)
                .await;
        }
        if let Some(room_type) = info.room_type {
            let current = self.room_type();
            if current != room_type {
                if self.mxid().is_some()
                    && (room_type == RoomType::Space || current == RoomType::Space)
                {
                    warn!(
                        portal_id = %self.key(),
                        current_type = %current,
                        target_type = %room_type,
                        "Tried to change existing room type from/to space"
                    );
                } else {
                    changed = true;
                    self.with_row(|row| row.set_room_type(room_type));
                }
            }
        }
        if let Some(members) = &info.members {
            if self.mxid().is_some() {
                if let Err(err) = self.sync_participants(members, source, None, None).await {
                    error!(portal_id = %self.key(), error = %err, "Failed to sync room members");
                }
            } else {
                self.update_other_user(members);
            }
        }
        changed = self.update_info_from_ghost(None).await || changed;
        self.mark_login_in_portal(source).await;
        self.update_user_local_info(info.user_local.as_ref(), source).await;
        if info.can_backfill {
            self.enqueue_forward_backfill(source).await;
        }
        if changed {
            self.update_bridge_info().await;
            if let Err(err) = self.save().await {
                error!(portal_id = %self.key(), error = %err, "Failed to save portal to database after updating info");
            }
        }
    }

    pub(crate) async fn process_chat_info_change(
        &self,
        sender: &EventSender,
        source: &Arc<UserLogin>,
        change: ChatInfoChange,
        ts: DateTime<Utc>,
    ) {
        let intent = self.intent_for(sender, source).await;
        if let Some(info) = &change.chat_info {
            self.update_info(info, source, Some(&intent), Some(ts)).await;
        }
        if let Some(member_changes) = &change.member_changes {
            if let Err(err) = self
                .sync_participants(member_changes, source, Some(intent), Some(ts))
                .await
            {
                error!(portal_id = %self.key(), error = %err, "Failed to sync room members");
            }
        }
    }

    async fn bridge_info(&self) -> (String, BridgeInfoContent) {
        let row = self.db_row();
        let network = &self.bridge.config.network;
        let mut content = BridgeInfoContent {
            bridgebot: self.bridge.bot.user_id(),
            creator: self.bridge.bot.user_id(),
            protocol: BridgeInfoSection {
                id: network.id.clone(),
                displayname: network.displayname.clone(),
                avatar_url: network.avatar_url.clone(),
                external_url: network.external_url.clone(),
            },
            network: None,
            channel: BridgeInfoSection {
                id: row.id.clone(),
                displayname: row.name.clone(),
                avatar_url: row.avatar_mxc.clone(),
                external_url: String::new(),
            },
            room_type: if row.room_type().is_dm() {
                "dm".to_string()
            } else {
                String::new()
            },
            room_type_v2: row.room_type.clone(),
        };
        let top_parent = match self.parent_portal().await {
            Some(mut current) => loop {
                match current.parent_portal().await {
                    Some(next) => current = next,
                    None => {
                        break if current.room_type() == RoomType::Space {
                            Some(current.db_row())
                        } else {
                            None
                        };
                    }
                }
            },
            None => {
                if row.room_type() == RoomType::Space {
                    Some(row)
                } else {
                    None
                }
            }
        };
        if let Some(parent_row) = top_parent {
            content.network = Some(BridgeInfoSection {
                id: parent_row.id.clone(),
                displayname: parent_row.name.clone(),
                avatar_url: parent_row.avatar_mxc.clone(),
                external_url: String::new(),
            });
        }
        (network.id.clone(), content)
    }

    /// Re-emits both bridge-info state events; they are one logical write.
    pub(crate) async fn update_bridge_info(&self) {
        if self.mxid().is_none() {
            return;
        }
        let (state_key, info) = self.bridge_info().await;
        let content = serde_json::to_value(info).unwrap_or_default();
        self.send_room_meta(None, None, matrix::STATE_BRIDGE, &state_key, content.clone())
            .await;
        self.send_room_meta(None, None, matrix::STATE_HALF_SHOT_BRIDGE, &state_key, content)
            .await;
    }

    /// Sends a state event with the given intent, retrying through the bot
    /// with a `set_by` annotation when the intent lacks permission.
    pub(crate) async fn send_state_with_intent_or_bot(
        &self,
        sender: Option<&Arc<dyn MatrixApi>>,
        event_type: &str,
        state_key: &str,
        content: serde_json::Value,
        ts: Option<DateTime<Utc>>,
    ) -> Result<crate::matrix::SendResponse, MatrixError> {
        let Some(room_id) = self.mxid() else {
            return Err(MatrixError::EventSend("portal has no room".to_string()));
        };
        let sender_api = sender.unwrap_or(&self.bridge.bot);
        let result = sender_api
            .send_state(&room_id, event_type, state_key, content.clone(), ts)
            .await;
        match result {
            Err(MatrixError::Forbidden(_))
                if sender_api.user_id() != self.bridge.bot.user_id() =>
            {
                let mut content = content;
                if let Some(obj) = content.as_object_mut() {
                    obj.insert(
                        "fi.mau.bridge.set_by".to_string(),
                        serde_json::Value::String(sender_api.user_id()),
                    );
                }
                self.bridge
                    .bot
                    .send_state(&room_id, event_type, state_key, content, ts)
                    .await
            }
            other => other,
        }
    }

    pub(crate) async fn send_room_meta(
        &self,
        sender: Option<&Arc<dyn MatrixApi>>,
        ts: Option<DateTime<Utc>>,
        event_type: &str,
        state_key: &str,
        content: serde_json::Value,
    ) -> bool {
        if self.mxid().is_none() {
            return false;
        }
        let mut content = content;
        let name_is_custom = self.with_row(|row| row.name_is_custom);
        if !name_is_custom
            && (event_type == matrix::STATE_ROOM_NAME || event_type == matrix::STATE_ROOM_AVATAR)
        {
            if let Some(obj) = content.as_object_mut() {
                obj.insert("fi.mau.implicit_name".to_string(), serde_json::Value::Bool(true));
            }
        }
        match self
            .send_state_with_intent_or_bot(sender, event_type, state_key, content, ts)
            .await
        {
            Ok(_) => true,
            Err(err) => {
                error!(
                    portal_id = %self.key(),
                    event_type = event_type,
                    error = %err,
                    "Failed to set room metadata"
                );
                false
            }
        }
    }

    /// Maintains the DM-peer attribute from a member snapshot. The peer is
    /// inferred from a full two-member list when not given explicitly.
    pub(crate) fn update_other_user(&self, members: &ChatMemberList) -> bool {
        let mut expected: Option<String> = None;
        if self.room_type() == RoomType::Dm {
            if let Some(other) = &members.other_user_id {
                if !other.is_empty() {
                    expected = Some(other.clone());
                }
            } else if members.members.len() == 2 && members.is_full {
                let (first, second) = (&members.members[0], &members.members[1]);
                if first.sender.is_from_me && !second.sender.is_from_me {
                    expected = Some(second.sender.sender.clone());
                } else if second.sender.is_from_me && !first.sender.is_from_me {
                    expected = Some(first.sender.sender.clone());
                }
            }
        }
        let current = self.other_user_id();
        if current != expected {
            debug!(
                portal_id = %self.key(),
                old_other_user_id = current.as_deref().unwrap_or(""),
                new_other_user_id = expected.as_deref().unwrap_or(""),
                "Updating other user ID in DM portal"
            );
            self.with_row(|row| row.other_user_id = expected);
            return true;
        }
        false
    }

    async fn update_member_ghost_info(&self, member: &ChatMember) {
        let Some(user_info) = &member.user_info else {
            return;
        };
        if member.sender.sender.is_empty() {
            return;
        }
        match self.bridge.identities.ghost_by_id(&member.sender.sender).await {
            Ok(ghost) => {
                ghost.update_info(user_info);
            }
            Err(err) => {
                error!(
                    portal_id = %self.key(),
                    ghost_id = %member.sender.sender,
                    error = %err,
                    "Failed to get ghost from member list to update info"
                );
            }
        }
    }

    /// Walks the member list before room creation to produce the invite set,
    /// the functional-member ghosts of logged-in users, and per-user levels.
    async fn initial_member_list(
        &self,
        members: Option<&ChatMemberList>,
        source: &Arc<UserLogin>,
        power: &mut PowerLevelsContent,
    ) -> anyhow::Result<(Vec<String>, Vec<String>)> {
        let mut invite = Vec::new();
        let mut functional = Vec::new();
        let Some(members) = members else {
            invite.push(source.user_mxid().to_string());
            return Ok((invite, functional));
        };
        let logins_in_portal = if members.check_all_logins {
            Some(self.bridge.identities.user_logins_in_portal(self.key()).await?)
        } else {
            None
        };
        if let Some(changes) = &members.power_levels {
            changes.apply(None, power);
        }
        for member in &members.members {
            if !member.membership.is_empty() && member.membership != matrix::MEMBERSHIP_JOIN {
                continue;
            }
            self.update_member_ghost_info(member).await;
            let (intent, extra_user_id) = self
                .intent_and_user_mxid_for(&member.sender, source, logins_in_portal.as_deref())
                .await;
            if let Some(extra_user_id) = extra_user_id {
                invite.push(extra_user_id.clone());
                if let Some(level) = member.power_level {
                    power.ensure_user_level(&extra_user_id, level);
                }
                if let Some(intent) = &intent {
                    // An intent next to a user id means the ghost of a
                    // logged-in user, which is a functional member.
                    functional.push(intent.user_id());
                }
            }
            if let Some(intent) = &intent {
                let intent_mxid = intent.user_id();
                invite.push(intent_mxid.clone());
                if let Some(level) = member.power_level {
                    power.ensure_user_level(&intent_mxid, level);
                }
            }
        }
        self.update_other_user(members);
        Ok((invite, functional))
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_room_member(
        &self,
        target_mxid: &str,
        member: &ChatMember,
        has_intent: bool,
        current_members: &mut HashMap<String, MemberContent>,
        current_power: &mut PowerLevelsContent,
        power_changed: &mut bool,
        sender_api: &Arc<dyn MatrixApi>,
        ts: Option<DateTime<Utc>>,
    ) -> bool {
        let membership = if member.membership.is_empty() {
            matrix::MEMBERSHIP_JOIN
        } else {
            member.membership.as_str()
        };
        if let Some(level) = member.power_level {
            *power_changed |= current_power.ensure_user_level_as(
                Some(&self.bridge.bot.user_id()),
                target_mxid,
                level,
            );
        }
        let current = current_members.remove(target_mxid);
        if let Some(current) = &current {
            if current.membership == membership {
                return false;
            }
        }
        let current_membership = current
            .as_ref()
            .map(|c| c.membership.clone())
            .unwrap_or_else(|| matrix::MEMBERSHIP_LEAVE.to_string());
        if let Some(prev) = &member.prev_membership {
            if !prev.is_empty() && prev != &current_membership {
                debug!(
                    portal_id = %self.key(),
                    user_id = target_mxid,
                    expected_prev_membership = %prev,
                    actual_prev_membership = %current_membership,
                    target_membership = membership,
                    "Not updating membership: prev membership mismatch"
                );
                return false;
            }
        }
        let mut content = MemberContent {
            membership: membership.to_string(),
            displayname: current.as_ref().and_then(|c| c.displayname.clone()),
            avatar_url: current.as_ref().and_then(|c| c.avatar_url.clone()),
            reason: None,
        };
        let mut extra_fields = serde_json::Map::new();
        let mut this_sender = Arc::clone(sender_api);
        if membership == matrix::MEMBERSHIP_JOIN {
            content.membership = matrix::MEMBERSHIP_INVITE.to_string();
            if has_intent {
                extra_fields.insert(
                    "fi.mau.will_auto_accept".to_string(),
                    serde_json::Value::Bool(true),
                );
            }
            if this_sender.user_id() == target_mxid {
                this_sender = Arc::clone(&self.bridge.bot);
            }
        }
        if current_membership == matrix::MEMBERSHIP_BAN && membership != matrix::MEMBERSHIP_LEAVE {
            let mut unban = content.clone();
            unban.membership = matrix::MEMBERSHIP_LEAVE.to_string();
            let unban_value = serde_json::to_value(&unban).unwrap_or_default();
            if let Err(err) = self
                .send_state_with_intent_or_bot(
                    Some(&this_sender),
                    matrix::STATE_MEMBER,
                    target_mxid,
                    unban_value,
                    ts,
                )
                .await
            {
                error!(
                    portal_id = %self.key(),
                    target_user_id = target_mxid,
                    error = %err,
                    "Failed to unban user to update membership"
                );
            }
        }
        let mut value = serde_json::to_value(&content).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            for (k, v) in extra_fields {
                obj.insert(k, v);
            }
        }
        match self
            .send_state_with_intent_or_bot(
                Some(&this_sender),
                matrix::STATE_MEMBER,
                target_mxid,
                value,
                ts,
            )
            .await
        {
            Ok(_) => {
                debug!(
                    portal_id = %self.key(),
                    target_user_id = target_mxid,
                    sender_user_id = %this_sender.user_id(),
                    prev_membership = %current_membership,
                    membership = membership,
                    "Updated membership in room"
                );
                true
            }
            Err(err) => {
                error!(
                    portal_id = %self.key(),
                    target_user_id = target_mxid,
                    sender_user_id = %this_sender.user_id(),
                    prev_membership = %current_membership,
                    membership = membership,
                    error = %err,
                    "Failed to update user membership"
                );
                true
            }
        }
    }

    /// Reconciles a member snapshot against the current room members.
    pub(crate) async fn sync_participants(
        &self,
        members: &ChatMemberList,
        source: &Arc<UserLogin>,
        sender: Option<Arc<dyn MatrixApi>>,
        ts: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let Some(room_id) = self.mxid() else {
            return Ok(());
        };
        let logins_in_portal = if members.check_all_logins {
            Some(self.bridge.identities.user_logins_in_portal(self.key()).await?)
        } else {
            None
        };
        let sender_api = sender.unwrap_or_else(|| Arc::clone(&self.bridge.bot));
        let mut current_power = self.bridge.bot.get_power_levels(&room_id).await?;
        let mut current_members = self.bridge.bot.get_members(&room_id).await?;
        current_members.remove(&self.bridge.bot.user_id());
        let mut power_changed = members
            .power_levels
            .as_ref()
            .is_some_and(|changes| changes.apply(Some(&self.bridge.bot.user_id()), &mut current_power));
        for member in &members.members {
            self.update_member_ghost_info(member).await;
            let (intent, extra_user_id) = self
                .intent_and_user_mxid_for(&member.sender, source, logins_in_portal.as_deref())
                .await;
            if let Some(intent) = &intent {
                let changed = self
                    .sync_room_member(
                        &intent.user_id(),
                        member,
                        true,
                        &mut current_members,
                        &mut current_power,
                        &mut power_changed,
                        &sender_api,
                        ts,
                    )
                    .await;
                let is_join =
                    member.membership.is_empty() || member.membership == matrix::MEMBERSHIP_JOIN;
                if changed && is_join {
                    if let Err(err) = intent.ensure_joined(&room_id).await {
                        error!(
                            portal_id = %self.key(),
                            user_id = %intent.user_id(),
                            error = %err,
                            "Failed to ensure user is joined to room"
                        );
                    }
                }
            }
            if let Some(extra_user_id) = extra_user_id {
                self.sync_room_member(
                    &extra_user_id,
                    member,
                    false,
                    &mut current_members,
                    &mut current_power,
                    &mut power_changed,
                    &sender_api,
                    ts,
                )
                .await;
            }
        }
        if power_changed {
            let value = serde_json::to_value(&current_power).unwrap_or_default();
            if let Err(err) = self
                .send_state_with_intent_or_bot(
                    Some(&sender_api),
                    matrix::STATE_POWER_LEVELS,
                    "",
                    value,
                    ts,
                )
                .await
            {
                error!(portal_id = %self.key(), error = %err, "Failed to update power levels");
            }
        }
        self.update_other_user(members);
        if members.is_full {
            for (extra_member, member_evt) in current_members {
                if member_evt.membership == matrix::MEMBERSHIP_LEAVE
                    || member_evt.membership == matrix::MEMBERSHIP_BAN
                {
                    continue;
                }
                if !self.bridge.identities.is_ghost_mxid(&extra_member) && self.relay().is_some() {
                    continue;
                }
                let content = MemberContent {
                    membership: matrix::MEMBERSHIP_LEAVE.to_string(),
                    displayname: member_evt.displayname.clone(),
                    avatar_url: member_evt.avatar_url.clone(),
                    reason: Some("User is not in remote chat".to_string()),
                };
                if let Err(err) = self
                    .bridge
                    .bot
                    .send_state(
                        &room_id,
                        matrix::STATE_MEMBER,
                        &extra_member,
                        serde_json::to_value(&content).unwrap_or_default(),
                        None,
                    )
                    .await
                {
                    error!(
                        portal_id = %self.key(),
                        user_id = %extra_member,
                        error = %err,
                        "Failed to remove user from room"
                    );
                }
            }
        }
        Ok(())
    }

    async fn update_user_local_info(
        &self,
        info: Option<&UserLocalPortalInfo>,
        source: &Arc<UserLogin>,
    ) {
        let Some(room_id) = self.mxid() else {
            return;
        };
        let Some(dp) = source.user.double_puppet() else {
            return;
        };
        if self.room_type() == RoomType::Dm {
            if let Some(other_user) = self.other_user_id() {
                match self.bridge.identities.ghost_by_id(&other_user).await {
                    Ok(ghost) => {
                        if let Err(err) = dp.mark_as_dm(&room_id, &ghost.intent.user_id()).await {
                            error!(portal_id = %self.key(), error = %err, "Failed to mark room as DM");
                        }
                    }
                    Err(err) => {
                        error!(portal_id = %self.key(), error = %err, "Failed to get DM ghost to mark room as DM");
                    }
                }
            }
        }
        let Some(info) = info else {
            return;
        };
        if let Some(muted_until) = info.muted_until {
            if let Err(err) = dp.mute_room(&room_id, Some(muted_until)).await {
                error!(portal_id = %self.key(), error = %err, "Failed to mute room");
            }
        }
        if let Some(tag) = &info.tag {
            if let Err(err) = dp.tag_room(&room_id, tag, !tag.is_empty()).await {
                error!(portal_id = %self.key(), error = %err, "Failed to tag room");
            }
        }
    }

    pub(crate) async fn enqueue_forward_backfill(&self, source: &Arc<UserLogin>) {
        if !self.bridge.config.bridge.backfill.enabled {
            return;
        }
        let task = BackfillTask {
            chat_id: self.key().id.clone(),
            chat_receiver: self.key().receiver.clone(),
            login_id: source.id.clone(),
            next_dispatch_min_ts: Utc::now().timestamp_millis(),
            completed: false,
        };
        if let Err(err) = self.bridge.db.upsert_backfill_task(&task).await {
            error!(portal_id = %self.key(), error = %err, "Failed to ensure backfill queue task exists");
        } else {
            debug!(portal_id = %self.key(), "Enqueued forward backfill task");
        }
    }

    /// Creates the Matrix room. Runs inside the portal worker; the create
    /// lock covers the rare out-of-queue path.
    pub(crate) async fn create_matrix_room_in_loop(
        self: &Arc<Self>,
        source: &Arc<UserLogin>,
        info: Option<ChatInfo>,
    ) -> EventResult<()> {
        let _guard = self.room_create_lock.lock().await;
        if self.mxid().is_some() {
            self.mark_login_in_portal(source).await;
            return Ok(());
        }
        info!(portal_id = %self.key(), "Creating Matrix room");

        let info = match info {
            Some(info) if info.members.is_some() => info,
            other => {
                if other.is_some() {
                    warn!(portal_id = %self.key(), "Room creation got info without members, refetching");
                }
                source.client.get_chat_info(self).await?
            }
        };

        self.update_info(&info, source, None, None).await;

        let mut power = PowerLevelsContent::default();
        power.events.insert(matrix::STATE_TOMBSTONE.to_string(), 100);
        power.events.insert(matrix::STATE_SERVER_ACL.to_string(), 100);
        power.events.insert(matrix::STATE_ENCRYPTION.to_string(), 100);
        let bot_mxid = self.bridge.bot.user_id();
        power.users.insert(bot_mxid.clone(), 9001);
        let (invites, extra_functional) = self
            .initial_member_list(info.members.as_ref(), source, &mut power)
            .await
            .map_err(EventError::database)?;
        power.ensure_user_level(&bot_mxid, 9001);

        let row = self.db_row();
        let mut req = CreateRoomRequest {
            visibility: Some("private".to_string()),
            name: Some(row.name.clone()),
            topic: Some(row.topic.clone()),
            preset: Some("private_chat".to_string()),
            is_direct: row.room_type() == RoomType::Dm,
            power_level_content_override: Some(power),
            local_room_id: Some(format!("!{}:{}", self.key().id, self.bridge.bot.server_name())),
            ..Default::default()
        };
        let auto_join_invites = self.bridge.bot.auto_join_invites();
        if auto_join_invites {
            req.invite = invites;
        }
        if row.room_type() == RoomType::Space {
            req.creation_content.insert(
                "type".to_string(),
                serde_json::Value::String("m.space".to_string()),
            );
        }
        let (bridge_info_state_key, bridge_info) = self.bridge_info().await;
        let mut functional_members = extra_functional;
        functional_members.push(bot_mxid.clone());
        req.initial_state.push(StateEvent {
            event_type: matrix::STATE_FUNCTIONAL_MEMBERS.to_string(),
            state_key: String::new(),
            content: serde_json::to_value(FunctionalMembersContent {
                service_members: functional_members,
            })
            .unwrap_or_default(),
        });
        let bridge_info_value = serde_json::to_value(&bridge_info).unwrap_or_default();
        req.initial_state.push(StateEvent {
            event_type: matrix::STATE_HALF_SHOT_BRIDGE.to_string(),
            state_key: bridge_info_state_key.clone(),
            content: bridge_info_value.clone(),
        });
        req.initial_state.push(StateEvent {
            event_type: matrix::STATE_BRIDGE.to_string(),
            state_key: bridge_info_state_key,
            content: bridge_info_value,
        });
        if row.topic.is_empty() {
            // An explicit empty topic avoids an extra state event if the
            // topic is set later.
            req.initial_state.push(StateEvent {
                event_type: matrix::STATE_TOPIC.to_string(),
                state_key: String::new(),
                content: serde_json::to_value(TopicContent {
                    topic: String::new(),
                })
                .unwrap_or_default(),
            });
        }
        if !row.avatar_mxc.is_empty() {
            req.initial_state.push(StateEvent {
                event_type: matrix::STATE_ROOM_AVATAR.to_string(),
                state_key: String::new(),
                content: serde_json::to_value(AvatarContent {
                    url: row.avatar_mxc.clone(),
                })
                .unwrap_or_default(),
            });
        }
        let parent = self.parent_portal().await;
        if let Some(parent) = &parent {
            if let Some(parent_mxid) = parent.mxid() {
                req.initial_state.push(StateEvent {
                    event_type: matrix::STATE_SPACE_PARENT.to_string(),
                    state_key: parent_mxid,
                    content: serde_json::to_value(SpaceParentContent {
                        via: vec![self.bridge.bot.server_name()],
                        canonical: true,
                    })
                    .unwrap_or_default(),
                });
            }
        }
        if let Some(join_rule) = &info.join_rule {
            req.initial_state.push(StateEvent {
                event_type: matrix::STATE_JOIN_RULES.to_string(),
                state_key: String::new(),
                content: serde_json::to_value(join_rule).unwrap_or_default(),
            });
        }
        let room_id = self
            .bridge
            .bot
            .create_room(&req)
            .await
            .map_err(|err| EventError::Network(err.to_string()))?;
        info!(portal_id = %self.key(), room_id = %room_id, "Matrix room created");
        self.with_row(|row| {
            row.mxid = Some(room_id.clone());
            row.name_set = true;
            row.topic_set = true;
            row.avatar_set = true;
        });
        self.bridge.register_portal_mxid(&room_id, self).await;
        self.save().await.map_err(EventError::database)?;
        if info.can_backfill {
            self.enqueue_forward_backfill(source).await;
        }
        if let Some(parent) = parent {
            if let Some(parent_mxid) = parent.mxid() {
                self.add_to_parent_space_and_save(&parent_mxid).await;
            } else {
                info!(portal_id = %self.key(), "Parent portal doesn't exist, creating in background");
                let child = Arc::clone(self);
                let source = Arc::clone(source);
                tokio::spawn(async move {
                    if let Err(err) = parent.create_matrix_room(&source, None).await {
                        error!(portal_id = %child.key(), error = %err, "Failed to create parent portal");
                    } else if let Some(parent_mxid) = parent.mxid() {
                        child.add_to_parent_space_and_save(&parent_mxid).await;
                    }
                });
            }
        }
        self.update_user_local_info(info.user_local.as_ref(), source).await;
        if !auto_join_invites {
            match &info.members {
                None => {
                    if let Some(dp) = source.user.double_puppet() {
                        if let Err(err) = dp.ensure_joined(&room_id).await {
                            error!(
                                portal_id = %self.key(),
                                error = %err,
                                "Failed to ensure user is joined to room after creation"
                            );
                        }
                    }
                }
                Some(members) => {
                    if let Err(err) = self.sync_participants(members, source, None, None).await {
                        error!(
                            portal_id = %self.key(),
                            error = %err,
                            "Failed to sync participants after room creation"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}
