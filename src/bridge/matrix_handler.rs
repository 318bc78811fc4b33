use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tracing::{debug, error, warn};

use crate::database::{Message as DbMessage, UserPortal};
use crate::error::EventError;
use crate::matrix::{
    self, MatrixEvent, MemberContent, MessageContent, ReactionContent, RedactionContent,
    RoomNameContent, TopicContent, AvatarContent, TypingContent, MarkedUnreadContent,
};
use crate::network::{
    MatrixEditEvent, MatrixMembershipEvent, MatrixMessageEvent, MatrixMessageRemoveEvent,
    MatrixReactionEvent, MatrixReactionRemoveEvent, MatrixReactionRequest,
    MatrixReadReceiptEvent, MatrixRoomAvatarEvent, MatrixRoomNameEvent, MatrixRoomTopicEvent,
    MembershipChange, OrigSender, RoomCapabilities,
};

use super::identity::{User, UserLogin};
use super::portal::{OutgoingMessage, Portal};

impl Portal {
    pub(crate) async fn handle_matrix_event(&self, sender: &Arc<User>, evt: &MatrixEvent) {
        if evt.is_ephemeral() {
            match evt.event_type.as_str() {
                matrix::EPHEMERAL_RECEIPT => self.handle_matrix_receipts(evt).await,
                matrix::EPHEMERAL_TYPING => self.handle_matrix_typing(evt).await,
                _ => {}
            }
            return;
        }
        let login = match self.find_preferred_login(sender, true).await {
            Ok((login, _)) => login,
            Err(err) => {
                error!(
                    portal_id = %self.key(),
                    event_id = %evt.event_id,
                    error = %err,
                    "Failed to get user login to handle Matrix event"
                );
                self.send_error_status(evt, &err).await;
                return;
            }
        };
        let (login, orig_sender) = match login {
            Some(login) => (login, None),
            None => {
                let Some(relay) = self.relay() else {
                    self.send_error_status(evt, &EventError::NotLoggedIn).await;
                    return;
                };
                let orig = self.build_orig_sender(sender, evt).await;
                (relay, Some(orig))
            }
        };
        match evt.event_type.as_str() {
            matrix::EVENT_MESSAGE | matrix::EVENT_STICKER => {
                self.handle_matrix_message(&login, orig_sender.as_ref(), evt).await;
            }
            matrix::EVENT_REACTION => {
                if orig_sender.is_some() {
                    debug!(portal_id = %self.key(), "Ignoring reaction event from relayed user");
                    self.send_error_status(evt, &EventError::IgnoringReactionFromRelayedUser)
                        .await;
                    return;
                }
                self.handle_matrix_reaction(&login, evt).await;
            }
            matrix::EVENT_REDACTION => {
                self.handle_matrix_redaction(&login, orig_sender.as_ref(), evt).await;
            }
            matrix::STATE_ROOM_NAME | matrix::STATE_TOPIC | matrix::STATE_ROOM_AVATAR => {
                self.handle_matrix_room_meta(&login, orig_sender.as_ref(), evt).await;
            }
            matrix::ACCOUNT_DATA_MARKED_UNREAD
            | matrix::ACCOUNT_DATA_ROOM_TAGS
            | matrix::ACCOUNT_DATA_MUTE => {
                self.handle_matrix_account_data(&login, evt).await;
            }
            matrix::STATE_MEMBER => {
                self.handle_matrix_membership(&login, orig_sender.as_ref(), evt).await;
            }
            _ => {}
        }
    }

    /// Builds the synthetic sender for content forwarded through the relay,
    /// disambiguating the displayed name against homonyms when possible.
    async fn build_orig_sender(&self, sender: &Arc<User>, evt: &MatrixEvent) -> OrigSender {
        let mut orig = OrigSender {
            user_mxid: sender.mxid.clone(),
            ..Default::default()
        };
        match self.bridge.bot.get_member_info(&evt.room_id, &sender.mxid).await {
            Ok(Some(member)) => {
                let displayname = member.displayname.unwrap_or_default();
                if displayname.is_empty() {
                    orig.disambiguated_name = sender.mxid.clone();
                } else {
                    orig.displayname = displayname.clone();
                    let confusable = self
                        .bridge
                        .bot
                        .is_confusable_name(&evt.room_id, &sender.mxid, &displayname)
                        .await
                        .unwrap_or(false);
                    if confusable {
                        orig.requires_disambiguation = true;
                        orig.disambiguated_name = format!("{} ({})", displayname, sender.mxid);
                    } else {
                        orig.disambiguated_name = displayname;
                    }
                }
            }
            Ok(None) => {
                orig.disambiguated_name = sender.mxid.clone();
            }
            Err(err) => {
                warn!(
                    portal_id = %self.key(),
                    error = %err,
                    "Failed to get member info for user being relayed"
                );
                orig.disambiguated_name = sender.mxid.clone();
            }
        }
        orig.formatted_name = self
            .bridge
            .config
            .bridge
            .relay
            .format_name(&orig.disambiguated_name);
        orig
    }

    fn reformat_for_relay(&self, content: &mut MessageContent, orig_sender: &OrigSender) {
        content.body = self
            .bridge
            .config
            .bridge
            .relay
            .format_message(&orig_sender.formatted_name, &content.body);
        if let Some(formatted) = content.formatted_body.take() {
            content.formatted_body = Some(
                self.bridge
                    .config
                    .bridge
                    .relay
                    .format_message(&orig_sender.formatted_name, &formatted),
            );
        }
    }

    /// Content-level capability gate. Text-like messages pass unconditionally;
    /// length limits are the connector's concern after conversion.
    async fn check_message_content_caps(
        &self,
        caps: &RoomCapabilities,
        content: &MessageContent,
        evt: &MatrixEvent,
    ) -> bool {
        match content.msgtype.as_str() {
            matrix::MSG_TEXT | matrix::MSG_NOTICE | matrix::MSG_EMOTE | "" => true,
            matrix::MSG_LOCATION => {
                if !caps.location_messages {
                    self.send_error_status(evt, &EventError::LocationMessagesNotAllowed).await;
                    return false;
                }
                true
            }
            matrix::MSG_IMAGE | matrix::MSG_AUDIO | matrix::MSG_VIDEO | matrix::MSG_FILE => {
                let has_caption = content
                    .filename
                    .as_ref()
                    .is_some_and(|name| !name.is_empty() && name != &content.body);
                if has_caption && !caps.captions {
                    self.send_error_status(evt, &EventError::CaptionsNotAllowed).await;
                    return false;
                }
                true
            }
            _ => true,
        }
    }

    async fn handle_matrix_message(
        &self,
        login: &Arc<UserLogin>,
        orig_sender: Option<&OrigSender>,
        evt: &MatrixEvent,
    ) {
        let mut content: MessageContent = match serde_json::from_value(evt.content.clone()) {
            Ok(content) => content,
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Unexpected parsed content type");
                self.send_error_status(evt, &EventError::UnexpectedContent("m.room.message")).await;
                return;
            }
        };
        let caps = login.client.get_capabilities(self).await;

        if content.replace_id().is_some() {
            self.handle_matrix_edit(login, orig_sender, evt, content, &caps).await;
            return;
        }
        if let Some(orig) = orig_sender {
            self.reformat_for_relay(&mut content, orig);
        }
        if !self.check_message_content_caps(&caps, &content, evt).await {
            return;
        }

        let reply_to_id = if caps.threads {
            content.non_fallback_reply_to()
        } else {
            content.reply_to()
        }
        .map(str::to_string);
        let thread_root_id = content.thread_parent().map(str::to_string);

        let mut thread_root: Option<DbMessage> = None;
        let mut reply_to: Option<DbMessage> = None;
        if caps.threads {
            if let Some(root_id) = &thread_root_id {
                match self.bridge.db.get_message_part_by_mxid(root_id).await {
                    Ok(found) => thread_root = found,
                    Err(err) => {
                        error!(portal_id = %self.key(), error = %err, "Failed to get thread root message from database");
                    }
                }
            }
        }
        if let Some(reply_id) = &reply_to_id {
            if caps.replies || caps.threads {
                match self.bridge.db.get_message_part_by_mxid(reply_id).await {
                    Ok(found) => reply_to = found,
                    Err(err) => {
                        error!(portal_id = %self.key(), error = %err, "Failed to get reply target message from database");
                    }
                }
                if let Some(target) = &reply_to {
                    // Reply-to-thread fallback: a plain reply continues the
                    // thread when the target is in one, or starts one when
                    // the network only supports threads.
                    if caps.threads
                        && thread_root.is_none()
                        && (!target.thread_root_id.is_empty() || !caps.replies)
                    {
                        let root_remote_id = if target.thread_root_id.is_empty() {
                            target.id.clone()
                        } else {
                            target.thread_root_id.clone()
                        };
                        match self
                            .bridge
                            .db
                            .get_first_thread_message(self.key(), &root_remote_id)
                            .await
                        {
                            Ok(found) => thread_root = found,
                            Err(err) => {
                                error!(
                                    portal_id = %self.key(),
                                    error = %err,
                                    "Failed to get thread root message from database (via reply fallback)"
                                );
                            }
                        }
                    }
                }
                if !caps.replies {
                    reply_to = None;
                }
            }
        }

        let payload = MatrixMessageEvent {
            event_id: evt.event_id.clone(),
            event_type: evt.event_type.clone(),
            sender_mxid: evt.sender.clone(),
            timestamp: Utc
                .timestamp_millis_opt(evt.origin_server_ts)
                .single()
                .unwrap_or_else(Utc::now),
            content,
            orig_sender: orig_sender.cloned(),
            thread_root: thread_root.clone(),
            reply_to: reply_to.clone(),
        };
        let resp = match login.client.handle_message(self, payload).await {
            Ok(resp) => resp,
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to handle Matrix message");
                self.send_error_status(evt, &err).await;
                return;
            }
        };

        let mut message = resp.message;
        if message.mxid.is_empty() {
            message.mxid = evt.event_id.clone();
        }
        if message.chat_id.is_empty() {
            message.set_key(self.key());
        }
        if message.timestamp == 0 {
            message.timestamp = evt.origin_server_ts;
        }
        if message.reply_to_id.is_none() {
            if let Some(target) = &reply_to {
                message.reply_to_id = Some(target.id.clone());
                message.reply_to_part_id = Some(target.part_id.clone());
            }
        }
        if message.thread_root_id.is_empty() {
            if let Some(root) = &thread_root {
                message.thread_root_id = if root.thread_root_id.is_empty() {
                    root.id.clone()
                } else {
                    root.thread_root_id.clone()
                };
            }
        }
        if message.sender_mxid.is_empty() {
            message.sender_mxid = evt.sender.clone();
        }

        let message_mxid = message.mxid.clone();
        let message_ts = message.timestamp_time();
        if let Some(transaction_id) = resp.pending_transaction_id {
            self.register_pending(
                transaction_id,
                OutgoingMessage {
                    db: message,
                    room_id: evt.room_id.clone(),
                    event_id: evt.event_id.clone(),
                    sender_mxid: evt.sender.clone(),
                    handle: resp.echo_handler,
                },
            );
        } else {
            // The ghost row must exist before the message row references it.
            let _ = self.bridge.identities.ghost_by_id(&message.sender_id).await;
            if let Err(err) = self.bridge.db.insert_message(&message).await {
                error!(portal_id = %self.key(), error = %err, "Failed to save message to database");
            }
            self.send_success_status(evt).await;
        }
        let disappear = self.disappear();
        if disappear.is_enabled() {
            self.enqueue_disappearing(&message_mxid, &disappear, message_ts);
        }
    }

    async fn handle_matrix_edit(
        &self,
        login: &Arc<UserLogin>,
        orig_sender: Option<&OrigSender>,
        evt: &MatrixEvent,
        content: MessageContent,
        caps: &RoomCapabilities,
    ) {
        let edit_target_mxid = content.replace_id().unwrap_or_default().to_string();
        let mut content = match content.new_content {
            Some(inner) => *inner,
            None => content,
        };
        if let Some(orig) = orig_sender {
            self.reformat_for_relay(&mut content, orig);
        }
        let Some(editing_api) = login.client.edit_handler() else {
            debug!(portal_id = %self.key(), "Ignoring edit as network connector doesn't support edits");
            self.send_error_status(evt, &EventError::EditsNotSupported).await;
            return;
        };
        if !caps.edits {
            debug!(portal_id = %self.key(), "Ignoring edit as room doesn't support edits");
            self.send_error_status(evt, &EventError::EditsNotSupportedInPortal).await;
            return;
        }
        if !self.check_message_content_caps(caps, &content, evt).await {
            return;
        }
        let edit_target = match self.bridge.db.get_message_part_by_mxid(&edit_target_mxid).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                warn!(portal_id = %self.key(), "Edit target message not found in database");
                self.send_error_status(evt, &EventError::TargetNotFound { kind: "edit" }).await;
                return;
            }
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to get edit target message from database");
                self.send_error_status(evt, &EventError::database(err)).await;
                return;
            }
        };
        if let Some(max_age) = caps.edit_max_age {
            let age = Utc::now() - edit_target.timestamp_time();
            if age > chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX) {
                self.send_error_status(evt, &EventError::EditTargetTooOld).await;
                return;
            }
        }
        if let Some(max_count) = caps.edit_max_count {
            if edit_target.edit_count >= max_count as i32 {
                self.send_error_status(evt, &EventError::EditTargetTooManyEdits).await;
                return;
            }
        }
        let payload = MatrixEditEvent {
            event_id: evt.event_id.clone(),
            sender_mxid: evt.sender.clone(),
            timestamp: Utc
                .timestamp_millis_opt(evt.origin_server_ts)
                .single()
                .unwrap_or_else(Utc::now),
            content,
            orig_sender: orig_sender.cloned(),
            edit_target,
        };
        let updated = match editing_api.handle_edit(self, payload).await {
            Ok(updated) => updated,
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to handle Matrix edit");
                self.send_error_status(evt, &err).await;
                return;
            }
        };
        if let Err(err) = self.bridge.db.update_message(&updated).await {
            error!(portal_id = %self.key(), error = %err, "Failed to save message to database after editing");
        }
        self.send_success_status(evt).await;
    }

    async fn handle_matrix_reaction(&self, login: &Arc<UserLogin>, evt: &MatrixEvent) {
        let Some(reacting_api) = login.client.reaction_handler() else {
            debug!(portal_id = %self.key(), "Ignoring reaction as network connector doesn't support reactions");
            self.send_error_status(evt, &EventError::ReactionsNotSupported).await;
            return;
        };
        let content: ReactionContent = match serde_json::from_value(evt.content.clone()) {
            Ok(content) => content,
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Unexpected parsed content type");
                self.send_error_status(evt, &EventError::UnexpectedContent("m.reaction")).await;
                return;
            }
        };
        let target_mxid = content.relates_to.event_id.clone().unwrap_or_default();
        let target = match self.bridge.db.get_message_part_by_mxid(&target_mxid).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                warn!(portal_id = %self.key(), "Reaction target message not found in database");
                self.send_error_status(evt, &EventError::TargetNotFound { kind: "reaction" }).await;
                return;
            }
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to get reaction target message from database");
                self.send_error_status(evt, &EventError::database(err)).await;
                return;
            }
        };
        let reaction_evt = MatrixReactionEvent {
            event_id: evt.event_id.clone(),
            sender_mxid: evt.sender.clone(),
            timestamp: Utc
                .timestamp_millis_opt(evt.origin_server_ts)
                .single()
                .unwrap_or_else(Utc::now),
            emoji: content.relates_to.key.clone().unwrap_or_default(),
            target_message: target.clone(),
        };
        let pre = match reacting_api.pre_handle_reaction(self, &reaction_evt).await {
            Ok(pre) => pre,
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to pre-handle Matrix reaction");
                self.send_error_status(evt, &err).await;
                return;
            }
        };
        let existing = match self
            .bridge
            .db
            .get_reaction(&target.id, &target.part_id, &pre.sender_id, &pre.emoji_id)
            .await
        {
            Ok(existing) => existing,
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to check if reaction is a duplicate");
                return;
            }
        };
        let mut reaction_to_override = None;
        if let Some(existing) = existing {
            if !existing.emoji_id.is_empty() || existing.emoji == pre.emoji {
                debug!(portal_id = %self.key(), "Ignoring duplicate reaction");
                self.send_success_status(evt).await;
                return;
            }
            self.redact_with_bot(&existing.mxid).await;
            reaction_to_override = Some(existing);
        }
        let mut existing_reactions_to_keep = Vec::new();
        if pre.max_reactions > 0 {
            let all = match self
                .bridge
                .db
                .get_reactions_by_sender(&target.id, &pre.sender_id)
                .await
            {
                Ok(all) => all,
                Err(err) => {
                    error!(portal_id = %self.key(), error = %err, "Failed to get all reactions to message by sender");
                    self.send_error_status(evt, &EventError::database(err)).await;
                    return;
                }
            };
            if all.len() < pre.max_reactions {
                existing_reactions_to_keep = all;
            } else {
                // Reactions are ordered oldest first; keep the newest n-1 and
                // remove the rest to stay under the cap after this reaction.
                let cutoff = all.len() - (pre.max_reactions - 1);
                for old in &all[..cutoff] {
                    self.redact_with_bot(&old.mxid).await;
                    if let Err(err) = self.bridge.db.delete_reaction(old).await {
                        error!(
                            portal_id = %self.key(),
                            error = %err,
                            "Failed to delete previous reaction from database after limit was exceeded"
                        );
                    }
                }
                existing_reactions_to_keep = all[cutoff..].to_vec();
            }
        }
        let result = match reacting_api
            .handle_reaction(
                self,
                MatrixReactionRequest {
                    event: reaction_evt,
                    pre: pre.clone(),
                    reaction_to_override,
                    existing_reactions_to_keep,
                },
            )
            .await
        {
            Ok(result) => result,
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to handle Matrix reaction");
                self.send_error_status(evt, &err).await;
                return;
            }
        };
        let mut reaction = result.unwrap_or_default();
        if reaction.chat_id.is_empty() {
            reaction.set_key(self.key());
        }
        if reaction.message_id.is_empty() {
            reaction.message_id = target.id.clone();
            reaction.message_part_id = target.part_id.clone();
        }
        if reaction.mxid.is_empty() {
            reaction.mxid = evt.event_id.clone();
        }
        if reaction.timestamp == 0 {
            reaction.timestamp = evt.origin_server_ts;
        }
        if pre.emoji_id.is_empty() && reaction.emoji_id.is_empty() {
            if reaction.emoji.is_empty() {
                reaction.emoji = pre.emoji.clone();
            }
        } else if reaction.emoji_id.is_empty() {
            reaction.emoji_id = pre.emoji_id.clone();
        }
        if reaction.sender_id.is_empty() {
            reaction.sender_id = pre.sender_id.clone();
        }
        if reaction.sender_mxid.is_empty() {
            reaction.sender_mxid = evt.sender.clone();
        }
        if let Err(err) = self.bridge.db.upsert_reaction(&reaction).await {
            error!(portal_id = %self.key(), error = %err, "Failed to save reaction to database");
        }
        self.send_success_status(evt).await;
    }

    pub(crate) async fn redact_with_bot(&self, target_mxid: &str) {
        let Some(room_id) = self.mxid() else {
            return;
        };
        let content = RedactionContent {
            redacts: target_mxid.to_string(),
            reason: None,
        };
        if let Err(err) = self
            .bridge
            .bot
            .send_message(
                &room_id,
                matrix::EVENT_REDACTION,
                serde_json::to_value(&content).unwrap_or_default(),
                None,
            )
            .await
        {
            error!(portal_id = %self.key(), error = %err, "Failed to remove old reaction");
        }
    }

    async fn handle_matrix_redaction(
        &self,
        login: &Arc<UserLogin>,
        orig_sender: Option<&OrigSender>,
        evt: &MatrixEvent,
    ) {
        let mut content: RedactionContent = match serde_json::from_value(evt.content.clone()) {
            Ok(content) => content,
            Err(_) => RedactionContent {
                redacts: String::new(),
                reason: None,
            },
        };
        if let Some(redacts) = &evt.redacts {
            if &content.redacts != redacts {
                content.redacts = redacts.clone();
            }
        }
        if content.redacts.is_empty() {
            self.send_error_status(evt, &EventError::UnexpectedContent("m.room.redaction")).await;
            return;
        }
        let deleting_api = login.client.redaction_handler();
        let reacting_api = login.client.reaction_handler();
        if deleting_api.is_none() && reacting_api.is_none() {
            debug!(
                portal_id = %self.key(),
                "Ignoring redaction as network connector supports neither redactions nor reactions"
            );
            self.send_error_status(evt, &EventError::RedactionsNotSupported).await;
            return;
        }
        let target_message = match self.bridge.db.get_message_part_by_mxid(&content.redacts).await {
            Ok(target) => target,
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to get redaction target message from database");
                self.send_error_status(evt, &EventError::database(err)).await;
                return;
            }
        };
        let dispatch_result = if let Some(target) = target_message {
            let Some(deleting_api) = deleting_api else {
                debug!(portal_id = %self.key(), "Ignoring message redaction as network connector doesn't support redactions");
                self.send_error_status(evt, &EventError::RedactionsNotSupported).await;
                return;
            };
            deleting_api
                .handle_message_remove(
                    self,
                    MatrixMessageRemoveEvent {
                        event_id: evt.event_id.clone(),
                        sender_mxid: evt.sender.clone(),
                        orig_sender: orig_sender.cloned(),
                        target_message: target,
                    },
                )
                .await
        } else {
            let target_reaction = match self.bridge.db.get_reaction_by_mxid(&content.redacts).await {
                Ok(Some(target)) => target,
                Ok(None) => {
                    debug!(portal_id = %self.key(), "Redaction target message not found in database");
                    self.send_error_status(evt, &EventError::TargetNotFound { kind: "redaction" })
                        .await;
                    return;
                }
                Err(err) => {
                    error!(portal_id = %self.key(), error = %err, "Failed to get redaction target reaction from database");
                    self.send_error_status(evt, &EventError::database(err)).await;
                    return;
                }
            };
            let Some(reacting_api) = reacting_api else {
                debug!(portal_id = %self.key(), "Ignoring reaction redaction as network connector doesn't support reactions");
                self.send_error_status(evt, &EventError::ReactionsNotSupported).await;
                return;
            };
            reacting_api
                .handle_reaction_remove(
                    self,
                    MatrixReactionRemoveEvent {
                        event_id: evt.event_id.clone(),
                        sender_mxid: evt.sender.clone(),
                        orig_sender: orig_sender.cloned(),
                        target_reaction,
                    },
                )
                .await
        };
        if let Err(err) = dispatch_result {
            error!(portal_id = %self.key(), error = %err, "Failed to handle Matrix redaction");
            self.send_error_status(evt, &err).await;
            return;
        }
        self.send_success_status(evt).await;
    }

    async fn handle_matrix_receipts(&self, evt: &MatrixEvent) {
        type ReceiptContent = HashMap<String, HashMap<String, HashMap<String, serde_json::Value>>>;
        let Ok(content) = serde_json::from_value::<ReceiptContent>(evt.content.clone()) else {
            return;
        };
        for (event_id, receipts) in content {
            let Some(read_receipts) = receipts.get("m.read") else {
                continue;
            };
            for (user_mxid, receipt) in read_receipts {
                let user = match self.bridge.identities.user_by_mxid(user_mxid).await {
                    Ok(Some(user)) => user,
                    Ok(None) => continue,
                    Err(err) => {
                        error!(portal_id = %self.key(), error = %err, "Failed to get user for read receipt");
                        continue;
                    }
                };
                let receipt_ts = receipt.get("ts").and_then(|v| v.as_i64()).unwrap_or(0);
                self.handle_matrix_read_receipt(&user, &event_id, receipt_ts).await;
            }
        }
    }

    async fn handle_matrix_read_receipt(&self, user: &Arc<User>, event_id: &str, receipt_ts: i64) {
        let (login, user_portal) = match self.find_preferred_login(user, false).await {
            Ok((Some(login), user_portal)) => (login, user_portal),
            Ok((None, _)) => return,
            Err(EventError::NotLoggedIn) => return,
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to get preferred login for user");
                return;
            }
        };
        let Some(rr_api) = login.client.read_receipt_handler() else {
            return;
        };
        let exact_message = match self.bridge.db.get_message_part_by_mxid(event_id).await {
            Ok(found) => found,
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to get exact message from database");
                None
            }
        };
        let receipt_time = Utc
            .timestamp_millis_opt(receipt_ts)
            .single()
            .unwrap_or_else(Utc::now);
        let read_up_to = exact_message
            .as_ref()
            .map(|m| m.timestamp_time())
            .unwrap_or(receipt_time);
        let payload = MatrixReadReceiptEvent {
            event_id: event_id.to_string(),
            receipt_timestamp: receipt_time,
            read_up_to,
            last_read: user_portal
                .as_ref()
                .filter(|up| up.last_read > 0)
                .map(|up| Utc.timestamp_millis_opt(up.last_read).single().unwrap_or_else(Utc::now)),
            exact_message: exact_message.clone(),
        };
        if let Err(err) = rr_api.handle_read_receipt(self, payload).await {
            error!(portal_id = %self.key(), error = %err, "Failed to handle read receipt");
            return;
        }
        let mut row = user_portal
            .unwrap_or_else(|| UserPortal::new(&login.id, login.user_mxid(), self.key()));
        row.last_read = exact_message
            .as_ref()
            .map(|m| m.timestamp)
            .unwrap_or(receipt_ts);
        if let Err(err) = self.bridge.db.put_user_portal(&row).await {
            error!(portal_id = %self.key(), error = %err, "Failed to save user portal metadata");
        }
        if let Some(room_id) = self.mxid() {
            self.bridge.disappearing.start_all(&room_id).await;
        }
    }

    async fn handle_matrix_typing(&self, evt: &MatrixEvent) {
        let Ok(content) = serde_json::from_value::<TypingContent>(evt.content.clone()) else {
            return;
        };
        let mut user_ids = content.user_ids;
        user_ids.sort();
        let (stopped, started, known_logins) = {
            let mut state = self.typing.lock().unwrap();
            let (stopped, started) = crate::util::sorted_diff(&state.currently, &user_ids);
            state.currently = user_ids;
            (stopped, started, state.logins.clone())
        };
        let mut resolved = HashMap::new();
        for user_id in &started {
            if !known_logins.contains_key(user_id) {
                if let Some(login) = self.resolve_typing_login(user_id).await {
                    resolved.insert(user_id.clone(), login);
                }
            }
        }
        {
            let mut state = self.typing.lock().unwrap();
            for user_id in &stopped {
                state.logins.remove(user_id);
            }
            for (user_id, login) in &resolved {
                state.logins.insert(user_id.clone(), Arc::clone(login));
            }
        }
        self.send_typings(&stopped, &known_logins, &resolved, false).await;
        self.send_typings(&started, &known_logins, &resolved, true).await;
    }

    async fn resolve_typing_login(&self, user_mxid: &str) -> Option<Arc<UserLogin>> {
        let user = match self.bridge.identities.user_by_mxid(user_mxid).await {
            Ok(Some(user)) => user,
            Ok(None) => return None,
            Err(err) => {
                error!(
                    portal_id = %self.key(),
                    user_id = %user_mxid,
                    error = %err,
                    "Failed to get user to send typing event"
                );
                return None;
            }
        };
        let login = match self.find_preferred_login(&user, false).await {
            Ok((Some(login), _)) => login,
            Ok((None, _)) | Err(EventError::NotLoggedIn) => return None,
            Err(err) => {
                error!(
                    portal_id = %self.key(),
                    user_id = %user_mxid,
                    error = %err,
                    "Failed to get user login to send typing event"
                );
                return None;
            }
        };
        login.client.typing_handler()?;
        Some(login)
    }

    async fn send_typings(
        &self,
        user_ids: &[String],
        known: &HashMap<String, Arc<UserLogin>>,
        resolved: &HashMap<String, Arc<UserLogin>>,
        typing: bool,
    ) {
        for user_id in user_ids {
            let Some(login) = known.get(user_id).or_else(|| resolved.get(user_id)) else {
                continue;
            };
            let Some(typing_api) = login.client.typing_handler() else {
                continue;
            };
            if let Err(err) = typing_api.handle_typing(self, typing).await {
                error!(
                    portal_id = %self.key(),
                    user_id = user_id,
                    error = %err,
                    "Failed to bridge Matrix typing event"
                );
            } else {
                debug!(portal_id = %self.key(), user_id = user_id, typing, "Sent typing event");
            }
        }
    }

    async fn handle_matrix_room_meta(
        &self,
        login: &Arc<UserLogin>,
        orig_sender: Option<&OrigSender>,
        evt: &MatrixEvent,
    ) {
        let changed = match evt.event_type.as_str() {
            matrix::STATE_ROOM_NAME => {
                let Ok(content) = serde_json::from_value::<RoomNameContent>(evt.content.clone()) else {
                    self.send_error_status(evt, &EventError::UnexpectedContent("m.room.name")).await;
                    return;
                };
                if content.name == self.name() {
                    self.send_success_status(evt).await;
                    return;
                }
                let Some(api) = login.client.room_name_handler() else {
                    self.send_error_status(evt, &EventError::RoomMetadataNotSupported).await;
                    return;
                };
                let prev_name = evt
                    .prev_content
                    .clone()
                    .and_then(|p| serde_json::from_value::<RoomNameContent>(p).ok())
                    .map(|p| p.name);
                api.handle_room_name(
                    self,
                    MatrixRoomNameEvent {
                        event_id: evt.event_id.clone(),
                        name: content.name,
                        prev_name,
                        orig_sender: orig_sender.cloned(),
                    },
                )
                .await
            }
            matrix::STATE_TOPIC => {
                let Ok(content) = serde_json::from_value::<TopicContent>(evt.content.clone()) else {
                    self.send_error_status(evt, &EventError::UnexpectedContent("m.room.topic")).await;
                    return;
                };
                if content.topic == self.topic() {
                    self.send_success_status(evt).await;
                    return;
                }
                let Some(api) = login.client.room_topic_handler() else {
                    self.send_error_status(evt, &EventError::RoomMetadataNotSupported).await;
                    return;
                };
                let prev_topic = evt
                    .prev_content
                    .clone()
                    .and_then(|p| serde_json::from_value::<TopicContent>(p).ok())
                    .map(|p| p.topic);
                api.handle_room_topic(
                    self,
                    MatrixRoomTopicEvent {
                        event_id: evt.event_id.clone(),
                        topic: content.topic,
                        prev_topic,
                        orig_sender: orig_sender.cloned(),
                    },
                )
                .await
            }
            matrix::STATE_ROOM_AVATAR => {
                let Ok(content) = serde_json::from_value::<AvatarContent>(evt.content.clone()) else {
                    self.send_error_status(evt, &EventError::UnexpectedContent("m.room.avatar")).await;
                    return;
                };
                if content.url == self.with_row(|row| row.avatar_mxc.clone()) {
                    self.send_success_status(evt).await;
                    return;
                }
                let Some(api) = login.client.room_avatar_handler() else {
                    self.send_error_status(evt, &EventError::RoomMetadataNotSupported).await;
                    return;
                };
                let prev_url = evt
                    .prev_content
                    .clone()
                    .and_then(|p| serde_json::from_value::<AvatarContent>(p).ok())
                    .map(|p| p.url);
                api.handle_room_avatar(
                    self,
                    MatrixRoomAvatarEvent {
                        event_id: evt.event_id.clone(),
                        url: content.url,
                        prev_url,
                        orig_sender: orig_sender.cloned(),
                    },
                )
                .await
            }
            _ => return,
        };
        match changed {
            Ok(true) => {
                self.update_bridge_info().await;
                if let Err(err) = self.save().await {
                    error!(portal_id = %self.key(), error = %err, "Failed to save portal after updating room metadata");
                }
                self.send_success_status(evt).await;
            }
            Ok(false) => {
                self.send_success_status(evt).await;
            }
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to handle Matrix room metadata");
                self.send_error_status(evt, &err).await;
            }
        }
    }

    async fn handle_matrix_account_data(&self, login: &Arc<UserLogin>, evt: &MatrixEvent) {
        let result = match evt.event_type.as_str() {
            matrix::ACCOUNT_DATA_MARKED_UNREAD => {
                let Some(api) = login.client.marked_unread_handler() else {
                    return;
                };
                let Ok(content) = serde_json::from_value::<MarkedUnreadContent>(evt.content.clone())
                else {
                    error!(portal_id = %self.key(), "Unexpected parsed content type");
                    return;
                };
                api.handle_marked_unread(self, content.unread).await
            }
            matrix::ACCOUNT_DATA_ROOM_TAGS => {
                let Some(api) = login.client.room_tag_handler() else {
                    return;
                };
                let tag = evt
                    .content
                    .get("tags")
                    .and_then(|tags| tags.as_object())
                    .and_then(|tags| tags.keys().next())
                    .cloned();
                api.handle_room_tag(self, tag).await
            }
            matrix::ACCOUNT_DATA_MUTE => {
                let Some(api) = login.client.mute_handler() else {
                    return;
                };
                let muted_until = evt
                    .content
                    .get("muted_until")
                    .and_then(|v| v.as_i64())
                    .and_then(|ts| Utc.timestamp_millis_opt(ts).single());
                api.handle_mute(self, muted_until).await
            }
            _ => return,
        };
        if let Err(err) = result {
            error!(portal_id = %self.key(), error = %err, "Failed to handle Matrix room account data");
        }
    }

    async fn handle_matrix_membership(
        &self,
        login: &Arc<UserLogin>,
        orig_sender: Option<&OrigSender>,
        evt: &MatrixEvent,
    ) {
        let Some(api) = login.client.membership_handler() else {
            self.send_error_status(evt, &EventError::MembershipNotSupported).await;
            return;
        };
        let Some(target_mxid) = evt.state_key.clone() else {
            return;
        };
        let content: MemberContent = match serde_json::from_value(evt.content.clone()) {
            Ok(content) => content,
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Unexpected parsed content type");
                self.send_error_status(evt, &EventError::UnexpectedContent("m.room.member")).await;
                return;
            }
        };
        let prev_membership = evt
            .prev_content
            .clone()
            .and_then(|p| serde_json::from_value::<MemberContent>(p).ok())
            .map(|p| p.membership)
            .unwrap_or_else(|| matrix::MEMBERSHIP_LEAVE.to_string());
        let is_self = login.user_mxid() == target_mxid;
        if content.membership == matrix::MEMBERSHIP_LEAVE
            && !self.bridge.config.bridge.bridge_matrix_leave
        {
            debug!(portal_id = %self.key(), "Dropping leave event");
            return;
        }
        let mut target_ghost_id = None;
        let mut target_login_id = None;
        match self.bridge.identities.ghost_by_mxid(&target_mxid).await {
            Ok(Some(ghost)) => target_ghost_id = Some(ghost.id.clone()),
            Ok(None) => {
                let target_user = match self.bridge.identities.user_by_mxid(&target_mxid).await {
                    Ok(Some(user)) => Some(user),
                    Ok(None) => None,
                    Err(err) => {
                        error!(portal_id = %self.key(), error = %err, "Failed to get target user");
                        return;
                    }
                };
                if let Some(target_user) = target_user {
                    match self.find_preferred_login(&target_user, false).await {
                        Ok((Some(target_login), _)) => target_login_id = Some(target_login.id.clone()),
                        Ok((None, _)) | Err(EventError::NotLoggedIn) => {}
                        Err(err) => {
                            error!(portal_id = %self.key(), error = %err, "Failed to get target user login");
                            return;
                        }
                    }
                }
            }
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to get target ghost");
                return;
            }
        }
        let membership = content.membership.clone();
        let payload = MatrixMembershipEvent {
            event_id: evt.event_id.clone(),
            sender_mxid: evt.sender.clone(),
            target_mxid,
            target_ghost_id,
            target_login_id,
            change: MembershipChange {
                from: prev_membership,
                to: membership,
                is_self,
            },
            content,
            orig_sender: orig_sender.cloned(),
        };
        if let Err(err) = api.handle_membership(self, payload).await {
            error!(portal_id = %self.key(), error = %err, "Failed to handle Matrix membership change");
            self.send_error_status(evt, &err).await;
        }
    }
}
