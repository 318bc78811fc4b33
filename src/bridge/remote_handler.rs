use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::database::{Message as DbMessage, Reaction as DbReaction};
use crate::error::EventError;
use crate::matrix::{
    self, content_with_raw, MatrixApi, MessageContent, MessageStatus, MessageStatusEventInfo,
    ReactionContent, RedactionContent,
};
use crate::network::{
    ConvertedEdit, ConvertedMessage, RemoteEvent, RemoteEventType, RemoteMessage,
    RemoteMessageUpsert, RemoteReaction, RemoteReactionRemove, RemoteReactionSync,
};

use super::portal::Portal;
use super::relations::RelationMeta;
use super::identity::UserLogin;

fn event_ts(evt: &dyn RemoteEvent) -> DateTime<Utc> {
    evt.timestamp().unwrap_or_else(Utc::now)
}

impl Portal {
    pub(crate) fn handle_remote_event<'a>(
        self: &'a Arc<Self>,
        source: &'a Arc<UserLogin>,
        evt: &'a dyn RemoteEvent,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let evt_type = evt.event_type();
        let mut log_fields = Vec::new();
        evt.add_log_context(&mut log_fields);
        debug!(
            portal_id = %self.key(),
            source_id = %source.id,
            bridge_evt_type = %evt_type,
            context = ?log_fields,
            "Handling remote event"
        );
        if self.mxid().is_none() {
            if !evt.should_create_portal() {
                debug!(portal_id = %self.key(), "Dropping event as portal doesn't exist");
                return;
            }
            let mut info = None;
            if let Some(resync) = evt.as_chat_resync() {
                match resync.get_chat_info(self).await {
                    Ok(found) => info = found,
                    Err(err) => {
                        error!(
                            portal_id = %self.key(),
                            error = %err,
                            "Failed to get chat info for portal creation from chat resync event"
                        );
                    }
                }
            }
            if let Err(err) = self.create_matrix_room_in_loop(source, info).await {
                error!(portal_id = %self.key(), error = %err, "Failed to create portal to handle event");
                return;
            }
            if evt_type == RemoteEventType::ChatResync {
                debug!(portal_id = %self.key(), "Not handling chat resync event further as portal was created by it");
                return;
            }
        }
        evt.pre_handle(self).await;
        match evt_type {
            RemoteEventType::Unknown => {
                debug!(portal_id = %self.key(), "Ignoring remote event with type unknown");
            }
            RemoteEventType::Message | RemoteEventType::MessageUpsert => {
                match evt.as_message() {
                    Some(message) => self.handle_remote_message(source, message).await,
                    None => warn!(portal_id = %self.key(), "Message event is missing the message facet"),
                }
            }
            RemoteEventType::Edit => match evt.as_edit() {
                Some(edit) => self.handle_remote_edit(source, edit).await,
                None => warn!(portal_id = %self.key(), "Edit event is missing the edit facet"),
            },
            RemoteEventType::Reaction => match evt.as_reaction() {
                Some(reaction) => self.handle_remote_reaction(source, reaction).await,
                None => warn!(portal_id = %self.key(), "Reaction event is missing the reaction facet"),
            },
            RemoteEventType::ReactionRemove => match evt.as_reaction_remove() {
                Some(removal) => self.handle_remote_reaction_remove(source, removal).await,
                None => warn!(portal_id = %self.key(), "Reaction removal event is missing its facet"),
            },
            RemoteEventType::ReactionSync => match evt.as_reaction_sync() {
                Some(sync) => self.handle_remote_reaction_sync(source, sync).await,
                None => warn!(portal_id = %self.key(), "Reaction sync event is missing its facet"),
            },
            RemoteEventType::MessageRemove => match evt.as_message_remove() {
                Some(removal) => self.handle_remote_message_remove(source, removal).await,
                None => warn!(portal_id = %self.key(), "Message removal event is missing its facet"),
            },
            RemoteEventType::ReadReceipt => match evt.as_read_receipt() {
                Some(receipt) => self.handle_remote_read_receipt(source, receipt).await,
                None => warn!(portal_id = %self.key(), "Read receipt event is missing its facet"),
            },
            RemoteEventType::MarkUnread => match evt.as_mark_unread() {
                Some(mark) => self.handle_remote_mark_unread(source, mark).await,
                None => warn!(portal_id = %self.key(), "Mark unread event is missing its facet"),
            },
            RemoteEventType::DeliveryReceipt => match evt.as_delivery_receipt() {
                Some(receipt) => self.handle_remote_delivery_receipt(source, receipt).await,
                None => warn!(portal_id = %self.key(), "Delivery receipt event is missing its facet"),
            },
            RemoteEventType::Typing => match evt.as_typing() {
                Some(typing) => self.handle_remote_typing(source, typing).await,
                None => warn!(portal_id = %self.key(), "Typing event is missing its facet"),
            },
            RemoteEventType::ChatInfoChange => match evt.as_chat_info_change() {
                Some(change) => self.handle_remote_chat_info_change(source, change).await,
                None => warn!(portal_id = %self.key(), "Chat info change event is missing its facet"),
            },
            RemoteEventType::ChatResync => match evt.as_chat_resync() {
                Some(resync) => self.handle_remote_chat_resync(source, resync).await,
                None => warn!(portal_id = %self.key(), "Chat resync event is missing its facet"),
            },
            RemoteEventType::ChatDelete => self.handle_remote_chat_delete(source).await,
        }
        })
    }

    async fn handle_remote_message(self: &Arc<Self>, source: &Arc<UserLogin>, evt: &dyn RemoteMessage) {
        let upsert = if evt.event_type() == RemoteEventType::MessageUpsert {
            evt.as_upsert()
        } else {
            None
        };
        if let Some(db_message) = self.check_pending_message(evt).await {
            // Feed the finalized row into the upsert handler so the echo and
            // upsert paths don't duplicate work.
            if let Some(upsert) = upsert {
                self.handle_remote_upsert(source, upsert, vec![db_message]).await;
            }
            return;
        }
        let message_id = evt.message_id();
        let existing = match self.bridge.db.get_message_parts(self.receiver(), &message_id).await {
            Ok(existing) => existing,
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to check if message is a duplicate");
                Vec::new()
            }
        };
        if !existing.is_empty() {
            match upsert {
                Some(upsert) => {
                    if self.handle_remote_upsert(source, upsert, existing).await {
                        debug!(portal_id = %self.key(), "Upsert handler said to continue message handling normally");
                    } else {
                        return;
                    }
                }
                None => {
                    debug!(
                        portal_id = %self.key(),
                        existing_mxid = %existing[0].mxid,
                        "Ignoring duplicate message"
                    );
                    return;
                }
            }
        }
        let intent = self.intent_for(&evt.sender(), source).await;
        let ts = event_ts(evt);
        let converted = match evt.convert(self, &intent).await {
            Ok(converted) => converted,
            Err(EventError::IgnoringRemoteEvent) => {
                debug!(portal_id = %self.key(), "Remote message handling was cancelled by convert function");
                return;
            }
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to convert remote message");
                self.send_remote_error_notice(&intent, &err, ts, "message").await;
                return;
            }
        };
        self.send_converted_message(&message_id, &intent, &evt.sender().sender, &converted, ts)
            .await;
    }

    /// Returns whether normal message handling should continue.
    async fn handle_remote_upsert(
        self: &Arc<Self>,
        source: &Arc<UserLogin>,
        evt: &dyn RemoteMessageUpsert,
        mut existing: Vec<DbMessage>,
    ) -> bool {
        let intent = self.intent_for(&evt.sender(), source).await;
        let res = match evt.handle_existing(self, &intent, &mut existing).await {
            Ok(res) => res,
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to handle existing message in upsert event");
                return false;
            }
        };
        if res.save_parts {
            for part in &existing {
                if let Err(err) = self.bridge.db.update_message(part).await {
                    error!(
                        portal_id = %self.key(),
                        part_id = %part.part_id,
                        error = %err,
                        "Failed to update message part in database"
                    );
                }
            }
        }
        for sub_evt in &res.sub_events {
            let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> =
                Box::pin(self.handle_remote_event(source, sub_evt.as_ref()));
            fut.await;
        }
        res.continue_message_handling
    }

    /// Emits each converted part, persisting a row per part. The thread
    /// cursor advances across non-fake parts so later parts continue the
    /// thread from the previous one.
    pub(crate) async fn send_converted_message(
        &self,
        id: &str,
        intent: &Arc<dyn MatrixApi>,
        sender_id: &str,
        converted: &ConvertedMessage,
        ts: DateTime<Utc>,
    ) -> Vec<DbMessage> {
        let Some(room_id) = self.mxid() else {
            return Vec::new();
        };
        let meta = self
            .relation_meta(
                id,
                converted.reply_to.as_ref(),
                converted.thread_root.as_deref(),
                false,
            )
            .await;
        let mut prev_thread_event = meta.prev_thread_event.clone();
        let mut output = Vec::with_capacity(converted.parts.len());
        for part in &converted.parts {
            let mut content = part.content.clone();
            let part_meta = RelationMeta {
                reply_to: meta.reply_to.clone(),
                thread_root: meta.thread_root.clone(),
                prev_thread_event: prev_thread_event.clone(),
            };
            self.apply_relation_meta(&mut content, &part_meta);
            let mut db_message = DbMessage {
                id: id.to_string(),
                part_id: part.part_id.clone(),
                sender_id: sender_id.to_string(),
                sender_mxid: intent.user_id(),
                thread_root_id: converted.thread_root.clone().unwrap_or_default(),
                reply_to_id: converted.reply_to.as_ref().map(|r| r.message_id.clone()),
                reply_to_part_id: converted.reply_to.as_ref().and_then(|r| r.part_id.clone()),
                metadata: part.metadata.clone(),
                ..Default::default()
            };
            db_message.set_key(self.key());
            db_message.set_timestamp(ts);
            if part.dont_bridge {
                db_message.set_fake_mxid();
            } else {
                let value = content_with_raw(
                    serde_json::to_value(&content).unwrap_or_default(),
                    part.extra.as_ref(),
                );
                match intent
                    .send_message(&room_id, &part.event_type, value, Some(ts))
                    .await
                {
                    Ok(resp) => {
                        debug!(
                            portal_id = %self.key(),
                            event_id = %resp.event_id,
                            part_id = %part.part_id,
                            "Sent message part to Matrix"
                        );
                        db_message.mxid = resp.event_id;
                    }
                    Err(err) => {
                        error!(
                            portal_id = %self.key(),
                            part_id = %part.part_id,
                            error = %err,
                            "Failed to send message part to Matrix"
                        );
                        continue;
                    }
                }
            }
            if let Err(err) = self.bridge.db.insert_message(&db_message).await {
                error!(
                    portal_id = %self.key(),
                    part_id = %part.part_id,
                    error = %err,
                    "Failed to save message part to database"
                );
            }
            if let Some(disappear) = &converted.disappear {
                if disappear.is_enabled() && !db_message.has_fake_mxid() {
                    self.enqueue_disappearing(&db_message.mxid, disappear, db_message.timestamp_time());
                }
            }
            if prev_thread_event.is_some() && !db_message.has_fake_mxid() {
                prev_thread_event = Some(db_message.clone());
            }
            output.push(db_message);
        }
        output
    }

    async fn send_remote_error_notice(
        &self,
        intent: &Arc<dyn MatrixApi>,
        err: &EventError,
        ts: DateTime<Utc>,
        evt_type_name: &str,
    ) {
        let Some(room_id) = self.mxid() else {
            return;
        };
        let content = MessageContent::notice(format!(
            "An error occurred while processing an incoming {}",
            evt_type_name
        ));
        let mut raw = serde_json::Map::new();
        raw.insert(
            "fi.mau.bridge.internal_error".to_string(),
            serde_json::Value::String(err.to_string()),
        );
        let value = content_with_raw(serde_json::to_value(&content).unwrap_or_default(), Some(&raw));
        match intent
            .send_message(&room_id, matrix::EVENT_MESSAGE, value, Some(ts))
            .await
        {
            Ok(resp) => {
                debug!(
                    portal_id = %self.key(),
                    event_id = %resp.event_id,
                    "Sent error notice after remote event handling failed"
                );
            }
            Err(send_err) => {
                error!(
                    portal_id = %self.key(),
                    error = %send_err,
                    "Failed to send error notice after remote event handling failed"
                );
            }
        }
    }

    async fn handle_remote_edit(&self, source: &Arc<UserLogin>, evt: &dyn crate::network::RemoteEdit) {
        let existing = match evt.target_db_messages() {
            Some(bundled) => bundled,
            None => {
                let target_id = evt.target_message();
                match self.bridge.db.get_message_parts(self.receiver(), &target_id).await {
                    Ok(existing) => existing,
                    Err(err) => {
                        error!(portal_id = %self.key(), error = %err, "Failed to get edit target message");
                        return;
                    }
                }
            }
        };
        if existing.is_empty() {
            warn!(portal_id = %self.key(), "Edit target message not found");
            return;
        }
        let intent = self.intent_for(&evt.sender(), source).await;
        let ts = event_ts(evt);
        let converted = match evt.convert_edit(self, &intent, &existing).await {
            Ok(converted) => converted,
            Err(EventError::IgnoringRemoteEvent) => {
                debug!(portal_id = %self.key(), "Remote edit handling was cancelled by convert function");
                return;
            }
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to convert remote edit");
                self.send_remote_error_notice(&intent, &err, ts, "edit").await;
                return;
            }
        };
        self.send_converted_edit(&existing[0].id, &evt.sender().sender, converted, &intent, ts)
            .await;
    }

    pub(crate) async fn send_converted_edit(
        &self,
        target_id: &str,
        sender_id: &str,
        converted: ConvertedEdit,
        intent: &Arc<dyn MatrixApi>,
        ts: DateTime<Utc>,
    ) {
        let Some(room_id) = self.mxid() else {
            return;
        };
        for mut part in converted.modified_parts {
            let mut override_mxid = true;
            if part.part.key() != *self.key() {
                part.part.set_key(self.key());
            } else if !part.part.has_fake_mxid() {
                part.content.set_edit(part.part.mxid.clone());
                override_mxid = false;
            }
            if !part.dont_bridge {
                let mut value = content_with_raw(
                    serde_json::to_value(&part.content).unwrap_or_default(),
                    part.top_level_extra.as_ref(),
                );
                if let Some(new_content_extra) = &part.new_content_extra {
                    if let Some(new_content) = value
                        .get_mut("m.new_content")
                        .and_then(|v| v.as_object_mut())
                    {
                        for (k, v) in new_content_extra {
                            new_content.entry(k.clone()).or_insert_with(|| v.clone());
                        }
                    }
                }
                match intent
                    .send_message(&room_id, &part.event_type, value, Some(ts))
                    .await
                {
                    Ok(resp) => {
                        debug!(
                            portal_id = %self.key(),
                            event_id = %resp.event_id,
                            part_id = %part.part.part_id,
                            "Sent message part edit to Matrix"
                        );
                        if override_mxid {
                            part.part.mxid = resp.event_id;
                        }
                    }
                    Err(err) => {
                        error!(
                            portal_id = %self.key(),
                            part_mxid = %part.part.mxid,
                            error = %err,
                            "Failed to edit message part"
                        );
                        continue;
                    }
                }
            }
            part.part.edit_count += 1;
            if let Err(err) = self.bridge.db.update_message(&part.part).await {
                error!(
                    portal_id = %self.key(),
                    part_id = %part.part.part_id,
                    error = %err,
                    "Failed to update message part in database"
                );
            }
        }
        for part in converted.deleted_parts {
            let content = RedactionContent {
                redacts: part.mxid.clone(),
                reason: None,
            };
            match intent
                .send_message(
                    &room_id,
                    matrix::EVENT_REDACTION,
                    serde_json::to_value(&content).unwrap_or_default(),
                    Some(ts),
                )
                .await
            {
                Ok(resp) => {
                    debug!(
                        portal_id = %self.key(),
                        redaction_event_id = %resp.event_id,
                        redacted_event_id = %part.mxid,
                        part_id = %part.part_id,
                        "Sent redaction of message part to Matrix"
                    );
                }
                Err(err) => {
                    error!(
                        portal_id = %self.key(),
                        part_mxid = %part.mxid,
                        error = %err,
                        "Failed to redact message part deleted in edit"
                    );
                }
            }
            if let Err(err) = self
                .bridge
                .db
                .delete_message_part(self.receiver(), &part.id, &part.part_id)
                .await
            {
                error!(
                    portal_id = %self.key(),
                    part_id = %part.part_id,
                    error = %err,
                    "Failed to delete message part from database"
                );
            }
        }
        if let Some(added) = converted.added_parts {
            self.send_converted_message(target_id, intent, sender_id, &added, ts).await;
        }
    }

    async fn get_target_message_part(
        &self,
        target_message: &str,
        target_part: Option<String>,
    ) -> anyhow::Result<Option<DbMessage>> {
        match target_part {
            Some(part_id) => {
                self.bridge
                    .db
                    .get_message_part(self.receiver(), target_message, &part_id)
                    .await
            }
            None => {
                self.bridge
                    .db
                    .get_first_message_part(self.receiver(), target_message)
                    .await
            }
        }
    }

    async fn handle_remote_reaction(&self, source: &Arc<UserLogin>, evt: &dyn RemoteReaction) {
        let target = match self
            .get_target_message_part(&evt.target_message(), evt.target_part())
            .await
        {
            Ok(Some(target)) => target,
            Ok(None) => {
                warn!(portal_id = %self.key(), "Target message for reaction not found");
                return;
            }
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to get target message for reaction");
                return;
            }
        };
        let (emoji, emoji_id) = evt.reaction_emoji();
        let sender = evt.sender();
        let existing = match self
            .bridge
            .db
            .get_reaction(&target.id, &target.part_id, &sender.sender, &emoji_id)
            .await
        {
            Ok(existing) => existing,
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to check if reaction is a duplicate");
                return;
            }
        };
        if let Some(existing) = &existing {
            if !emoji_id.is_empty() || existing.emoji == emoji {
                debug!(portal_id = %self.key(), "Ignoring duplicate reaction");
                return;
            }
        }
        let ts = event_ts(evt);
        let intent = self.intent_for(&sender, source).await;
        self.send_converted_reaction(
            &sender.sender,
            &intent,
            &target,
            &emoji_id,
            &emoji,
            ts,
            evt.reaction_metadata(),
            evt.reaction_extra_content(),
        )
        .await;
        if let Some(existing) = existing {
            self.redact_reaction_event(&intent, &existing.mxid, ts).await;
        }
    }

    async fn redact_reaction_event(
        &self,
        intent: &Arc<dyn MatrixApi>,
        reaction_mxid: &str,
        ts: DateTime<Utc>,
    ) {
        let Some(room_id) = self.mxid() else {
            return;
        };
        let content = RedactionContent {
            redacts: reaction_mxid.to_string(),
            reason: None,
        };
        if let Err(err) = intent
            .send_message(
                &room_id,
                matrix::EVENT_REDACTION,
                serde_json::to_value(&content).unwrap_or_default(),
                Some(ts),
            )
            .await
        {
            error!(portal_id = %self.key(), error = %err, "Failed to redact old reaction");
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn send_converted_reaction(
        &self,
        sender_id: &str,
        intent: &Arc<dyn MatrixApi>,
        target: &DbMessage,
        emoji_id: &str,
        emoji: &str,
        ts: DateTime<Utc>,
        metadata: String,
        extra_content: Option<serde_json::Map<String, serde_json::Value>>,
    ) {
        let Some(room_id) = self.mxid() else {
            return;
        };
        let mut db_reaction = DbReaction {
            message_id: target.id.clone(),
            message_part_id: target.part_id.clone(),
            sender_id: sender_id.to_string(),
            sender_mxid: intent.user_id(),
            emoji_id: emoji_id.to_string(),
            metadata,
            ..Default::default()
        };
        db_reaction.set_key(self.key());
        db_reaction.timestamp = ts.timestamp_millis();
        if emoji_id.is_empty() {
            db_reaction.emoji = emoji.to_string();
        }
        let content = ReactionContent::annotation(target.mxid.clone(), emoji);
        let value = content_with_raw(
            serde_json::to_value(&content).unwrap_or_default(),
            extra_content.as_ref(),
        );
        match intent
            .send_message(&room_id, matrix::EVENT_REACTION, value, Some(ts))
            .await
        {
            Ok(resp) => {
                debug!(
                    portal_id = %self.key(),
                    event_id = %resp.event_id,
                    "Sent reaction to Matrix"
                );
                db_reaction.mxid = resp.event_id;
            }
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to send reaction to Matrix");
                return;
            }
        }
        if let Err(err) = self.bridge.db.upsert_reaction(&db_reaction).await {
            error!(portal_id = %self.key(), error = %err, "Failed to save reaction to database");
        }
    }

    async fn remove_remote_reaction(
        &self,
        old: &DbReaction,
        intent: Option<Arc<dyn MatrixApi>>,
        ts: DateTime<Utc>,
        delete_row: bool,
    ) {
        let mut intent = intent;
        if intent.is_none() && !old.sender_mxid.is_empty() {
            match self.intent_for_mxid(&old.sender_mxid).await {
                Ok(found) => intent = found,
                Err(err) => {
                    error!(
                        portal_id = %self.key(),
                        reaction_sender_mxid = %old.sender_mxid,
                        error = %err,
                        "Failed to get intent for removing reaction"
                    );
                }
            }
        }
        let intent = intent.unwrap_or_else(|| {
            warn!(
                portal_id = %self.key(),
                reaction_sender_id = %old.sender_id,
                reaction_sender_mxid = %old.sender_mxid,
                "Didn't find intent for removing reaction, using bridge bot"
            );
            Arc::clone(&self.bridge.bot)
        });
        self.redact_reaction_event(&intent, &old.mxid, ts).await;
        if delete_row {
            if let Err(err) = self.bridge.db.delete_reaction(old).await {
                error!(portal_id = %self.key(), error = %err, "Failed to delete old reaction row");
            }
        }
    }

    async fn handle_remote_reaction_sync(&self, source: &Arc<UserLogin>, evt: &dyn RemoteReactionSync) {
        let ts = event_ts(evt);
        let target = match self
            .get_target_message_part(&evt.target_message(), evt.target_part())
            .await
        {
            Ok(Some(target)) => target,
            Ok(None) => {
                warn!(portal_id = %self.key(), "Target message for reaction not found");
                return;
            }
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to get target message for reaction");
                return;
            }
        };
        let existing_reactions = match evt.target_part() {
            Some(part_id) => {
                self.bridge
                    .db
                    .get_reactions_to_part(&evt.target_message(), &part_id)
                    .await
            }
            None => self.bridge.db.get_reactions_to_message(&evt.target_message()).await,
        };
        let existing_reactions = match existing_reactions {
            Ok(existing) => existing,
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to get existing reactions");
                return;
            }
        };
        let mut existing: HashMap<String, HashMap<String, DbReaction>> = HashMap::new();
        for reaction in existing_reactions {
            existing
                .entry(reaction.sender_id.clone())
                .or_default()
                .insert(reaction.emoji_id.clone(), reaction);
        }

        let new_data = evt.reactions();
        for (user_id, user_reactions) in new_data.users {
            let mut existing_user = existing.remove(&user_id).unwrap_or_default();
            let incoming_count = user_reactions.reactions.len();
            for reaction in &user_reactions.reactions {
                let reaction_ts = reaction.timestamp.unwrap_or(ts);
                if let Some(old) = existing_user.remove(&reaction.emoji_id) {
                    if !reaction.emoji_id.is_empty() {
                        continue;
                    }
                    // Same key, different emoji text: add the new one and
                    // redact the old event without touching the row, since
                    // the upsert replaces it.
                    let intent = self.intent_for(&reaction.sender, source).await;
                    self.send_converted_reaction(
                        &reaction.sender.sender,
                        &intent,
                        &target,
                        &reaction.emoji_id,
                        &reaction.emoji,
                        reaction_ts,
                        reaction.metadata.clone(),
                        reaction.extra_content.clone(),
                    )
                    .await;
                    self.remove_remote_reaction(&old, Some(intent), reaction_ts, false).await;
                } else {
                    let intent = self.intent_for(&reaction.sender, source).await;
                    self.send_converted_reaction(
                        &reaction.sender.sender,
                        &intent,
                        &target,
                        &reaction.emoji_id,
                        &reaction.emoji,
                        reaction_ts,
                        reaction.metadata.clone(),
                        reaction.extra_content.clone(),
                    )
                    .await;
                }
            }
            let total = existing_user.len() + incoming_count;
            if user_reactions.has_all_reactions {
                for old in existing_user.values() {
                    self.remove_remote_reaction(old, None, ts, true).await;
                }
            } else if user_reactions.max_count > 0 && total > user_reactions.max_count {
                let mut remaining: Vec<DbReaction> = existing_user.into_values().collect();
                remaining.sort_by(|a, b| {
                    a.timestamp
                        .cmp(&b.timestamp)
                        .then_with(|| a.emoji_id.cmp(&b.emoji_id))
                });
                let number_to_remove = total - user_reactions.max_count;
                for old in remaining.iter().take(number_to_remove) {
                    self.remove_remote_reaction(old, None, ts, true).await;
                }
            }
        }
        if new_data.has_all_users {
            for user_reactions in existing.values() {
                for old in user_reactions.values() {
                    self.remove_remote_reaction(old, None, ts, true).await;
                }
            }
        }
    }

    async fn handle_remote_reaction_remove(
        &self,
        source: &Arc<UserLogin>,
        evt: &dyn RemoteReactionRemove,
    ) {
        let sender = evt.sender();
        let target = match evt.target_part() {
            Some(part_id) => {
                self.bridge
                    .db
                    .get_reaction(&evt.target_message(), &part_id, &sender.sender, &evt.removed_emoji_id())
                    .await
            }
            None => {
                self.bridge
                    .db
                    .get_reaction_without_part(&evt.target_message(), &sender.sender, &evt.removed_emoji_id())
                    .await
            }
        };
        let target = match target {
            Ok(Some(target)) => target,
            Ok(None) => {
                warn!(portal_id = %self.key(), "Target reaction not found");
                return;
            }
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to get target reaction for removal");
                return;
            }
        };
        let mut intent = match self.intent_for_mxid(&target.sender_mxid).await {
            Ok(found) => found,
            Err(err) => {
                error!(
                    portal_id = %self.key(),
                    sender_mxid = %target.sender_mxid,
                    error = %err,
                    "Failed to get intent for removing reaction"
                );
                None
            }
        };
        if intent.is_none() {
            intent = Some(self.intent_for(&sender, source).await);
        }
        let ts = event_ts(evt);
        self.redact_reaction_event(intent.as_ref().unwrap(), &target.mxid, ts).await;
        if let Err(err) = self.bridge.db.delete_reaction(&target).await {
            error!(portal_id = %self.key(), error = %err, "Failed to delete target reaction from database");
        }
    }

    async fn handle_remote_message_remove(
        &self,
        source: &Arc<UserLogin>,
        evt: &dyn crate::network::RemoteMessageRemove,
    ) {
        let target_id = evt.target_message();
        let target_parts = match self.bridge.db.get_message_parts(self.receiver(), &target_id).await {
            Ok(parts) => parts,
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to get target message for removal");
                return;
            }
        };
        if target_parts.is_empty() {
            debug!(portal_id = %self.key(), "Target message not found");
            return;
        }
        let mut intent = self.intent_for(&evt.sender(), source).await;
        if intent.user_id() == self.bridge.bot.user_id() {
            // Fall back to the original sender's intent when the resolver
            // only produced the bot.
            match self.intent_for_mxid(&target_parts[0].sender_mxid).await {
                Ok(Some(sender_intent)) => intent = sender_intent,
                Ok(None) => {}
                Err(err) => {
                    error!(
                        portal_id = %self.key(),
                        sender_mxid = %target_parts[0].sender_mxid,
                        error = %err,
                        "Failed to get intent for removing message"
                    );
                }
            }
        }
        self.redact_message_parts(&target_parts, &intent, event_ts(evt)).await;
        if let Err(err) = self.bridge.db.delete_message_parts(self.receiver(), &target_id).await {
            error!(portal_id = %self.key(), error = %err, "Failed to delete target message from database");
        }
    }

    pub(crate) async fn redact_message_parts(
        &self,
        parts: &[DbMessage],
        intent: &Arc<dyn MatrixApi>,
        ts: DateTime<Utc>,
    ) {
        let Some(room_id) = self.mxid() else {
            return;
        };
        for part in parts {
            if part.has_fake_mxid() {
                continue;
            }
            let content = RedactionContent {
                redacts: part.mxid.clone(),
                reason: None,
            };
            match intent
                .send_message(
                    &room_id,
                    matrix::EVENT_REDACTION,
                    serde_json::to_value(&content).unwrap_or_default(),
                    Some(ts),
                )
                .await
            {
                Ok(resp) => {
                    debug!(
                        portal_id = %self.key(),
                        redaction_event_id = %resp.event_id,
                        redacted_event_id = %part.mxid,
                        part_id = %part.part_id,
                        "Sent redaction of message part to Matrix"
                    );
                }
                Err(err) => {
                    error!(
                        portal_id = %self.key(),
                        part_mxid = %part.mxid,
                        error = %err,
                        "Failed to redact message part"
                    );
                }
            }
        }
    }

    async fn handle_remote_read_receipt(
        &self,
        source: &Arc<UserLogin>,
        evt: &dyn crate::network::RemoteReadReceipt,
    ) {
        let mut last_target: Option<DbMessage> = None;
        if let Some(last_target_id) = evt.last_receipt_target() {
            match self.bridge.db.get_last_message_part(self.receiver(), &last_target_id).await {
                Ok(Some(target)) => last_target = Some(target),
                Ok(None) => {
                    debug!(
                        portal_id = %self.key(),
                        last_target_id = %last_target_id,
                        "Last target message not found"
                    );
                }
                Err(err) => {
                    error!(
                        portal_id = %self.key(),
                        last_target_id = %last_target_id,
                        error = %err,
                        "Failed to get last target message for read receipt"
                    );
                    return;
                }
            }
        }
        if last_target.is_none() {
            for target_id in evt.receipt_targets() {
                match self.bridge.db.get_last_message_part(self.receiver(), &target_id).await {
                    Ok(Some(target)) => {
                        if last_target
                            .as_ref()
                            .is_none_or(|current| target.timestamp > current.timestamp)
                        {
                            last_target = Some(target);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        error!(
                            portal_id = %self.key(),
                            target_id = %target_id,
                            error = %err,
                            "Failed to get target message for read receipt"
                        );
                        return;
                    }
                }
            }
        }
        if last_target.is_none() {
            if let Some(read_up_to) = evt.read_up_to() {
                match self
                    .bridge
                    .db
                    .get_last_message_before(self.key(), read_up_to.timestamp_millis())
                    .await
                {
                    Ok(found) => last_target = found,
                    Err(err) => {
                        error!(portal_id = %self.key(), error = %err, "Failed to get target message for read receipt");
                    }
                }
            }
        }
        let Some(last_target) = last_target else {
            warn!(portal_id = %self.key(), "No target message found for read receipt");
            return;
        };
        let sender = evt.sender();
        let intent = self.intent_for(&sender, source).await;
        let Some(room_id) = self.mxid() else {
            return;
        };
        if let Err(err) = intent.mark_read(&room_id, &last_target.mxid, event_ts(evt)).await {
            error!(
                portal_id = %self.key(),
                target_mxid = %last_target.mxid,
                error = %err,
                "Failed to bridge read receipt"
            );
        } else {
            debug!(portal_id = %self.key(), target_mxid = %last_target.mxid, "Bridged read receipt");
        }
        if sender.is_from_me {
            self.bridge.disappearing.start_all(&room_id).await;
        }
    }

    async fn handle_remote_mark_unread(
        &self,
        source: &Arc<UserLogin>,
        evt: &dyn crate::network::RemoteMarkUnread,
    ) {
        if !evt.sender().is_from_me {
            warn!(portal_id = %self.key(), "Ignoring mark unread event from non-self user");
            return;
        }
        let Some(dp) = source.user.double_puppet() else {
            return;
        };
        let Some(room_id) = self.mxid() else {
            return;
        };
        if let Err(err) = dp.mark_unread(&room_id, evt.unread()).await {
            error!(portal_id = %self.key(), error = %err, "Failed to bridge mark unread event");
        }
    }

    async fn handle_remote_delivery_receipt(
        &self,
        source: &Arc<UserLogin>,
        evt: &dyn crate::network::RemoteDeliveryReceipt,
    ) {
        let sender = evt.sender();
        if !self.room_type().is_dm() || Some(&sender.sender) != self.other_user_id().as_ref() {
            return;
        }
        let Some(room_id) = self.mxid() else {
            return;
        };
        let intent = self.intent_for(&sender, source).await;
        for target_id in evt.receipt_targets() {
            let target_parts = match self.bridge.db.get_message_parts(self.receiver(), &target_id).await {
                Ok(parts) => parts,
                Err(err) => {
                    error!(
                        portal_id = %self.key(),
                        target_id = %target_id,
                        error = %err,
                        "Failed to get target message for delivery receipt"
                    );
                    continue;
                }
            };
            if target_parts.is_empty() {
                continue;
            }
            // Ghost-sent messages don't need delivery status on the Matrix side.
            if self
                .bridge
                .bot
                .parse_ghost_user_id(&target_parts[0].sender_mxid)
                .is_some()
            {
                continue;
            }
            for part in &target_parts {
                self.bridge
                    .bot
                    .send_message_status(
                        &MessageStatus::delivered(vec![intent.user_id()]),
                        &MessageStatusEventInfo {
                            room_id: room_id.clone(),
                            event_id: part.mxid.clone(),
                            sender: part.sender_mxid.clone(),
                        },
                    )
                    .await;
            }
        }
    }

    async fn handle_remote_typing(&self, source: &Arc<UserLogin>, evt: &dyn crate::network::RemoteTyping) {
        let Some(room_id) = self.mxid() else {
            return;
        };
        let intent = self.intent_for(&evt.sender(), source).await;
        if let Err(err) = intent
            .mark_typing(&room_id, evt.typing_type(), evt.timeout())
            .await
        {
            error!(portal_id = %self.key(), error = %err, "Failed to bridge typing event");
        }
    }

    async fn handle_remote_chat_info_change(
        &self,
        source: &Arc<UserLogin>,
        evt: &dyn crate::network::RemoteChatInfoChange,
    ) {
        let change = match evt.get_chat_info_change().await {
            Ok(change) => change,
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to get chat info change");
                return;
            }
        };
        self.process_chat_info_change(&evt.sender(), source, change, event_ts(evt)).await;
    }

    async fn handle_remote_chat_resync(
        &self,
        source: &Arc<UserLogin>,
        evt: &dyn crate::network::RemoteChatResync,
    ) {
        match evt.get_chat_info(self).await {
            Ok(Some(info)) => {
                self.update_info(&info, source, None, None).await;
            }
            Ok(None) => {}
            Err(err) => {
                error!(portal_id = %self.key(), error = %err, "Failed to get chat info from resync event");
            }
        }
        if self.bridge.config.bridge.backfill.enabled {
            let cutoff = (Utc::now() + chrono::Duration::seconds(10)).timestamp_millis();
            let latest = match self.bridge.db.get_last_message_before(self.key(), cutoff).await {
                Ok(latest) => latest,
                Err(err) => {
                    error!(
                        portal_id = %self.key(),
                        error = %err,
                        "Failed to get last message in portal to check if backfill is necessary"
                    );
                    return;
                }
            };
            match evt.check_needs_backfill(latest.as_ref()).await {
                Ok(true) => self.enqueue_forward_backfill(source).await,
                Ok(false) => {}
                Err(err) => {
                    error!(portal_id = %self.key(), error = %err, "Failed to check if backfill is needed");
                }
            }
        }
    }

    async fn handle_remote_chat_delete(&self, _source: &Arc<UserLogin>) {
        let mxid = self.mxid();
        if let Err(err) = self.delete().await {
            error!(portal_id = %self.key(), error = %err, "Failed to delete portal from database");
            return;
        }
        if let Some(mxid) = mxid {
            if let Err(err) = self.bridge.bot.delete_room(&mxid).await {
                error!(portal_id = %self.key(), error = %err, "Failed to delete Matrix room");
            }
        }
    }
}
