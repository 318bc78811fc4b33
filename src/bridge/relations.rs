use tracing::{error, warn};

use crate::database::Message as DbMessage;
use crate::matrix::MessageContent;
use crate::network::ReplyRef;

use super::portal::Portal;

/// Resolved Matrix-side relation targets for one remote message.
#[derive(Default)]
pub(crate) struct RelationMeta {
    pub reply_to: Option<DbMessage>,
    pub thread_root: Option<DbMessage>,
    /// Latest message in the thread; new parts continue from it.
    pub prev_thread_event: Option<DbMessage>,
}

impl Portal {
    /// Maps remote reply/thread pointers to Matrix event ids. In batch-send
    /// mode missing targets are synthesized with deterministic event ids so
    /// backfill can reference parents that haven't been sent yet.
    pub(crate) async fn relation_meta(
        &self,
        current_msg: &str,
        reply_to: Option<&ReplyRef>,
        thread_root: Option<&str>,
        is_batch_send: bool,
    ) -> RelationMeta {
        let mut meta = RelationMeta::default();
        let room_id = self.mxid().unwrap_or_default();
        if let Some(reply) = reply_to {
            let found = match &reply.part_id {
                Some(part_id) => {
                    self.bridge
                        .db
                        .get_message_part(self.receiver(), &reply.message_id, part_id)
                        .await
                }
                None => {
                    self.bridge
                        .db
                        .get_first_message_part(self.receiver(), &reply.message_id)
                        .await
                }
            };
            match found {
                Ok(Some(target)) => meta.reply_to = Some(target),
                Ok(None) => {
                    if is_batch_send {
                        let mut synth = DbMessage::default();
                        synth.mxid = self.bridge.bot.generate_deterministic_event_id(
                            &room_id,
                            self.key(),
                            &reply.message_id,
                            reply.part_id.as_deref().unwrap_or(""),
                        );
                        meta.reply_to = Some(synth);
                    } else {
                        warn!(
                            portal_id = %self.key(),
                            reply_to = %reply.message_id,
                            "Reply target message not found in database"
                        );
                    }
                }
                Err(err) => {
                    error!(portal_id = %self.key(), error = %err, "Failed to get reply target message from database");
                }
            }
        }
        if let Some(root_id) = thread_root {
            if root_id != current_msg {
                match self.bridge.db.get_first_thread_message(self.key(), root_id).await {
                    Ok(Some(root)) => {
                        meta.thread_root = Some(root);
                        match self.bridge.db.get_last_thread_message(self.key(), root_id).await {
                            Ok(prev) => meta.prev_thread_event = prev,
                            Err(err) => {
                                error!(portal_id = %self.key(), error = %err, "Failed to get last thread message from database");
                            }
                        }
                    }
                    Ok(None) => {
                        if is_batch_send {
                            let mut synth = DbMessage::default();
                            synth.mxid = self.bridge.bot.generate_deterministic_event_id(
                                &room_id,
                                self.key(),
                                root_id,
                                "",
                            );
                            meta.thread_root = Some(synth);
                        } else {
                            warn!(
                                portal_id = %self.key(),
                                thread_root = %root_id,
                                "Thread root message not found in database"
                            );
                        }
                    }
                    Err(err) => {
                        error!(portal_id = %self.key(), error = %err, "Failed to get thread root message from database");
                    }
                }
                if meta.prev_thread_event.is_none() {
                    meta.prev_thread_event = meta.thread_root.clone();
                }
            }
        }
        meta
    }

    /// Applies resolved relations to outgoing content. A reply also mentions
    /// the reply target's sender.
    pub(crate) fn apply_relation_meta(&self, content: &mut MessageContent, meta: &RelationMeta) {
        if let (Some(root), Some(prev)) = (&meta.thread_root, &meta.prev_thread_event) {
            content.set_thread(root.mxid.clone(), prev.mxid.clone());
        }
        if let Some(reply_to) = &meta.reply_to {
            content.set_reply(reply_to.mxid.clone());
            if !reply_to.sender_mxid.is_empty() {
                content.add_mention(reply_to.sender_mxid.clone());
            }
        }
    }
}
