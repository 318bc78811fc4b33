mod common;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::json;

use matrix_bridge_core::database::{PortalKey, Reaction, RoomType};
use matrix_bridge_core::network::{
    ChatInfo, ChatInfoChange, ChatMember, ChatMemberList, EventSender, ReactionSyncData,
    ReactionSyncUser, RoomCapabilities, SyncedReaction,
};
use matrix_bridge_core::matrix::MemberContent;

use common::*;

#[tokio::test]
async fn test_echo_correlation() {
    let h = harness_with(MockClient::text_network()).await;
    let portal = make_portal(&h, "chat1", true).await;
    let key = PortalKey::id_only("chat1");

    h.client.set_pending("txn-42");
    portal.enqueue_matrix_event(text_event("!chat1:test", "$orig", "hi"), Arc::clone(&h.user));
    wait_until(|| h.client.messages.lock().unwrap().len() == 1).await;

    // Pending send: nothing persisted, no status yet.
    assert!(h.env.statuses().is_empty());
    assert!(h.bridge.db.get_message_parts("", "f-7").await.unwrap().is_empty());

    let echo_ts = Utc.timestamp_millis_opt(1_700_000_100_000).single().unwrap();
    portal.enqueue_remote_event(
        Box::new(TestRemoteMessage::echo("f-7", "txn-42", echo_ts)),
        Arc::clone(&h.login),
    );
    wait_until(|| !h.env.statuses().is_empty()).await;

    let statuses = h.env.statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].0, "$orig");
    assert!(statuses[0].1, "echo should report success");

    let parts = h.bridge.db.get_message_parts("", "f-7").await.unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].mxid, "$orig");
    assert_eq!(parts[0].part_id, "");
    assert_eq!(parts[0].timestamp, 1_700_000_100_000);
    assert_eq!(parts[0].key(), key);

    // A second event with the same transaction id is no longer an echo; it
    // falls through to the duplicate check and is dropped.
    let sends_before = h.env.sent_messages().len();
    portal.enqueue_remote_event(
        Box::new(TestRemoteMessage::echo("f-7", "txn-42", echo_ts)),
        Arc::clone(&h.login),
    );
    settle().await;
    assert_eq!(h.env.sent_messages().len(), sends_before);
    assert_eq!(h.env.statuses().len(), 1);
}

#[tokio::test]
async fn test_reaction_overwrite() {
    let mut client = MockClient::text_network();
    client.support_reactions = true;
    client.caps.reactions = true;
    let h = harness_with(client).await;
    let portal = make_portal(&h, "chat2", true).await;
    let key = portal.key().clone();

    insert_message(&h, &key, "m1", "", "$m1", "bob-remote", 1_000).await;
    let mut existing = Reaction {
        message_id: "m1".to_string(),
        sender_id: "alice-remote".to_string(),
        sender_mxid: "@alice:test".to_string(),
        emoji: "👍".to_string(),
        mxid: "$e1".to_string(),
        timestamp: 1_000,
        ..Default::default()
    };
    existing.set_key(&key);
    h.bridge.db.upsert_reaction(&existing).await.unwrap();

    portal.enqueue_matrix_event(
        matrix_event(
            "!chat2:test",
            "$react1",
            "m.reaction",
            json!({ "m.relates_to": { "rel_type": "m.annotation", "event_id": "$m1", "key": "❤️" } }),
        ),
        Arc::clone(&h.user),
    );
    wait_until(|| !h.env.statuses().is_empty()).await;

    assert_eq!(h.env.redactions(), vec!["$e1".to_string()]);
    let updated = h
        .bridge
        .db
        .get_reaction("m1", "", "alice-remote", "")
        .await
        .unwrap()
        .expect("reaction row should exist");
    assert_eq!(updated.emoji, "❤️");
    assert_eq!(updated.mxid, "$react1");
    let statuses = h.env.statuses();
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].1);
}

#[tokio::test]
async fn test_reaction_rolling_cap() {
    let mut client = MockClient::text_network();
    client.support_reactions = true;
    client.caps.reactions = true;
    client.emoji_as_id = true;
    client.max_reactions = 3;
    let h = harness_with(client).await;
    let portal = make_portal(&h, "chat3", true).await;
    let key = portal.key().clone();

    insert_message(&h, &key, "m2", "", "$m2", "bob-remote", 1_000).await;
    for (emoji, mxid, ts) in [("a", "$ra", 1_i64), ("b", "$rb", 2), ("c", "$rc", 3)] {
        let mut reaction = Reaction {
            message_id: "m2".to_string(),
            sender_id: "alice-remote".to_string(),
            sender_mxid: "@alice:test".to_string(),
            emoji_id: emoji.to_string(),
            emoji: emoji.to_string(),
            mxid: mxid.to_string(),
            timestamp: ts,
            ..Default::default()
        };
        reaction.set_key(&key);
        h.bridge.db.upsert_reaction(&reaction).await.unwrap();
    }

    portal.enqueue_matrix_event(
        matrix_event(
            "!chat3:test",
            "$react2",
            "m.reaction",
            json!({ "m.relates_to": { "rel_type": "m.annotation", "event_id": "$m2", "key": "d" } }),
        ),
        Arc::clone(&h.user),
    );
    wait_until(|| !h.env.statuses().is_empty()).await;

    // The oldest reaction is dropped to stay at the cap of three.
    assert_eq!(h.env.redactions(), vec!["$ra".to_string()]);
    let remaining = h
        .bridge
        .db
        .get_reactions_by_sender("m2", "alice-remote")
        .await
        .unwrap();
    let mut ids: Vec<String> = remaining.iter().map(|r| r.emoji_id.clone()).collect();
    ids.sort();
    assert_eq!(ids, vec!["b", "c", "d"]);
}

#[tokio::test]
async fn test_reply_to_thread_fallback() {
    let mut client = MockClient::text_network();
    client.caps = RoomCapabilities {
        threads: true,
        replies: false,
        ..Default::default()
    };
    let h = harness_with(client).await;
    let portal = make_portal(&h, "chat4", true).await;
    let key = portal.key().clone();

    insert_message(&h, &key, "m0", "", "$m0", "bob-remote", 1_000).await;

    portal.enqueue_matrix_event(
        matrix_event(
            "!chat4:test",
            "$reply",
            "m.room.message",
            json!({
                "msgtype": "m.text",
                "body": "re",
                "m.relates_to": { "m.in_reply_to": { "event_id": "$m0" } }
            }),
        ),
        Arc::clone(&h.user),
    );
    wait_until(|| !h.client.messages.lock().unwrap().is_empty()).await;

    let dispatched = h.client.messages.lock().unwrap();
    let msg = &dispatched[0];
    // A reply on a threads-only network becomes a thread continuation whose
    // root is the reply target.
    let thread_root = msg.thread_root.as_ref().expect("thread root should be set");
    assert_eq!(thread_root.id, "m0");
    assert!(msg.reply_to.is_none());
    drop(dispatched);

    wait_until(|| !h.env.statuses().is_empty()).await;
    let parts = h.bridge.db.get_message_parts("", "rm-$reply").await.unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].thread_root_id, "m0");
}

#[tokio::test]
async fn test_duplicate_remote_message_ignored() {
    let h = harness_with(MockClient::text_network()).await;
    let portal = make_portal(&h, "chat5", true).await;
    let key = portal.key().clone();

    insert_message(&h, &key, "f-9", "0", "$p0", "bob-remote", 1_000).await;
    insert_message(&h, &key, "f-9", "1", "$p1", "bob-remote", 1_000).await;

    portal.enqueue_remote_event(
        Box::new(TestRemoteMessage::text("f-9", "bob-remote", "again")),
        Arc::clone(&h.login),
    );
    settle().await;

    assert!(h.env.sent_messages().is_empty());
    let parts = h.bridge.db.get_message_parts("", "f-9").await.unwrap();
    assert_eq!(parts.len(), 2);
}

#[tokio::test]
async fn test_edit_capability_rejected() {
    let h = harness_with(MockClient::text_network()).await;
    let portal = make_portal(&h, "chat6", true).await;
    let key = portal.key().clone();
    insert_message(&h, &key, "m3", "", "$m3", "alice-remote", 1_000).await;

    portal.enqueue_matrix_event(
        matrix_event(
            "!chat6:test",
            "$edit",
            "m.room.message",
            json!({
                "msgtype": "m.text",
                "body": "* fixed",
                "m.relates_to": { "rel_type": "m.replace", "event_id": "$m3" },
                "m.new_content": { "msgtype": "m.text", "body": "fixed" }
            }),
        ),
        Arc::clone(&h.user),
    );
    wait_until(|| !h.env.statuses().is_empty()).await;

    let statuses = h.env.statuses();
    assert_eq!(statuses.len(), 1);
    assert!(!statuses[0].1);
    assert!(statuses[0].2.contains("Edits are not supported"));
    assert!(h.client.edits.lock().unwrap().is_empty());
    assert!(h.client.messages.lock().unwrap().is_empty());
    let target = h.bridge.db.get_message_part_by_mxid("$m3").await.unwrap().unwrap();
    assert_eq!(target.edit_count, 0);
}

#[tokio::test]
async fn test_per_portal_ordering() {
    let h = harness_with(MockClient::text_network()).await;
    let portal = make_portal(&h, "chat7", true).await;

    portal.enqueue_remote_event(
        Box::new(TestRemoteMessage::text("f-1", "bob-remote", "one")),
        Arc::clone(&h.login),
    );
    portal.enqueue_remote_event(
        Box::new(TestRemoteMessage::text("f-2", "bob-remote", "two")),
        Arc::clone(&h.login),
    );
    wait_until(|| h.env.sent_messages().len() >= 2).await;

    let bodies: Vec<String> = h
        .env
        .sent_messages()
        .into_iter()
        .filter_map(|c| match c {
            MatrixCall::SendMessage { content, .. } => content
                .get("body")
                .and_then(|b| b.as_str())
                .map(str::to_string),
            _ => None,
        })
        .collect();
    assert_eq!(bodies, vec!["one".to_string(), "two".to_string()]);

    // Both messages were sent by the ghost puppet of the remote sender.
    for call in h.env.sent_messages() {
        if let MatrixCall::SendMessage { sender, .. } = call {
            assert_eq!(sender, "@ghost_bob-remote:test");
        }
    }
}

#[tokio::test]
async fn test_room_create_idempotence() {
    let mut client = MockClient::text_network();
    client.chat_info = std::sync::Mutex::new(ChatInfo {
        name: Some("Chat One".to_string()),
        room_type: Some(RoomType::Dm),
        members: Some(ChatMemberList {
            is_full: true,
            other_user_id: Some("bob-remote".to_string()),
            members: vec![
                ChatMember {
                    sender: EventSender::remote("bob-remote"),
                    ..Default::default()
                },
                ChatMember {
                    sender: EventSender::from_me("alice-remote"),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }),
        ..Default::default()
    });
    let h = harness_with(client).await;
    let portal = make_portal(&h, "chat8", false).await;

    let (first, second) = tokio::join!(
        portal.create_matrix_room(&h.login, None),
        portal.create_matrix_room(&h.login, None),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(h.env.create_room_count(), 1);
    assert!(portal.mxid().is_some());
    assert_eq!(portal.other_user_id().as_deref(), Some("bob-remote"));

    // A later call is a no-op.
    portal.create_matrix_room(&h.login, None).await.unwrap();
    assert_eq!(h.env.create_room_count(), 1);
}

#[tokio::test]
async fn test_reaction_sync_removes_stale() {
    let h = harness_with(MockClient::text_network()).await;
    let portal = make_portal(&h, "chat9", true).await;
    let key = portal.key().clone();

    insert_message(&h, &key, "m4", "", "$m4", "bob-remote", 1_000).await;
    for (emoji_id, mxid) in [("x", "$rx"), ("y", "$ry")] {
        let mut reaction = Reaction {
            message_id: "m4".to_string(),
            sender_id: "bob-remote".to_string(),
            sender_mxid: "@ghost_bob-remote:test".to_string(),
            emoji_id: emoji_id.to_string(),
            emoji: emoji_id.to_string(),
            mxid: mxid.to_string(),
            timestamp: 1_000,
            ..Default::default()
        };
        reaction.set_key(&key);
        h.bridge.db.upsert_reaction(&reaction).await.unwrap();
    }

    let mut data = ReactionSyncData {
        has_all_users: false,
        ..Default::default()
    };
    data.users.insert(
        "bob-remote".to_string(),
        ReactionSyncUser {
            reactions: vec![SyncedReaction {
                sender: EventSender::remote("bob-remote"),
                emoji_id: "x".to_string(),
                emoji: "x".to_string(),
                ..Default::default()
            }],
            has_all_reactions: true,
            max_count: 0,
        },
    );
    portal.enqueue_remote_event(
        Box::new(TestRemoteReactionSync {
            target: "m4".to_string(),
            sender: EventSender::remote("bob-remote"),
            data,
        }),
        Arc::clone(&h.login),
    );
    wait_until(|| !h.env.redactions().is_empty()).await;

    assert_eq!(h.env.redactions(), vec!["$ry".to_string()]);
    let remaining = h.bridge.db.get_reactions_to_message("m4").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].emoji_id, "x");
}

#[tokio::test]
async fn test_remote_message_remove() {
    let h = harness_with(MockClient::text_network()).await;
    let portal = make_portal(&h, "chat10", true).await;
    let key = portal.key().clone();

    insert_message(&h, &key, "f-3", "0", "$q0", "bob-remote", 1_000).await;
    insert_message(&h, &key, "f-3", "1", "$q1", "bob-remote", 1_000).await;

    portal.enqueue_remote_event(
        Box::new(TestRemoteMessageRemove {
            target: "f-3".to_string(),
            sender: EventSender::remote("bob-remote"),
        }),
        Arc::clone(&h.login),
    );
    wait_until(|| h.env.redactions().len() >= 2).await;

    let mut redacted = h.env.redactions();
    redacted.sort();
    assert_eq!(redacted, vec!["$q0".to_string(), "$q1".to_string()]);
    assert!(h.bridge.db.get_message_parts("", "f-3").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_member_sync_prunes_stale_members() {
    let h = harness_with(MockClient::text_network()).await;
    let portal = make_portal(&h, "chat11", true).await;

    {
        let mut members = h.env.members.lock().unwrap();
        members.insert("@alice:test".to_string(), MemberContent::new("join"));
        members.insert("@ghost_stale:test".to_string(), MemberContent::new("join"));
        members.insert("@charlie:test".to_string(), MemberContent::new("join"));
    }

    let change = ChatInfoChange {
        chat_info: None,
        member_changes: Some(ChatMemberList {
            is_full: true,
            members: vec![
                ChatMember {
                    sender: EventSender::remote("bob-remote"),
                    ..Default::default()
                },
                ChatMember {
                    sender: EventSender::from_me("alice-remote"),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }),
    };
    portal.enqueue_remote_event(
        Box::new(TestMemberSync {
            sender: EventSender::remote("bob-remote"),
            change,
        }),
        Arc::clone(&h.login),
    );
    settle().await;

    let mut invited = Vec::new();
    let mut removed = Vec::new();
    for call in h.env.calls() {
        if let MatrixCall::SendState {
            event_type,
            state_key,
            content,
            ..
        } = call
        {
            if event_type != "m.room.member" {
                continue;
            }
            match content.get("membership").and_then(|m| m.as_str()) {
                Some("invite") => invited.push(state_key),
                Some("leave") => removed.push(state_key),
                _ => {}
            }
        }
    }
    assert!(invited.contains(&"@ghost_bob-remote:test".to_string()));
    removed.sort();
    assert_eq!(
        removed,
        vec!["@charlie:test".to_string(), "@ghost_stale:test".to_string()]
    );
}

#[tokio::test]
async fn test_matrix_typing_diff() {
    let mut client = MockClient::text_network();
    client.support_typing = true;
    let h = harness_with(client).await;
    let portal = make_portal(&h, "chat12", true).await;

    portal.enqueue_matrix_event(
        matrix_event(
            "!chat12:test",
            "",
            "m.typing",
            json!({ "user_ids": ["@alice:test"] }),
        ),
        Arc::clone(&h.user),
    );
    wait_until(|| h.client.typing_calls.lock().unwrap().len() == 1).await;

    portal.enqueue_matrix_event(
        matrix_event("!chat12:test", "", "m.typing", json!({ "user_ids": [] })),
        Arc::clone(&h.user),
    );
    wait_until(|| h.client.typing_calls.lock().unwrap().len() == 2).await;

    assert_eq!(*h.client.typing_calls.lock().unwrap(), vec![true, false]);
}

#[tokio::test]
async fn test_matrix_read_receipt_watermark() {
    let mut client = MockClient::text_network();
    client.support_read_receipts = true;
    let h = harness_with(client).await;
    let portal = make_portal(&h, "chat13", true).await;
    let key = portal.key().clone();

    insert_message(&h, &key, "f-5", "", "$m5", "bob-remote", 5_000).await;

    portal.enqueue_matrix_event(
        matrix_event(
            "!chat13:test",
            "",
            "m.receipt",
            json!({ "$m5": { "m.read": { "@alice:test": { "ts": 6_000 } } } }),
        ),
        Arc::clone(&h.user),
    );
    wait_until(|| !h.client.receipts.lock().unwrap().is_empty()).await;
    wait_until(|| !h.scheduler.started.lock().unwrap().is_empty()).await;

    let receipts = h.client.receipts.lock().unwrap();
    assert_eq!(receipts.len(), 1);
    assert_eq!(
        receipts[0].exact_message.as_ref().map(|m| m.mxid.clone()),
        Some("$m5".to_string())
    );
    drop(receipts);

    let row = h
        .bridge
        .db
        .get_user_portal("login1", &key)
        .await
        .unwrap()
        .expect("user portal row should exist");
    assert_eq!(row.last_read, 5_000);
    assert_eq!(*h.scheduler.started.lock().unwrap(), vec!["!chat13:test".to_string()]);
}

#[tokio::test]
async fn test_disappearing_enqueue_after_send() {
    let h = harness_with(MockClient::text_network()).await;
    let key = PortalKey::id_only("chat14");
    let mut row = matrix_bridge_core::database::Portal::new(&key);
    row.mxid = Some("!chat14:test".to_string());
    row.disappear_type = "after_send".to_string();
    row.disappear_timer = 60_000;
    h.bridge.db.insert_portal(&row).await.unwrap();
    h.bridge
        .db
        .put_user_portal(&matrix_bridge_core::database::UserPortal::new(
            "login1",
            "@alice:test",
            &key,
        ))
        .await
        .unwrap();
    let portal = h.bridge.get_portal_by_key(&key).await.unwrap();

    portal.enqueue_matrix_event(text_event("!chat14:test", "$dis", "bye"), Arc::clone(&h.user));
    wait_until(|| !h.scheduler.enqueued.lock().unwrap().is_empty()).await;

    let enqueued = h.scheduler.enqueued.lock().unwrap();
    assert_eq!(enqueued.len(), 1);
    assert_eq!(enqueued[0].event_mxid, "$dis");
    assert_eq!(enqueued[0].timer, 60_000);
    assert_eq!(enqueued[0].disappear_at, Some(1_700_000_000_000 + 60_000));
}

#[tokio::test]
async fn test_remote_reaction_duplicate_ignored() {
    let h = harness_with(MockClient::text_network()).await;
    let portal = make_portal(&h, "chat15", true).await;
    let key = portal.key().clone();

    insert_message(&h, &key, "m6", "", "$m6", "bob-remote", 1_000).await;
    let mut existing = Reaction {
        message_id: "m6".to_string(),
        sender_id: "bob-remote".to_string(),
        sender_mxid: "@ghost_bob-remote:test".to_string(),
        emoji_id: "z".to_string(),
        emoji: "z".to_string(),
        mxid: "$rz".to_string(),
        timestamp: 1_000,
        ..Default::default()
    };
    existing.set_key(&key);
    h.bridge.db.upsert_reaction(&existing).await.unwrap();

    portal.enqueue_remote_event(
        Box::new(TestRemoteReaction {
            target: "m6".to_string(),
            sender: EventSender::remote("bob-remote"),
            emoji: "z".to_string(),
            emoji_id: "z".to_string(),
        }),
        Arc::clone(&h.login),
    );
    settle().await;

    assert!(h.env.sent_messages().is_empty());
    assert!(h.env.redactions().is_empty());
}
