diesel::table! {
    portal (id, receiver) {
        id -> Text,
        receiver -> Text,
        mxid -> Nullable<Text>,
        name -> Text,
        name_set -> Bool,
        topic -> Text,
        topic_set -> Bool,
        avatar_id -> Text,
        avatar_mxc -> Text,
        avatar_hash -> Text,
        avatar_set -> Bool,
        name_is_custom -> Bool,
        room_type -> Text,
        parent_id -> Nullable<Text>,
        in_space -> Bool,
        other_user_id -> Nullable<Text>,
        relay_login_id -> Nullable<Text>,
        disappear_type -> Text,
        disappear_timer -> BigInt,
        metadata -> Text,
    }
}

diesel::table! {
    message (chat_id, chat_receiver, id, part_id) {
        chat_id -> Text,
        chat_receiver -> Text,
        id -> Text,
        part_id -> Text,
        mxid -> Text,
        sender_id -> Text,
        sender_mxid -> Text,
        timestamp -> BigInt,
        edit_count -> Integer,
        thread_root_id -> Text,
        reply_to_id -> Nullable<Text>,
        reply_to_part_id -> Nullable<Text>,
        metadata -> Text,
    }
}

diesel::table! {
    reaction (chat_id, chat_receiver, message_id, message_part_id, sender_id, emoji_id) {
        chat_id -> Text,
        chat_receiver -> Text,
        message_id -> Text,
        message_part_id -> Text,
        sender_id -> Text,
        sender_mxid -> Text,
        emoji_id -> Text,
        emoji -> Text,
        mxid -> Text,
        timestamp -> BigInt,
        metadata -> Text,
    }
}

diesel::table! {
    user_portal (login_id, chat_id, chat_receiver) {
        login_id -> Text,
        user_mxid -> Text,
        chat_id -> Text,
        chat_receiver -> Text,
        in_space -> Bool,
        in_portal -> Bool,
        last_read -> BigInt,
    }
}

diesel::table! {
    disappearing_message (room_mxid, event_mxid) {
        room_mxid -> Text,
        event_mxid -> Text,
        disappear_type -> Text,
        timer -> BigInt,
        disappear_at -> Nullable<BigInt>,
    }
}

diesel::table! {
    backfill_task (chat_id, chat_receiver, login_id) {
        chat_id -> Text,
        chat_receiver -> Text,
        login_id -> Text,
        next_dispatch_min_ts -> BigInt,
        completed -> Bool,
    }
}

diesel::allow_tables_to_appear_in_same_query!(portal, message, reaction, user_portal);
