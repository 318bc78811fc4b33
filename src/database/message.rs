use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};

use super::schema::message;
use super::PortalKey;

const FAKE_MXID_PREFIX: &str = "$fake::";

/// One Matrix-side part of a remote message. A single remote message may
/// produce several parts, each with its own Matrix event id.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = message)]
#[diesel(treat_none_as_null = true)]
pub struct Message {
    pub chat_id: String,
    pub chat_receiver: String,
    pub id: String,
    pub part_id: String,
    pub mxid: String,
    pub sender_id: String,
    pub sender_mxid: String,
    pub timestamp: i64,
    pub edit_count: i32,
    pub thread_root_id: String,
    pub reply_to_id: Option<String>,
    pub reply_to_part_id: Option<String>,
    pub metadata: String,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            chat_id: String::new(),
            chat_receiver: String::new(),
            id: String::new(),
            part_id: String::new(),
            mxid: String::new(),
            sender_id: String::new(),
            sender_mxid: String::new(),
            timestamp: 0,
            edit_count: 0,
            thread_root_id: String::new(),
            reply_to_id: None,
            reply_to_part_id: None,
            metadata: String::new(),
        }
    }
}

impl Message {
    pub fn key(&self) -> PortalKey {
        PortalKey::new(&self.chat_id, &self.chat_receiver)
    }

    pub fn set_key(&mut self, key: &PortalKey) {
        self.chat_id = key.id.clone();
        self.chat_receiver = key.receiver.clone();
    }

    pub fn timestamp_time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn set_timestamp(&mut self, ts: DateTime<Utc>) {
        self.timestamp = ts.timestamp_millis();
    }

    /// Marks the part as tracked but not actually present on the Matrix side.
    pub fn set_fake_mxid(&mut self) {
        self.mxid = format!("{}{}:{}", FAKE_MXID_PREFIX, self.id, self.part_id);
    }

    pub fn has_fake_mxid(&self) -> bool {
        self.mxid.starts_with(FAKE_MXID_PREFIX)
    }
}

pub struct MessageQuery;

macro_rules! impl_message_query_for_conn {
    (
        $get_part_by_mxid:ident,
        $get_all_parts:ident,
        $get_first_part:ident,
        $get_part:ident,
        $get_last_part:ident,
        $get_first_by_thread:ident,
        $get_last_by_thread:ident,
        $get_last_before:ident,
        $insert:ident,
        $update:ident,
        $delete_all_parts:ident,
        $delete_part:ident,
        $conn_ty:ty
    ) => {
        pub fn $get_part_by_mxid(conn: &mut $conn_ty, mxid: &str) -> Result<Option<Message>> {
            let item = message::table
                .select(Message::as_select())
                .filter(message::mxid.eq(mxid))
                .first(conn)
                .optional()?;
            Ok(item)
        }

        pub fn $get_all_parts(
            conn: &mut $conn_ty,
            receiver: &str,
            id: &str,
        ) -> Result<Vec<Message>> {
            let items = message::table
                .select(Message::as_select())
                .filter(
                    message::chat_receiver
                        .eq(receiver)
                        .or(message::chat_receiver.eq("")),
                )
                .filter(message::id.eq(id))
                .order(message::part_id.asc())
                .load(conn)?;
            Ok(items)
        }

        pub fn $get_first_part(
            conn: &mut $conn_ty,
            receiver: &str,
            id: &str,
        ) -> Result<Option<Message>> {
            let item = message::table
                .select(Message::as_select())
                .filter(
                    message::chat_receiver
                        .eq(receiver)
                        .or(message::chat_receiver.eq("")),
                )
                .filter(message::id.eq(id))
                .order(message::part_id.asc())
                .first(conn)
                .optional()?;
            Ok(item)
        }

        pub fn $get_part(
            conn: &mut $conn_ty,
            receiver: &str,
            id: &str,
            part_id: &str,
        ) -> Result<Option<Message>> {
            let item = message::table
                .select(Message::as_select())
                .filter(
                    message::chat_receiver
                        .eq(receiver)
                        .or(message::chat_receiver.eq("")),
                )
                .filter(message::id.eq(id))
                .filter(message::part_id.eq(part_id))
                .first(conn)
                .optional()?;
            Ok(item)
        }

        pub fn $get_last_part(
            conn: &mut $conn_ty,
            receiver: &str,
            id: &str,
        ) -> Result<Option<Message>> {
            let item = message::table
                .select(Message::as_select())
                .filter(
                    message::chat_receiver
                        .eq(receiver)
                        .or(message::chat_receiver.eq("")),
                )
                .filter(message::id.eq(id))
                .order(message::part_id.desc())
                .first(conn)
                .optional()?;
            Ok(item)
        }

        pub fn $get_first_by_thread(
            conn: &mut $conn_ty,
            key: &PortalKey,
            thread_root: &str,
        ) -> Result<Option<Message>> {
            let item = message::table
                .select(Message::as_select())
                .filter(message::chat_id.eq(&key.id))
                .filter(message::chat_receiver.eq(&key.receiver))
                .filter(message::id.eq(thread_root))
                .order(message::part_id.asc())
                .first(conn)
                .optional()?;
            Ok(item)
        }

        pub fn $get_last_by_thread(
            conn: &mut $conn_ty,
            key: &PortalKey,
            thread_root: &str,
        ) -> Result<Option<Message>> {
            let item = message::table
                .select(Message::as_select())
                .filter(message::chat_id.eq(&key.id))
                .filter(message::chat_receiver.eq(&key.receiver))
                .filter(message::thread_root_id.eq(thread_root))
                .order((message::timestamp.desc(), message::part_id.desc()))
                .first(conn)
                .optional()?;
            Ok(item)
        }

        pub fn $get_last_before(
            conn: &mut $conn_ty,
            key: &PortalKey,
            max_ts: i64,
        ) -> Result<Option<Message>> {
            let item = message::table
                .select(Message::as_select())
                .filter(message::chat_id.eq(&key.id))
                .filter(message::chat_receiver.eq(&key.receiver))
                .filter(message::timestamp.le(max_ts))
                .order((message::timestamp.desc(), message::part_id.desc()))
                .first(conn)
                .optional()?;
            Ok(item)
        }

        pub fn $insert(conn: &mut $conn_ty, item: &Message) -> Result<()> {
            diesel::insert_into(message::table)
                .values(item)
                .execute(conn)?;
            Ok(())
        }

        pub fn $update(conn: &mut $conn_ty, item: &Message) -> Result<()> {
            diesel::update(
                message::table
                    .filter(message::chat_id.eq(&item.chat_id))
                    .filter(message::chat_receiver.eq(&item.chat_receiver))
                    .filter(message::id.eq(&item.id))
                    .filter(message::part_id.eq(&item.part_id)),
            )
            .set(item)
            .execute(conn)?;
            Ok(())
        }

        pub fn $delete_all_parts(conn: &mut $conn_ty, receiver: &str, id: &str) -> Result<()> {
            diesel::delete(
                message::table
                    .filter(
                        message::chat_receiver
                            .eq(receiver)
                            .or(message::chat_receiver.eq("")),
                    )
                    .filter(message::id.eq(id)),
            )
            .execute(conn)?;
            Ok(())
        }

        pub fn $delete_part(
            conn: &mut $conn_ty,
            receiver: &str,
            id: &str,
            part_id: &str,
        ) -> Result<()> {
            diesel::delete(
                message::table
                    .filter(
                        message::chat_receiver
                            .eq(receiver)
                            .or(message::chat_receiver.eq("")),
                    )
                    .filter(message::id.eq(id))
                    .filter(message::part_id.eq(part_id)),
            )
            .execute(conn)?;
            Ok(())
        }
    };
}

impl MessageQuery {
    impl_message_query_for_conn!(
        get_part_by_mxid_sqlite,
        get_all_parts_sqlite,
        get_first_part_sqlite,
        get_part_sqlite,
        get_last_part_sqlite,
        get_first_by_thread_sqlite,
        get_last_by_thread_sqlite,
        get_last_before_sqlite,
        insert_sqlite,
        update_sqlite,
        delete_all_parts_sqlite,
        delete_part_sqlite,
        SqliteConnection
    );

    impl_message_query_for_conn!(
        get_part_by_mxid_postgres,
        get_all_parts_postgres,
        get_first_part_postgres,
        get_part_postgres,
        get_last_part_postgres,
        get_first_by_thread_postgres,
        get_last_by_thread_postgres,
        get_last_before_postgres,
        insert_postgres,
        update_postgres,
        delete_all_parts_postgres,
        delete_part_postgres,
        PgConnection
    );
}
