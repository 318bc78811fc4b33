use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};

use super::schema::reaction;
use super::PortalKey;

/// A reaction keyed by `(message, part, sender, emoji id)`. Networks that
/// identify reactions by the emoji itself leave `emoji_id` empty and use the
/// `emoji` column for matching.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = reaction)]
pub struct Reaction {
    pub chat_id: String,
    pub chat_receiver: String,
    pub message_id: String,
    pub message_part_id: String,
    pub sender_id: String,
    pub sender_mxid: String,
    pub emoji_id: String,
    pub emoji: String,
    pub mxid: String,
    pub timestamp: i64,
    pub metadata: String,
}

impl Default for Reaction {
    fn default() -> Self {
        Self {
            chat_id: String::new(),
            chat_receiver: String::new(),
            message_id: String::new(),
            message_part_id: String::new(),
            sender_id: String::new(),
            sender_mxid: String::new(),
            emoji_id: String::new(),
            emoji: String::new(),
            mxid: String::new(),
            timestamp: 0,
            metadata: String::new(),
        }
    }
}

impl Reaction {
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
}

pub struct ReactionQuery;

macro_rules! impl_reaction_query_for_conn {
    (
        $get_by_id:ident,
        $get_by_id_without_part:ident,
        $get_by_mxid:ident,
        $get_all_by_sender:ident,
        $get_all_to_message:ident,
        $get_all_to_part:ident,
        $upsert:ident,
        $delete:ident,
        $conn_ty:ty
    ) => {
        pub fn $get_by_id(
            conn: &mut $conn_ty,
            message_id: &str,
            part_id: &str,
            sender_id: &str,
            emoji_id: &str,
        ) -> Result<Option<Reaction>> {
            let item = reaction::table
                .select(Reaction::as_select())
                .filter(reaction::message_id.eq(message_id))
                .filter(reaction::message_part_id.eq(part_id))
                .filter(reaction::sender_id.eq(sender_id))
                .filter(reaction::emoji_id.eq(emoji_id))
                .first(conn)
                .optional()?;
            Ok(item)
        }

        pub fn $get_by_id_without_part(
            conn: &mut $conn_ty,
            message_id: &str,
            sender_id: &str,
            emoji_id: &str,
        ) -> Result<Option<Reaction>> {
            let item = reaction::table
                .select(Reaction::as_select())
                .filter(reaction::message_id.eq(message_id))
                .filter(reaction::sender_id.eq(sender_id))
                .filter(reaction::emoji_id.eq(emoji_id))
                .order(reaction::message_part_id.asc())
                .first(conn)
                .optional()?;
            Ok(item)
        }

        pub fn $get_by_mxid(conn: &mut $conn_ty, mxid: &str) -> Result<Option<Reaction>> {
            let item = reaction::table
                .select(Reaction::as_select())
                .filter(reaction::mxid.eq(mxid))
                .first(conn)
                .optional()?;
            Ok(item)
        }

        pub fn $get_all_by_sender(
            conn: &mut $conn_ty,
            message_id: &str,
            sender_id: &str,
        ) -> Result<Vec<Reaction>> {
            let items = reaction::table
                .select(Reaction::as_select())
                .filter(reaction::message_id.eq(message_id))
                .filter(reaction::sender_id.eq(sender_id))
                .order(reaction::timestamp.asc())
                .load(conn)?;
            Ok(items)
        }

        pub fn $get_all_to_message(conn: &mut $conn_ty, message_id: &str) -> Result<Vec<Reaction>> {
            let items = reaction::table
                .select(Reaction::as_select())
                .filter(reaction::message_id.eq(message_id))
                .order(reaction::timestamp.asc())
                .load(conn)?;
            Ok(items)
        }

        pub fn $get_all_to_part(
            conn: &mut $conn_ty,
            message_id: &str,
            part_id: &str,
        ) -> Result<Vec<Reaction>> {
            let items = reaction::table
                .select(Reaction::as_select())
                .filter(reaction::message_id.eq(message_id))
                .filter(reaction::message_part_id.eq(part_id))
                .order(reaction::timestamp.asc())
                .load(conn)?;
            Ok(items)
        }

        pub fn $upsert(conn: &mut $conn_ty, item: &Reaction) -> Result<()> {
            diesel::insert_into(reaction::table)
                .values(item)
                .on_conflict((
                    reaction::chat_id,
                    reaction::chat_receiver,
                    reaction::message_id,
                    reaction::message_part_id,
                    reaction::sender_id,
                    reaction::emoji_id,
                ))
                .do_update()
                .set((
                    reaction::sender_mxid.eq(&item.sender_mxid),
                    reaction::emoji.eq(&item.emoji),
                    reaction::mxid.eq(&item.mxid),
                    reaction::timestamp.eq(item.timestamp),
                    reaction::metadata.eq(&item.metadata),
                ))
                .execute(conn)?;
            Ok(())
        }

        pub fn $delete(conn: &mut $conn_ty, item: &Reaction) -> Result<()> {
            diesel::delete(
                reaction::table
                    .filter(reaction::chat_id.eq(&item.chat_id))
                    .filter(reaction::chat_receiver.eq(&item.chat_receiver))
                    .filter(reaction::message_id.eq(&item.message_id))
                    .filter(reaction::message_part_id.eq(&item.message_part_id))
                    .filter(reaction::sender_id.eq(&item.sender_id))
                    .filter(reaction::emoji_id.eq(&item.emoji_id)),
            )
            .execute(conn)?;
            Ok(())
        }
    };
}

impl ReactionQuery {
    impl_reaction_query_for_conn!(
        get_by_id_sqlite,
        get_by_id_without_part_sqlite,
        get_by_mxid_sqlite,
        get_all_by_sender_sqlite,
        get_all_to_message_sqlite,
        get_all_to_part_sqlite,
        upsert_sqlite,
        delete_sqlite,
        SqliteConnection
    );

    impl_reaction_query_for_conn!(
        get_by_id_postgres,
        get_by_id_without_part_postgres,
        get_by_mxid_postgres,
        get_all_by_sender_postgres,
        get_all_to_message_postgres,
        get_all_to_part_postgres,
        upsert_postgres,
        delete_postgres,
        PgConnection
    );
}
