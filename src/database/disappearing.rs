use std::time::Duration;

use anyhow::Result;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};

use super::schema::{backfill_task, disappearing_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisappearingType {
    None,
    AfterRead,
    AfterSend,
}

impl Default for DisappearingType {
    fn default() -> Self {
        Self::None
    }
}

impl DisappearingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::AfterRead => "after_read",
            Self::AfterSend => "after_send",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "after_read" => Self::AfterRead,
            "after_send" => Self::AfterSend,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisappearingSetting {
    pub disappear_type: DisappearingType,
    pub timer: Duration,
}

impl DisappearingSetting {
    pub fn is_enabled(&self) -> bool {
        self.disappear_type != DisappearingType::None && !self.timer.is_zero()
    }
}

/// A scheduled deletion owned by the disappearing-message scheduler once
/// enqueued. `disappear_at` stays unset for after-read timers until the
/// read receipt arrives.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = disappearing_message)]
pub struct DisappearingMessage {
    pub room_mxid: String,
    pub event_mxid: String,
    pub disappear_type: String,
    pub timer: i64,
    pub disappear_at: Option<i64>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = backfill_task)]
pub struct BackfillTask {
    pub chat_id: String,
    pub chat_receiver: String,
    pub login_id: String,
    pub next_dispatch_min_ts: i64,
    pub completed: bool,
}

pub struct DisappearingQuery;

macro_rules! impl_disappearing_query_for_conn {
    ($upsert:ident, $conn_ty:ty) => {
        pub fn $upsert(conn: &mut $conn_ty, item: &DisappearingMessage) -> Result<()> {
            diesel::insert_into(disappearing_message::table)
                .values(item)
                .on_conflict((
                    disappearing_message::room_mxid,
                    disappearing_message::event_mxid,
                ))
                .do_update()
                .set((
                    disappearing_message::disappear_type.eq(&item.disappear_type),
                    disappearing_message::timer.eq(item.timer),
                    disappearing_message::disappear_at.eq(item.disappear_at),
                ))
                .execute(conn)?;
            Ok(())
        }
    };
}

impl DisappearingQuery {
    impl_disappearing_query_for_conn!(upsert_sqlite, SqliteConnection);
    impl_disappearing_query_for_conn!(upsert_postgres, PgConnection);
}

pub struct BackfillQuery;

macro_rules! impl_backfill_query_for_conn {
    ($upsert:ident, $conn_ty:ty) => {
        pub fn $upsert(conn: &mut $conn_ty, item: &BackfillTask) -> Result<()> {
            diesel::insert_into(backfill_task::table)
                .values(item)
                .on_conflict((
                    backfill_task::chat_id,
                    backfill_task::chat_receiver,
                    backfill_task::login_id,
                ))
                .do_update()
                .set(backfill_task::next_dispatch_min_ts.eq(item.next_dispatch_min_ts))
                .execute(conn)?;
            Ok(())
        }
    };
}

impl BackfillQuery {
    impl_backfill_query_for_conn!(upsert_sqlite, SqliteConnection);
    impl_backfill_query_for_conn!(upsert_postgres, PgConnection);
}
